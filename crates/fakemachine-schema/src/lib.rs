//! Machine configuration for fakemachine.
//!
//! This crate defines the data handed to a virtualization backend: the
//! `Machine` (memory, vCPUs, console visibility, initrd, disk images and
//! mount points), the builder operations that assign image indices and
//! labels, validation, and TOML machine file parsing (`MachineFile`).

pub mod file;
pub mod machine;

pub use file::{
    parse_machine_file, parse_machine_str, ImageEntry, MachineFile, MachineSection, VolumeEntry,
};
pub use machine::{Image, Machine, MountPoint, DEFAULT_BACKEND, DEFAULT_CPUS, DEFAULT_MEMORY_MIB};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read machine file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse machine file: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("memory must be greater than zero")]
    ZeroMemory,
    #[error("cpu count must be greater than zero")]
    ZeroCpus,
    #[error("no initrd configured")]
    MissingInitrd,
    #[error("duplicate image label '{0}'")]
    DuplicateImageLabel(String),
    #[error("duplicate volume label '{0}'")]
    DuplicateVolumeLabel(String),
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("image label '{0}' may only contain letters, digits, '.', '_' and '-'")]
    InvalidImageLabel(String),
    #[error("image label '{0}' is longer than {max} bytes", max = crate::machine::MAX_IMAGE_LABEL_LEN)]
    ImageLabelTooLong(String),
    #[error("path must not contain ',': '{0}'")]
    CommaInPath(String),
    #[error("guest directory must be absolute: '{0}'")]
    RelativeMachineDirectory(String),
}
