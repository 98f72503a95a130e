use crate::SchemaError;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_MEMORY_MIB: u64 = 2048;
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_BACKEND: &str = "auto";

/// Longest image label that survives as a virtio-blk serial number.
pub const MAX_IMAGE_LABEL_LEN: usize = 20;

/// A virtual disk attached to the guest.
///
/// `index` is the position in the machine's image list and never changes once
/// the image has been added; backends derive guest device names from either
/// the index or the label.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Image {
    pub path: PathBuf,
    pub label: String,
    pub index: usize,
}

/// A host directory exposed inside the guest.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MountPoint {
    pub host_directory: PathBuf,
    pub machine_directory: PathBuf,
    pub label: String,
    /// Always mounted by the init script, independent of user requests.
    pub is_static: bool,
}

/// Everything a backend needs to boot one guest.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Machine {
    memory: u64,
    cpus: u32,
    show_boot: bool,
    initrd_path: PathBuf,
    images: Vec<Image>,
    mounts: Vec<MountPoint>,
    backend: String,
    #[serde(skip)]
    volume_count: usize,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY_MIB,
            cpus: DEFAULT_CPUS,
            show_boot: false,
            initrd_path: PathBuf::new(),
            images: Vec::new(),
            mounts: Vec::new(),
            backend: DEFAULT_BACKEND.to_owned(),
            volume_count: 0,
        }
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(name: impl Into<String>) -> Self {
        Self {
            backend: name.into(),
            ..Self::default()
        }
    }

    /// Memory size in MiB.
    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn show_boot(&self) -> bool {
        self.show_boot
    }

    pub fn initrd_path(&self) -> &Path {
        &self.initrd_path
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn set_memory(&mut self, mib: u64) -> &mut Self {
        self.memory = mib;
        self
    }

    pub fn set_cpus(&mut self, cpus: u32) -> &mut Self {
        self.cpus = cpus;
        self
    }

    pub fn set_show_boot(&mut self, show: bool) -> &mut Self {
        self.show_boot = show;
        self
    }

    pub fn set_initrd(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.initrd_path = path.into();
        self
    }

    pub fn set_backend(&mut self, name: impl Into<String>) -> &mut Self {
        self.backend = name.into();
        self
    }

    /// Attach a disk image. Without a label the image is named
    /// `fakedisk-<index>`.
    pub fn add_image(&mut self, path: impl Into<PathBuf>, label: Option<&str>) -> Image {
        let index = self.images.len();
        let label = label.map_or_else(|| format!("fakedisk-{index}"), str::to_owned);
        let image = Image {
            path: path.into(),
            label,
            index,
        };
        self.images.push(image.clone());
        image
    }

    /// Share `host_directory` at the same path inside the guest.
    pub fn add_volume(&mut self, host_directory: impl Into<PathBuf>) {
        let host_directory = host_directory.into();
        self.add_volume_at(host_directory.clone(), host_directory);
    }

    pub fn add_volume_at(
        &mut self,
        host_directory: impl Into<PathBuf>,
        machine_directory: impl Into<PathBuf>,
    ) {
        let label = format!("virtfs-{}", self.volume_count);
        self.volume_count += 1;
        self.mounts.push(MountPoint {
            host_directory: host_directory.into(),
            machine_directory: machine_directory.into(),
            label,
            is_static: false,
        });
    }

    pub(crate) fn add_labelled_volume(
        &mut self,
        host_directory: PathBuf,
        machine_directory: PathBuf,
        label: String,
    ) {
        self.volume_count += 1;
        self.mounts.push(MountPoint {
            host_directory,
            machine_directory,
            label,
            is_static: false,
        });
    }

    /// Register a mount the init script sets up unconditionally, at the same
    /// path as on the host.
    pub fn add_static_volume(&mut self, directory: impl Into<PathBuf>, label: impl Into<String>) {
        let directory = directory.into();
        self.mounts.push(MountPoint {
            host_directory: directory.clone(),
            machine_directory: directory,
            label: label.into(),
            is_static: true,
        });
    }

    pub fn static_volumes(&self) -> Vec<MountPoint> {
        self.mounts.iter().filter(|m| m.is_static).cloned().collect()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.memory == 0 {
            return Err(SchemaError::ZeroMemory);
        }
        if self.cpus == 0 {
            return Err(SchemaError::ZeroCpus);
        }
        if self.initrd_path.as_os_str().is_empty() {
            return Err(SchemaError::MissingInitrd);
        }

        // Labels and paths end up inside comma-separated device options on
        // the emulator and guest kernel command lines.
        let mut labels = HashSet::new();
        for image in &self.images {
            if image.label.trim().is_empty() {
                return Err(SchemaError::EmptyLabel);
            }
            if !image
                .label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
            {
                return Err(SchemaError::InvalidImageLabel(image.label.clone()));
            }
            if image.label.len() > MAX_IMAGE_LABEL_LEN {
                return Err(SchemaError::ImageLabelTooLong(image.label.clone()));
            }
            reject_comma(&image.path)?;
            if !labels.insert(image.label.as_str()) {
                return Err(SchemaError::DuplicateImageLabel(image.label.clone()));
            }
        }

        let mut labels = HashSet::new();
        for mount in &self.mounts {
            if mount.label.trim().is_empty() {
                return Err(SchemaError::EmptyLabel);
            }
            if !labels.insert(mount.label.as_str()) {
                return Err(SchemaError::DuplicateVolumeLabel(mount.label.clone()));
            }
            reject_comma(&mount.host_directory)?;
            if !mount.machine_directory.is_absolute() {
                return Err(SchemaError::RelativeMachineDirectory(
                    mount.machine_directory.display().to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn reject_comma(path: &Path) -> Result<(), SchemaError> {
    let display = path.display().to_string();
    if display.contains(',') {
        return Err(SchemaError::CommaInPath(display));
    }
    Ok(())
}
