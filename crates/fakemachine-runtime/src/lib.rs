//! Virtualization backends and guest supervision for fakemachine.
//!
//! This crate implements the execution layer: the `Backend` capability trait
//! with a hardware-accelerated (`kvm`, QEMU) and a software (`uml`,
//! user-mode Linux plus a slirp network helper) implementation, the backend
//! registry, host probing (`Host`), process launching (`Launcher`) with
//! scoped cleanup of children and socket endpoints, and prerequisite checks.

pub mod backend;
pub mod host;
pub mod kvm;
pub mod launch;
pub mod mock;
pub mod prereq;
pub mod uml;

pub use backend::{
    backend_names, probe_backends, select_backend, select_backend_with, Backend, BackendKind,
    BackendProbe, MountParameters,
};
pub use host::{Host, HostContext, SystemHost};
pub use launch::{Endpoint, LaunchCommand, Launcher, Supervised, SystemLauncher};
pub use prereq::{check_kvm_prereqs, check_uml_prereqs, format_missing, MissingPrereq};

use std::path::PathBuf;
use thiserror::Error;

/// Why a backend cannot run on this host.
#[derive(Debug, Error)]
pub enum Unsupported {
    #[error("{} is not accessible: {source}", .path.display())]
    MissingDevice {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} not installed ({} is missing)", .path.display())]
    NotInstalled {
        name: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("backend {0} does not exist")]
    UnknownBackend(String),
    #[error("{backend} not supported: {cause}")]
    Unsupported {
        backend: &'static str,
        #[source]
        cause: Unsupported,
    },
    #[error("{backend}: invalid machine: {source}")]
    InvalidMachine {
        backend: &'static str,
        #[source]
        source: fakemachine_schema::SchemaError,
    },
    #[error("{backend}: failed to set up {what}: {source}")]
    ResourceSetup {
        backend: &'static str,
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{backend}: failed to launch {}: {source}", .program.display())]
    Launch {
        backend: &'static str,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{backend}: failed to wait for {what}: {source}")]
    Supervision {
        backend: &'static str,
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{backend}: {what} not found at {}: {source}", .path.display())]
    HostPath {
        backend: &'static str,
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{backend}: cannot determine running kernel release: {source}")]
    KernelRelease {
        backend: &'static str,
        #[source]
        source: std::io::Error,
    },
}
