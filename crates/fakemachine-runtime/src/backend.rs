use crate::host::{self, Host, HostContext};
use crate::kvm::KvmBackend;
use crate::uml::UmlBackend;
use crate::{RuntimeError, Unsupported};
use fakemachine_schema::{Image, Machine, MountPoint};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Filesystem type and mount options the guest init script uses for a
/// mount point.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MountParameters {
    pub fs_type: &'static str,
    pub options: Vec<String>,
}

/// A virtualization strategy bound to one `Machine`.
///
/// Every method except `start` is a pure query that collaborators call while
/// assembling the initrd and init script. `start` consumes the backend: an
/// instance boots at most once, and a retry needs a freshly selected backend.
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    fn machine(&self) -> &Machine;

    fn host(&self) -> &dyn Host;

    /// Probe the host. Has no side effects.
    fn supported(&self) -> Result<(), Unsupported>;

    /// Device path under which `image` appears inside the guest. Init scripts
    /// are generated with this path before boot, so it must match the wiring
    /// `start` sets up.
    fn image_path(&self, image: &Image) -> String;

    /// Module objects, relative to the module tree, to pack into the initrd.
    fn required_modules(&self) -> &'static [&'static str] {
        &[]
    }

    fn kernel_modules_dir(&self) -> Result<PathBuf, RuntimeError> {
        host::kernel_modules_dir(self.name(), self.host())
    }

    /// Modules the init script probes at boot.
    fn init_modules(&self) -> &'static [&'static str] {
        &[]
    }

    fn static_volumes(&self) -> Vec<MountPoint> {
        self.machine().static_volumes()
    }

    fn mount_parameters(&self, mount: &MountPoint) -> MountParameters;

    /// systemd-networkd `[Match] Name=` glob for the guest's interfaces.
    fn networkd_match(&self) -> &'static str {
        "e*"
    }

    /// Guest terminal that receives the job's stdout and stderr.
    fn job_output_tty(&self) -> &'static str;

    /// Boot the guest, block until it powers off, and return its exit code.
    fn start(self: Box<Self>) -> Result<i32, RuntimeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Auto,
    Kvm,
    Uml,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Auto, BackendKind::Kvm, BackendKind::Uml];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::Kvm => "kvm",
            BackendKind::Uml => "uml",
        }
    }

    /// The concrete backend this kind stands for.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto | BackendKind::Kvm => BackendKind::Kvm,
            BackendKind::Uml => BackendKind::Uml,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RuntimeError::UnknownBackend(s.to_owned()))
    }
}

/// Names accepted by `select_backend`, including `auto`.
pub fn backend_names() -> &'static [&'static str] {
    &["auto", "kvm", "uml"]
}

fn construct(kind: BackendKind, machine: Machine, ctx: HostContext) -> Box<dyn Backend> {
    match kind.resolve() {
        BackendKind::Uml => Box::new(UmlBackend::new(machine, ctx)),
        BackendKind::Auto | BackendKind::Kvm => Box::new(KvmBackend::new(machine, ctx)),
    }
}

pub fn select_backend(name: &str, machine: Machine) -> Result<Box<dyn Backend>, RuntimeError> {
    select_backend_with(name, machine, HostContext::system())
}

/// Construct the backend called `name` and make sure the host can run it.
/// `auto` always means `kvm`.
pub fn select_backend_with(
    name: &str,
    machine: Machine,
    ctx: HostContext,
) -> Result<Box<dyn Backend>, RuntimeError> {
    let kind: BackendKind = name.parse()?;
    let backend = construct(kind, machine, ctx);
    tracing::debug!("selected backend {} for '{name}'", backend.name());

    backend
        .supported()
        .map_err(|cause| RuntimeError::Unsupported {
            backend: backend.name(),
            cause,
        })?;

    Ok(backend)
}

/// Support status of one concrete backend on this host.
#[derive(Debug, Serialize)]
pub struct BackendProbe {
    pub name: &'static str,
    pub supported: bool,
    pub reason: Option<String>,
}

/// Probe every concrete backend against an empty machine.
pub fn probe_backends(ctx: &HostContext) -> Vec<BackendProbe> {
    [BackendKind::Kvm, BackendKind::Uml]
        .into_iter()
        .map(|kind| {
            let backend = construct(kind, Machine::new(), ctx.clone());
            let result = backend.supported();
            BackendProbe {
                name: backend.name(),
                supported: result.is_ok(),
                reason: result.err().map(|e| e.to_string()),
            }
        })
        .collect()
}
