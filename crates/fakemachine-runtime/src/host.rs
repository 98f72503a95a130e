use crate::launch::{Launcher, SystemLauncher};
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only view of the host that backends probe before and during boot.
pub trait Host: Send + Sync {
    /// Succeeds if `path` exists; the error is the underlying stat failure.
    fn stat(&self, path: &Path) -> std::io::Result<()>;

    /// Release identifier of the running kernel (`uname -r`).
    fn kernel_release(&self) -> std::io::Result<String>;

    /// Whether `/lib` is merged into `/usr/lib`.
    fn merged_usr(&self) -> bool;
}

pub struct SystemHost;

impl Host for SystemHost {
    fn stat(&self, path: &Path) -> std::io::Result<()> {
        std::fs::metadata(path).map(|_| ())
    }

    fn kernel_release(&self) -> std::io::Result<String> {
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")?;
        Ok(release.trim().to_owned())
    }

    fn merged_usr(&self) -> bool {
        match std::fs::read_link("/lib") {
            Ok(target) => target == Path::new("usr/lib") || target == Path::new("/usr/lib"),
            Err(_) => false,
        }
    }
}

/// The host probe and process launcher a backend is bound to.
#[derive(Clone)]
pub struct HostContext {
    pub host: Arc<dyn Host>,
    pub launcher: Arc<dyn Launcher>,
}

impl HostContext {
    pub fn new(host: Arc<dyn Host>, launcher: Arc<dyn Launcher>) -> Self {
        Self { host, launcher }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemHost), Arc::new(SystemLauncher))
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::system()
    }
}

fn modules_root(host: &dyn Host) -> &'static Path {
    if host.merged_usr() {
        Path::new("/usr/lib/modules")
    } else {
        Path::new("/lib/modules")
    }
}

fn kernel_release(backend: &'static str, host: &dyn Host) -> Result<String, RuntimeError> {
    host.kernel_release()
        .map_err(|source| RuntimeError::KernelRelease { backend, source })
}

/// Module tree of the running host kernel. `backend` names the caller in
/// errors.
pub fn kernel_modules_dir(
    backend: &'static str,
    host: &dyn Host,
) -> Result<PathBuf, RuntimeError> {
    let release = kernel_release(backend, host)?;
    let dir = modules_root(host).join(release);
    host.stat(&dir).map_err(|source| RuntimeError::HostPath {
        backend,
        what: "kernel modules directory",
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// Kernel image matching the running host kernel. Distributions install it
/// either as `/boot/vmlinuz-<release>` or inside the module tree.
pub fn host_kernel_path(
    backend: &'static str,
    host: &dyn Host,
) -> Result<PathBuf, RuntimeError> {
    let release = kernel_release(backend, host)?;

    let boot = PathBuf::from(format!("/boot/vmlinuz-{release}"));
    let boot_err = match host.stat(&boot) {
        Ok(()) => return Ok(boot),
        Err(e) => e,
    };

    let in_modules = modules_root(host).join(&release).join("vmlinuz");
    if host.stat(&in_modules).is_ok() {
        return Ok(in_modules);
    }

    Err(RuntimeError::HostPath {
        backend,
        what: "host kernel image",
        path: boot,
        source: boot_err,
    })
}
