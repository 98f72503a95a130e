use crate::host::{self, Host};
use crate::kvm::{KVM_DEVICE, QEMU_BINARY};
use crate::uml::UmlPaths;
use std::fmt;
use std::path::Path;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn present(host: &dyn Host, path: impl AsRef<Path>) -> bool {
    host.stat(path.as_ref()).is_ok()
}

/// Check everything the `kvm` backend needs. An empty list means the backend
/// can boot a guest on this host.
pub fn check_kvm_prereqs(host: &dyn Host) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !present(host, KVM_DEVICE) {
        missing.push(MissingPrereq {
            name: "/dev/kvm",
            purpose: "hardware virtualization",
            install_hint: "load kvm_intel or kvm_amd and add your user to the kvm group",
        });
    }

    if !present(host, QEMU_BINARY) {
        missing.push(MissingPrereq {
            name: "qemu-system-x86_64",
            purpose: "running the virtual machine",
            install_hint: "apt install qemu-system-x86 | dnf install qemu-system-x86 | pacman -S qemu-system-x86",
        });
    }

    let kernel =
        host::host_kernel_path("kvm", host).and_then(|_| host::kernel_modules_dir("kvm", host));
    if kernel.is_err() {
        missing.push(MissingPrereq {
            name: "host kernel",
            purpose: "booting the guest with the running kernel and its modules",
            install_hint: "install the kernel image and modules package matching `uname -r`",
        });
    }

    missing
}

/// Check everything the `uml` backend needs.
pub fn check_uml_prereqs(host: &dyn Host) -> Vec<MissingPrereq> {
    let paths = UmlPaths::default();
    let mut missing = Vec::new();

    if !present(host, &paths.kernel) {
        missing.push(MissingPrereq {
            name: "user-mode-linux",
            purpose: "running the guest kernel as a process",
            install_hint: "apt install user-mode-linux",
        });
    } else if !present(host, &paths.modules) {
        missing.push(MissingPrereq {
            name: "user-mode-linux modules",
            purpose: "kernel modules for the guest",
            install_hint: "reinstall user-mode-linux",
        });
    }

    if !present(host, &paths.slirp_helper) {
        missing.push(MissingPrereq {
            name: "libslirp-helper",
            purpose: "unprivileged guest networking",
            install_hint: "apt install libslirp-helper",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(backend: &str, missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = format!("{backend}: missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg
}
