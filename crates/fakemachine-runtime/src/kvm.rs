use crate::backend::{Backend, MountParameters};
use crate::host::{host_kernel_path, Host, HostContext};
use crate::launch::{LaunchCommand, ProcessGuard};
use crate::{RuntimeError, Unsupported};
use fakemachine_schema::{Image, Machine, MountPoint};
use std::path::{Path, PathBuf};

pub const KVM_DEVICE: &str = "/dev/kvm";
pub const QEMU_BINARY: &str = "/usr/bin/qemu-system-x86_64";

/// Guest kernel command line shared by both console modes.
pub const KERNEL_ARGS: [&str; 3] = [
    "console=ttyS0",
    "panic=-1",
    "systemd.unit=fakemachine.service",
];

const REQUIRED_MODULES: &[&str] = &[
    "kernel/drivers/char/virtio_console.ko",
    "kernel/drivers/virtio/virtio.ko",
    "kernel/drivers/virtio/virtio_pci.ko",
    "kernel/net/9p/9pnet.ko",
    "kernel/drivers/virtio/virtio_ring.ko",
    "kernel/fs/9p/9p.ko",
    "kernel/net/9p/9pnet_virtio.ko",
    "kernel/fs/fscache/fscache.ko",
];

const INIT_MODULES: &[&str] = &["virtio_pci", "virtio_console", "9pnet_virtio", "9p"];

const NINEP_OPTIONS: [&str; 4] = [
    "trans=virtio",
    "version=9p2000.L",
    "cache=loose",
    "msize=262144",
];

/// QEMU with KVM acceleration, booting the host kernel directly.
pub struct KvmBackend {
    machine: Machine,
    ctx: HostContext,
}

impl KvmBackend {
    pub fn new(machine: Machine, ctx: HostContext) -> Self {
        Self { machine, ctx }
    }

    /// Full QEMU argument list (without argv[0]) for booting `kernel`.
    pub fn build_args(&self, kernel: &Path) -> Vec<String> {
        let m = &self.machine;
        let mut args: Vec<String> = vec![
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            m.cpus().to_string(),
            "-m".into(),
            m.memory().to_string(),
            "-enable-kvm".into(),
            "-kernel".into(),
            kernel.display().to_string(),
            "-initrd".into(),
            m.initrd_path().display().to_string(),
            "-display".into(),
            "none".into(),
            "-no-reboot".into(),
        ];

        if m.show_boot() {
            // The serial port is the console for firmware, kernel and
            // systemd; wire it straight to our stdio.
            args.extend(
                [
                    "-chardev",
                    "stdio,id=for-ttyS0,signal=off",
                    "-serial",
                    "chardev:for-ttyS0",
                ]
                .map(String::from),
            );
        } else {
            // Discard the serial console and hand our stdio to hvc0, where
            // the init script sends the job output.
            args.extend(
                [
                    "-device",
                    "virtio-serial",
                    "-chardev",
                    "null,id=for-ttyS0",
                    "-serial",
                    "chardev:for-ttyS0",
                    "-chardev",
                    "stdio,id=for-hvc0,signal=off",
                    "-device",
                    "virtconsole,chardev=for-hvc0",
                ]
                .map(String::from),
            );
        }

        for point in m.mounts() {
            args.push("-virtfs".into());
            args.push(format!(
                "local,mount_tag={},path={},security_model=none",
                point.label,
                point.host_directory.display()
            ));
        }

        for (i, img) in m.images().iter().enumerate() {
            args.push("-drive".into());
            args.push(format!(
                "file={},if=none,format=raw,cache=unsafe,id=drive-virtio-disk{i}",
                img.path.display()
            ));
            // The serial becomes /dev/disk/by-id/virtio-<label>, see image_path.
            args.push("-device".into());
            args.push(format!(
                "virtio-blk-pci,drive=drive-virtio-disk{i},id=virtio-disk{i},serial={}",
                img.label
            ));
        }

        args.push("-append".into());
        args.push(KERNEL_ARGS.join(" "));
        args
    }
}

impl Backend for KvmBackend {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn machine(&self) -> &Machine {
        &self.machine
    }

    fn host(&self) -> &dyn Host {
        self.ctx.host.as_ref()
    }

    fn supported(&self) -> Result<(), Unsupported> {
        self.ctx
            .host
            .stat(Path::new(KVM_DEVICE))
            .map_err(|source| Unsupported::MissingDevice {
                path: PathBuf::from(KVM_DEVICE),
                source,
            })
    }

    fn image_path(&self, image: &Image) -> String {
        format!("/dev/disk/by-id/virtio-{}", image.label)
    }

    fn required_modules(&self) -> &'static [&'static str] {
        REQUIRED_MODULES
    }

    fn init_modules(&self) -> &'static [&'static str] {
        INIT_MODULES
    }

    fn mount_parameters(&self, _mount: &MountPoint) -> MountParameters {
        MountParameters {
            fs_type: "9p",
            options: NINEP_OPTIONS.map(String::from).to_vec(),
        }
    }

    fn job_output_tty(&self) -> &'static str {
        // ttyS0 carries boot messages and hvc0 is wired to our stdio in
        // quiet mode. With show_boot everything goes to the one console.
        if self.machine.show_boot() {
            "/dev/console"
        } else {
            "/dev/hvc0"
        }
    }

    fn start(self: Box<Self>) -> Result<i32, RuntimeError> {
        self.machine
            .validate()
            .map_err(|source| RuntimeError::InvalidMachine {
                backend: "kvm",
                source,
            })?;
        let kernel = host_kernel_path(self.name(), self.ctx.host.as_ref())?;
        let command =
            LaunchCommand::new(QEMU_BINARY, "qemu-system-x86_64").args(self.build_args(&kernel));

        tracing::info!(
            kernel = %kernel.display(),
            memory = self.machine.memory(),
            cpus = self.machine.cpus(),
            "launching {QEMU_BINARY}"
        );
        tracing::debug!("qemu arguments: {}", command.args.join(" "));

        let child = self
            .ctx
            .launcher
            .spawn(&command)
            .map_err(|source| RuntimeError::Launch {
                backend: "kvm",
                program: command.program.clone(),
                source,
            })?;
        let mut qemu = ProcessGuard::new("qemu", child);

        let code = qemu.wait().map_err(|source| RuntimeError::Supervision {
            backend: "kvm",
            what: "qemu",
            source,
        })?;
        tracing::info!(code, "qemu exited");
        Ok(code)
    }
}
