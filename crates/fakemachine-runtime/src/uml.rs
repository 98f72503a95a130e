use crate::backend::{Backend, MountParameters};
use crate::host::{Host, HostContext};
use crate::launch::{LaunchCommand, ProcessGuard, PASSED_FD};
use crate::{RuntimeError, Unsupported};
use fakemachine_schema::{Image, Machine, MountPoint};
use std::os::fd::AsFd;
use std::path::PathBuf;

/// Host locations of the user-mode Linux pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmlPaths {
    pub kernel: PathBuf,
    pub modules: PathBuf,
    pub slirp_helper: PathBuf,
}

impl Default for UmlPaths {
    fn default() -> Self {
        Self {
            kernel: PathBuf::from("/usr/bin/linux.uml"),
            modules: PathBuf::from("/usr/lib/uml/modules"),
            slirp_helper: PathBuf::from("/usr/bin/libslirp-helper"),
        }
    }
}

/// User-mode Linux: the guest kernel runs as an ordinary host process and
/// gets its network from a libslirp helper over a datagram socket pair, so
/// neither /dev/kvm nor privileged networking is required.
pub struct UmlBackend {
    machine: Machine,
    ctx: HostContext,
    paths: UmlPaths,
}

impl UmlBackend {
    pub fn new(machine: Machine, ctx: HostContext) -> Self {
        Self::with_paths(machine, ctx, UmlPaths::default())
    }

    pub fn with_paths(machine: Machine, ctx: HostContext, paths: UmlPaths) -> Self {
        Self {
            machine,
            ctx,
            paths,
        }
    }

    pub fn paths(&self) -> &UmlPaths {
        &self.paths
    }

    /// Guest kernel command line (without argv[0]).
    pub fn build_args(&self) -> Vec<String> {
        let m = &self.machine;
        let mut args = vec![
            format!("mem={}M", m.memory()),
            format!("initrd={}", m.initrd_path().display()),
            "panic=-1".to_owned(),
            "nosplash".to_owned(),
            "systemd.unit=fakemachine.service".to_owned(),
            "console=tty0".to_owned(),
            format!("vec0:transport=fd,fd={PASSED_FD},vec=0"),
        ];

        if m.show_boot() {
            // tty0 on our stdio, no other consoles.
            args.extend(["con0=fd:0,fd:1", "con=none"].map(String::from));
        } else {
            // Silence the kernel and put the job console tty1 on our stdio.
            args.extend(["quiet", "con1=fd:0,fd:1", "con0=null", "con=none"].map(String::from));
        }

        for img in m.images() {
            args.push(format!("ubd{}={}", img.index, img.path.display()));
        }

        args
    }

    fn launch_error(program: &std::path::Path, source: std::io::Error) -> RuntimeError {
        RuntimeError::Launch {
            backend: "uml",
            program: program.to_path_buf(),
            source,
        }
    }
}

impl Backend for UmlBackend {
    fn name(&self) -> &'static str {
        "uml"
    }

    fn machine(&self) -> &Machine {
        &self.machine
    }

    fn host(&self) -> &dyn Host {
        self.ctx.host.as_ref()
    }

    fn supported(&self) -> Result<(), Unsupported> {
        let installed = |name, path: &PathBuf| {
            self.ctx
                .host
                .stat(path)
                .map_err(|source| Unsupported::NotInstalled {
                    name,
                    path: path.clone(),
                    source,
                })
        };
        installed("user-mode-linux", &self.paths.kernel)?;
        installed("slirp-helper", &self.paths.slirp_helper)
    }

    fn image_path(&self, image: &Image) -> String {
        format!("/dev/disk/by-path/platform-uml-blkdev.{}", image.index)
    }

    fn kernel_modules_dir(&self) -> Result<PathBuf, RuntimeError> {
        self.ctx
            .host
            .stat(&self.paths.modules)
            .map_err(|source| RuntimeError::HostPath {
                backend: "uml",
                what: "user-mode-linux modules directory",
                path: self.paths.modules.clone(),
                source,
            })?;
        Ok(self.paths.modules.clone())
    }

    fn static_volumes(&self) -> Vec<MountPoint> {
        // The UML modules replace the host modules the initrd would
        // otherwise find under /lib/modules.
        let mut volumes = self.machine.static_volumes();
        volumes.push(MountPoint {
            host_directory: self.paths.modules.clone(),
            machine_directory: PathBuf::from("/lib/modules"),
            label: "modules".to_owned(),
            is_static: true,
        });
        volumes
    }

    fn mount_parameters(&self, mount: &MountPoint) -> MountParameters {
        MountParameters {
            fs_type: "hostfs",
            options: vec![mount.host_directory.display().to_string()],
        }
    }

    fn networkd_match(&self) -> &'static str {
        "vec*"
    }

    fn job_output_tty(&self) -> &'static str {
        if self.machine.show_boot() {
            "/dev/tty0"
        } else {
            "/dev/tty1"
        }
    }

    fn start(self: Box<Self>) -> Result<i32, RuntimeError> {
        self.machine
            .validate()
            .map_err(|source| RuntimeError::InvalidMachine {
                backend: "uml",
                source,
            })?;
        let launcher = &self.ctx.launcher;

        // Both endpoints live until this frame returns, after the guards
        // below have killed whatever is still running.
        let (helper_end, guest_end) =
            launcher
                .socket_pair()
                .map_err(|source| RuntimeError::ResourceSetup {
                    backend: "uml",
                    what: "network socket pair",
                    source,
                })?;

        // The guest references the helper's socket by descriptor number, so
        // the helper has to be up first.
        let helper_cmd = LaunchCommand::new(&self.paths.slirp_helper, "libslirp-helper")
            .args([format!("--fd={PASSED_FD}"), "--exit-with-parent".to_owned()])
            .pass_fd(helper_end.as_fd());
        tracing::info!("launching {}", self.paths.slirp_helper.display());
        let helper = launcher
            .spawn(&helper_cmd)
            .map_err(|e| Self::launch_error(&helper_cmd.program, e))?;
        let helper = ProcessGuard::new("slirp helper", helper);

        let guest_cmd = LaunchCommand::new(&self.paths.kernel, "linux")
            .args(self.build_args())
            .pass_fd(guest_end.as_fd());
        tracing::info!(
            memory = self.machine.memory(),
            helper_pid = ?helper.id(),
            "launching {}",
            self.paths.kernel.display()
        );
        tracing::debug!("uml arguments: {}", guest_cmd.args.join(" "));
        let guest = launcher
            .spawn(&guest_cmd)
            .map_err(|e| Self::launch_error(&guest_cmd.program, e))?;
        let mut guest = ProcessGuard::new("uml guest", guest);

        let code = guest.wait().map_err(|source| RuntimeError::Supervision {
            backend: "uml",
            what: "uml guest",
            source,
        })?;
        tracing::info!(code, "uml guest exited");

        drop(helper);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Fault, MockHost, MockLauncher};
    use std::sync::Arc;

    fn installed_host() -> MockHost {
        let paths = UmlPaths::default();
        MockHost::new()
            .with_path(paths.kernel)
            .with_path(paths.slirp_helper)
            .with_path(paths.modules)
    }

    fn backend_with(machine: Machine, launcher: Arc<MockLauncher>) -> UmlBackend {
        UmlBackend::new(machine, HostContext::new(Arc::new(installed_host()), launcher))
    }

    fn backend(machine: Machine) -> UmlBackend {
        backend_with(machine, Arc::new(MockLauncher::new()))
    }

    fn sample_machine() -> Machine {
        let mut m = Machine::with_backend("uml");
        m.set_memory(512).set_initrd("/tmp/initrd.gz");
        m.add_image("/tmp/a.img", Some("root"));
        m.add_image("/tmp/b.img", Some("scratch"));
        m
    }

    fn run(launcher: &Arc<MockLauncher>) -> Result<i32, RuntimeError> {
        Box::new(backend_with(sample_machine(), Arc::clone(launcher))).start()
    }

    fn assert_cleaned_up(launcher: &MockLauncher) {
        assert_eq!(launcher.live_endpoints(), 0, "socket endpoints leaked");
        assert!(launcher.running().is_empty(), "children left running");
    }

    #[test]
    fn supported_names_missing_kernel() {
        let ctx = HostContext::new(
            Arc::new(MockHost::new().with_path(UmlPaths::default().slirp_helper)),
            Arc::new(MockLauncher::new()),
        );
        let err = UmlBackend::new(Machine::new(), ctx).supported().unwrap_err();
        assert_eq!(
            err.to_string(),
            "user-mode-linux not installed (/usr/bin/linux.uml is missing)"
        );
    }

    #[test]
    fn supported_names_missing_helper() {
        let ctx = HostContext::new(
            Arc::new(MockHost::new().with_path(UmlPaths::default().kernel)),
            Arc::new(MockLauncher::new()),
        );
        let err = UmlBackend::new(Machine::new(), ctx).supported().unwrap_err();
        assert!(matches!(
            err,
            Unsupported::NotInstalled {
                name: "slirp-helper",
                ..
            }
        ));
        assert!(backend(Machine::new()).supported().is_ok());
    }

    #[test]
    fn supported_keeps_stat_error() {
        let paths = UmlPaths::default();
        let host = MockHost::new()
            .with_denied(&paths.kernel)
            .with_path(&paths.slirp_helper);
        let ctx = HostContext::new(Arc::new(host), Arc::new(MockLauncher::new()));
        let err = UmlBackend::new(Machine::new(), ctx).supported().unwrap_err();
        assert!(err.to_string().starts_with("user-mode-linux not installed"));
        let source = std::error::Error::source(&err)
            .and_then(|e| e.downcast_ref::<std::io::Error>())
            .unwrap();
        assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn image_path_uses_index() {
        let mut m = Machine::new();
        m.add_image("/tmp/a.img", None);
        m.add_image("/tmp/b.img", None);
        let img = m.add_image("/tmp/c.img", Some("disk0"));
        assert_eq!(img.index, 2);
        assert_eq!(
            backend(m).image_path(&img),
            "/dev/disk/by-path/platform-uml-blkdev.2"
        );
    }

    #[test]
    fn image_path_matches_block_device_index() {
        let m = sample_machine();
        let b = backend(m.clone());
        let args = b.build_args();
        for img in m.images() {
            let predicted = b.image_path(img);
            let index = predicted.rsplit('.').next().unwrap();
            let ubd = format!("ubd{index}={}", img.path.display());
            assert!(args.contains(&ubd), "{ubd} missing from {args:?}");
        }
    }

    #[test]
    fn no_required_modules() {
        let b = backend(Machine::new());
        assert!(b.required_modules().is_empty());
        assert!(b.init_modules().is_empty());
    }

    #[test]
    fn modules_dir_and_static_volumes() {
        let mut m = Machine::new();
        m.add_static_volume("/usr", "usr");
        m.add_volume("/src");
        let b = backend(m);
        assert_eq!(
            b.kernel_modules_dir().unwrap(),
            PathBuf::from("/usr/lib/uml/modules")
        );
        let volumes = b.static_volumes();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].label, "usr");
        let modules = &volumes[1];
        assert_eq!(modules.label, "modules");
        assert_eq!(modules.host_directory, PathBuf::from("/usr/lib/uml/modules"));
        assert_eq!(modules.machine_directory, PathBuf::from("/lib/modules"));
        assert!(modules.is_static);
    }

    #[test]
    fn missing_modules_dir_is_not_found() {
        let ctx = HostContext::new(Arc::new(MockHost::new()), Arc::new(MockLauncher::new()));
        let b = UmlBackend::new(Machine::new(), ctx);
        let err = b.kernel_modules_dir().unwrap_err();
        assert!(matches!(err, RuntimeError::HostPath { backend: "uml", .. }));
        assert!(err.to_string().starts_with("uml: "), "{err}");
    }

    #[test]
    fn hostfs_mount_parameters() {
        let mut m = Machine::new();
        m.add_volume_at("/srv/build", "/build");
        let b = backend(m.clone());
        let params = b.mount_parameters(&m.mounts()[0]);
        assert_eq!(params.fs_type, "hostfs");
        assert_eq!(params.options, ["/srv/build"]);
    }

    #[test]
    fn networkd_and_job_tty() {
        let mut m = Machine::new();
        assert_eq!(backend(m.clone()).networkd_match(), "vec*");
        assert_eq!(backend(m.clone()).job_output_tty(), "/dev/tty1");
        m.set_show_boot(true);
        assert_eq!(backend(m).job_output_tty(), "/dev/tty0");
    }

    #[test]
    fn quiet_console_arguments() {
        let args = backend(sample_machine()).build_args();
        assert_eq!(
            &args[..7],
            [
                "mem=512M",
                "initrd=/tmp/initrd.gz",
                "panic=-1",
                "nosplash",
                "systemd.unit=fakemachine.service",
                "console=tty0",
                "vec0:transport=fd,fd=3,vec=0",
            ]
        );
        assert_eq!(
            &args[7..11],
            ["quiet", "con1=fd:0,fd:1", "con0=null", "con=none"]
        );
        assert_eq!(&args[11..], ["ubd0=/tmp/a.img", "ubd1=/tmp/b.img"]);
    }

    #[test]
    fn show_boot_console_arguments() {
        let mut m = sample_machine();
        m.set_show_boot(true);
        let args = backend(m).build_args();
        assert!(args.contains(&"con0=fd:0,fd:1".to_owned()));
        assert!(args.contains(&"con=none".to_owned()));
        assert!(!args.contains(&"quiet".to_owned()));
        assert!(!args.contains(&"con1=fd:0,fd:1".to_owned()));
    }

    #[test]
    fn helper_launches_before_guest() {
        let launcher = Arc::new(MockLauncher::new().with_exit_code(0));
        assert_eq!(run(&launcher).unwrap(), 0);

        let launches = launcher.launches();
        assert_eq!(launches.len(), 2);
        let (helper, guest) = (&launches[0], &launches[1]);
        assert_eq!(helper.program, PathBuf::from("/usr/bin/libslirp-helper"));
        assert_eq!(helper.args, ["--fd=3", "--exit-with-parent"]);
        assert!(helper.passed_fd);
        assert_eq!(guest.program, PathBuf::from("/usr/bin/linux.uml"));
        assert_eq!(guest.argv0, "linux");
        assert!(guest.passed_fd);
        assert!(guest.args.contains(&"vec0:transport=fd,fd=3,vec=0".to_owned()));
    }

    #[test]
    fn success_kills_helper_and_closes_endpoints() {
        let launcher = Arc::new(MockLauncher::new().with_exit_code(5));
        assert_eq!(run(&launcher).unwrap(), 5);
        assert_eq!(launcher.endpoints_created(), 2);
        assert_eq!(launcher.killed(), vec![launcher.launches()[0].pid]);
        assert_cleaned_up(&launcher);
    }

    #[test]
    fn invalid_machine_acquires_nothing() {
        let launcher = Arc::new(MockLauncher::new());
        let mut m = sample_machine();
        m.add_image("/tmp/c,d.img", None);
        let err = Box::new(backend_with(m, Arc::clone(&launcher)))
            .start()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidMachine { backend: "uml", .. }));
        assert_eq!(launcher.endpoints_created(), 0);
        assert!(launcher.launches().is_empty());
    }

    #[test]
    fn socket_pair_failure() {
        let launcher = Arc::new(MockLauncher::new().with_fault(Fault::SocketPair));
        let err = run(&launcher).unwrap_err();
        assert!(matches!(err, RuntimeError::ResourceSetup { backend: "uml", .. }));
        assert!(launcher.launches().is_empty());
        assert_cleaned_up(&launcher);
    }

    #[test]
    fn helper_launch_failure() {
        let launcher = Arc::new(MockLauncher::new().with_fault(Fault::Spawn(0)));
        let err = run(&launcher).unwrap_err();
        match &err {
            RuntimeError::Launch { program, .. } => {
                assert_eq!(program, &PathBuf::from("/usr/bin/libslirp-helper"));
            }
            other => panic!("expected Launch, got {other:?}"),
        }
        assert!(launcher.launches().is_empty());
        assert_eq!(launcher.endpoints_created(), 2);
        assert_cleaned_up(&launcher);
    }

    #[test]
    fn guest_launch_failure() {
        let launcher = Arc::new(MockLauncher::new().with_fault(Fault::Spawn(1)));
        let err = run(&launcher).unwrap_err();
        match &err {
            RuntimeError::Launch { program, .. } => {
                assert_eq!(program, &PathBuf::from("/usr/bin/linux.uml"));
            }
            other => panic!("expected Launch, got {other:?}"),
        }
        assert_eq!(launcher.launches().len(), 1);
        assert_eq!(launcher.killed(), vec![launcher.launches()[0].pid]);
        assert_cleaned_up(&launcher);
    }

    #[test]
    fn wait_failure() {
        let launcher = Arc::new(MockLauncher::new().with_fault(Fault::Wait));
        let err = run(&launcher).unwrap_err();
        assert!(matches!(err, RuntimeError::Supervision { backend: "uml", .. }));
        assert_eq!(launcher.killed().len(), 2);
        assert_cleaned_up(&launcher);
    }
}
