use super::{json_pretty, runtime_error, MachineArgs, EXIT_SUCCESS};
use fakemachine_runtime::{select_backend_with, Backend, HostContext, MountParameters};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
pub struct ImageReport {
    pub label: String,
    pub path: PathBuf,
    pub guest_path: String,
}

#[derive(Debug, Serialize)]
pub struct MountReport {
    pub label: String,
    pub host: PathBuf,
    pub guest: PathBuf,
    pub is_static: bool,
    #[serde(flatten)]
    pub params: MountParameters,
}

/// What the guest-side tooling needs to know about a backend before boot.
#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub backend: &'static str,
    pub memory: u64,
    pub cpus: u32,
    pub images: Vec<ImageReport>,
    pub mounts: Vec<MountReport>,
    pub required_modules: &'static [&'static str],
    pub init_modules: &'static [&'static str],
    pub kernel_modules_dir: Option<PathBuf>,
    pub kernel_modules_error: Option<String>,
    pub networkd_match: &'static str,
    pub job_output_tty: &'static str,
}

fn mount_report(backend: &dyn Backend, mount: &fakemachine_schema::MountPoint) -> MountReport {
    MountReport {
        label: mount.label.clone(),
        host: mount.host_directory.clone(),
        guest: mount.machine_directory.clone(),
        is_static: mount.is_static,
        params: backend.mount_parameters(mount),
    }
}

pub fn report(backend: &dyn Backend) -> InspectReport {
    let machine = backend.machine();
    let images = machine
        .images()
        .iter()
        .map(|img| ImageReport {
            label: img.label.clone(),
            path: img.path.clone(),
            guest_path: backend.image_path(img),
        })
        .collect();

    // Static volumes come from the backend, which may add its own.
    let mut mounts: Vec<MountReport> = machine
        .mounts()
        .iter()
        .filter(|m| !m.is_static)
        .map(|m| mount_report(backend, m))
        .collect();
    mounts.extend(
        backend
            .static_volumes()
            .iter()
            .map(|m| mount_report(backend, m)),
    );

    let (kernel_modules_dir, kernel_modules_error) = match backend.kernel_modules_dir() {
        Ok(dir) => (Some(dir), None),
        Err(e) => (None, Some(e.to_string())),
    };

    InspectReport {
        backend: backend.name(),
        memory: machine.memory(),
        cpus: machine.cpus(),
        images,
        mounts,
        required_modules: backend.required_modules(),
        init_modules: backend.init_modules(),
        kernel_modules_dir,
        kernel_modules_error,
        networkd_match: backend.networkd_match(),
        job_output_tty: backend.job_output_tty(),
    }
}

pub fn run(args: &MachineArgs, ctx: &HostContext, json_output: bool) -> Result<u8, String> {
    let machine = args.build()?;
    let name = machine.backend().to_owned();
    let backend =
        select_backend_with(&name, machine, ctx.clone()).map_err(|e| runtime_error(&e))?;
    let report = report(backend.as_ref());

    if json_output {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("backend:        {}", report.backend);
    println!("memory:         {} MiB", report.memory);
    println!("cpus:           {}", report.cpus);
    println!("job output tty: {}", report.job_output_tty);
    println!("networkd match: {}", report.networkd_match);
    match (&report.kernel_modules_dir, &report.kernel_modules_error) {
        (Some(dir), _) => println!("modules dir:    {}", dir.display()),
        (None, Some(e)) => println!("modules dir:    unavailable ({e})"),
        (None, None) => {}
    }
    if !report.images.is_empty() {
        println!("images:");
        for img in &report.images {
            println!(
                "  {} {} -> {}",
                img.label,
                img.path.display(),
                img.guest_path
            );
        }
    }
    if !report.mounts.is_empty() {
        println!("mounts:");
        for m in &report.mounts {
            println!(
                "  {} {} -> {} ({} {})",
                m.label,
                m.host.display(),
                m.guest.display(),
                m.params.fs_type,
                m.params.options.join(",")
            );
        }
    }
    if !report.required_modules.is_empty() {
        println!("required modules:");
        for module in report.required_modules {
            println!("  {module}");
        }
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fakemachine_runtime::mock::{MockHost, MockLauncher};
    use fakemachine_runtime::uml::UmlPaths;
    use std::sync::Arc;

    fn ctx() -> HostContext {
        let uml = UmlPaths::default();
        let host = MockHost::new()
            .with_path("/dev/kvm")
            .with_path(uml.kernel)
            .with_path(uml.slirp_helper)
            .with_path(uml.modules);
        HostContext::new(Arc::new(host), Arc::new(MockLauncher::new()))
    }

    fn args(backend: &str) -> MachineArgs {
        MachineArgs {
            backend: Some(backend.to_owned()),
            images: vec!["/tmp/root.img:root".to_owned()],
            volumes: vec!["/srv/build:/build".to_owned()],
            ..MachineArgs::default()
        }
    }

    #[test]
    fn kvm_report() {
        let machine = args("kvm").build().unwrap();
        let backend = select_backend_with("kvm", machine, ctx()).unwrap();
        let report = report(backend.as_ref());
        assert_eq!(report.backend, "kvm");
        assert_eq!(report.images[0].guest_path, "/dev/disk/by-id/virtio-root");
        assert_eq!(report.mounts.len(), 1);
        assert_eq!(report.mounts[0].params.fs_type, "9p");
        assert_eq!(report.job_output_tty, "/dev/hvc0");
        assert!(report.kernel_modules_dir.is_none());
        assert!(report
            .kernel_modules_error
            .as_deref()
            .unwrap()
            .starts_with("kvm: "));
    }

    #[test]
    fn uml_report_includes_module_volume() {
        let machine = args("uml").build().unwrap();
        let backend = select_backend_with("uml", machine, ctx()).unwrap();
        let report = report(backend.as_ref());
        assert_eq!(
            report.images[0].guest_path,
            "/dev/disk/by-path/platform-uml-blkdev.0"
        );
        let labels: Vec<_> = report.mounts.iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, ["virtfs-0", "modules"]);
        assert_eq!(report.mounts[1].params.fs_type, "hostfs");
        assert_eq!(report.networkd_match, "vec*");
        assert!(report.required_modules.is_empty());
        assert_eq!(
            report.kernel_modules_dir,
            Some(PathBuf::from("/usr/lib/uml/modules"))
        );
        assert!(report.kernel_modules_error.is_none());
    }

    #[test]
    fn report_serializes() {
        let machine = args("auto").build().unwrap();
        let backend = select_backend_with("auto", machine, ctx()).unwrap();
        let json = serde_json::to_value(report(backend.as_ref())).unwrap();
        assert_eq!(json["backend"], "kvm");
        assert_eq!(json["mounts"][0]["fs_type"], "9p");
        assert!(json["kernel_modules_dir"].is_null());
        assert!(json["kernel_modules_error"].is_string());
    }
}
