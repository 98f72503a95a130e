pub mod backends;
pub mod check;
pub mod completions;
pub mod inspect;
pub mod run;

use clap::Args;
use fakemachine_runtime::RuntimeError;
use fakemachine_schema::{parse_machine_file, Machine};
use std::path::PathBuf;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_UNSUPPORTED: u8 = 3;

pub const CONFIG_PREFIX: &str = "machine error:";
pub const UNSUPPORTED_PREFIX: &str = "unsupported:";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Machine description shared by `inspect` and `run`: an optional machine
/// file with command-line overrides on top.
#[derive(Debug, Default, Args)]
pub struct MachineArgs {
    /// Machine file (TOML).
    #[arg(short = 'f', long = "machine")]
    pub file: Option<PathBuf>,

    /// Backend to use: auto, kvm or uml.
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Guest memory in MiB.
    #[arg(short, long)]
    pub memory: Option<u64>,

    /// Number of virtual CPUs.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Show the guest kernel's boot output.
    #[arg(long, default_value_t = false)]
    pub show_boot: bool,

    /// Initrd to boot.
    #[arg(long)]
    pub initrd: Option<PathBuf>,

    /// Attach a raw disk image, as PATH or PATH:LABEL.
    #[arg(long = "image", value_name = "PATH[:LABEL]")]
    pub images: Vec<String>,

    /// Share a host directory, as HOST or HOST:GUEST.
    #[arg(long = "volume", value_name = "HOST[:GUEST]")]
    pub volumes: Vec<String>,
}

impl MachineArgs {
    /// Resolve the machine file and apply overrides. Images and volumes from
    /// the command line are appended after those from the file.
    pub fn build(&self) -> Result<Machine, String> {
        let mut machine = match &self.file {
            Some(path) => parse_machine_file(path)
                .map_err(|e| format!("{CONFIG_PREFIX} {}: {e}", path.display()))?
                .into_machine(),
            None => Machine::new(),
        };

        if let Some(backend) = &self.backend {
            machine.set_backend(backend.trim().to_lowercase());
        }
        if let Some(memory) = self.memory {
            machine.set_memory(memory);
        }
        if let Some(cpus) = self.cpus {
            machine.set_cpus(cpus);
        }
        if self.show_boot {
            machine.set_show_boot(true);
        }
        if let Some(initrd) = &self.initrd {
            machine.set_initrd(initrd);
        }
        for spec in &self.images {
            match spec.rsplit_once(':') {
                Some((path, label)) => machine.add_image(path, Some(label)),
                None => machine.add_image(spec, None),
            };
        }
        for spec in &self.volumes {
            match spec.rsplit_once(':') {
                Some((host, guest)) => machine.add_volume_at(host, guest),
                None => machine.add_volume(spec),
            }
        }

        Ok(machine)
    }
}

/// Render a runtime failure with a prefix `exit_code_for` understands.
pub fn runtime_error(err: &RuntimeError) -> String {
    match err {
        RuntimeError::UnknownBackend(_) | RuntimeError::InvalidMachine { .. } => {
            format!("{CONFIG_PREFIX} {err}")
        }
        RuntimeError::Unsupported { .. } => format!("{UNSUPPORTED_PREFIX} {err}"),
        _ => err.to_string(),
    }
}

pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with(CONFIG_PREFIX) {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with(UNSUPPORTED_PREFIX) {
        EXIT_UNSUPPORTED
    } else {
        EXIT_FAILURE
    }
}
