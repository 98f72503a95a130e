mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{exit_code_for, MachineArgs};
use fakemachine_runtime::HostContext;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "fakemachine",
    version,
    about = "Run workloads inside disposable, sandboxed virtual machines"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List backend names and whether this host supports them.
    Backends,
    /// Check the host prerequisites of a backend.
    Check {
        /// Backend name (auto, kvm or uml).
        #[arg(default_value = "auto")]
        backend: String,
    },
    /// Show how a backend would present the machine to the guest.
    Inspect {
        #[command(flatten)]
        machine: MachineArgs,
    },
    /// Boot the machine and wait for it to power off.
    Run {
        #[command(flatten)]
        machine: MachineArgs,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe") || msg.contains("failed printing to stdout") {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FAKEMACHINE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let ctx = HostContext::system();
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Backends => commands::backends::run(&ctx, json_output),
        Commands::Check { backend } => {
            commands::check::run(&backend, ctx.host.as_ref(), json_output)
        }
        Commands::Inspect { machine } => commands::inspect::run(&machine, &ctx, json_output),
        Commands::Run { machine } => commands::run::run(&machine, &ctx),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}
