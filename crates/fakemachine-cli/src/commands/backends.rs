use super::{json_pretty, EXIT_SUCCESS};
use fakemachine_runtime::{backend_names, probe_backends, BackendKind, BackendProbe, HostContext};
use serde::Serialize;

#[derive(Serialize)]
struct BackendsReport {
    names: &'static [&'static str],
    default: &'static str,
    probes: Vec<BackendProbe>,
}

pub fn run(ctx: &HostContext, json_output: bool) -> Result<u8, String> {
    let report = BackendsReport {
        names: backend_names(),
        default: BackendKind::Auto.resolve().as_str(),
        probes: probe_backends(ctx),
    };

    if json_output {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("{:<6} {}", "auto", report.default);
    for probe in &report.probes {
        match &probe.reason {
            None => println!("{:<6} available", probe.name),
            Some(reason) => println!("{:<6} unavailable: {reason}", probe.name),
        }
    }
    Ok(EXIT_SUCCESS)
}
