use super::{runtime_error, MachineArgs, CONFIG_PREFIX, EXIT_FAILURE};
use fakemachine_runtime::{select_backend_with, HostContext};

/// Boot the machine and return the guest's exit code as the process status.
pub fn run(args: &MachineArgs, ctx: &HostContext) -> Result<u8, String> {
    let machine = args.build()?;
    machine
        .validate()
        .map_err(|e| format!("{CONFIG_PREFIX} {e}"))?;

    let name = machine.backend().to_owned();
    let backend =
        select_backend_with(&name, machine, ctx.clone()).map_err(|e| runtime_error(&e))?;
    tracing::info!("booting with the {} backend", backend.name());

    let code = backend.start().map_err(|e| runtime_error(&e))?;
    if code != 0 {
        tracing::warn!(code, "guest exited with failure");
    }
    Ok(u8::try_from(code).unwrap_or(EXIT_FAILURE))
}
