use super::{json_pretty, CONFIG_PREFIX, EXIT_SUCCESS, EXIT_UNSUPPORTED};
use fakemachine_runtime::{
    check_kvm_prereqs, check_uml_prereqs, format_missing, BackendKind, Host, MissingPrereq,
};

/// Prerequisites of the concrete backend `kind` stands for.
pub fn collect(kind: BackendKind, host: &dyn Host) -> Vec<MissingPrereq> {
    match kind.resolve() {
        BackendKind::Uml => check_uml_prereqs(host),
        BackendKind::Auto | BackendKind::Kvm => check_kvm_prereqs(host),
    }
}

pub fn run(backend: &str, host: &dyn Host, json_output: bool) -> Result<u8, String> {
    let Ok(kind) = backend.parse::<BackendKind>() else {
        return Err(format!("{CONFIG_PREFIX} backend {backend} does not exist"));
    };
    let resolved = kind.resolve();
    let missing = collect(kind, host);

    if json_output {
        let json = serde_json::json!({
            "backend": resolved.as_str(),
            "ok": missing.is_empty(),
            "missing": missing.iter().map(|m| serde_json::json!({
                "name": m.name,
                "purpose": m.purpose,
                "install_hint": m.install_hint,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else if missing.is_empty() {
        println!("{resolved}: all prerequisites satisfied");
    } else {
        print!("{}", format_missing(resolved.as_str(), &missing));
    }

    Ok(if missing.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_UNSUPPORTED
    })
}
