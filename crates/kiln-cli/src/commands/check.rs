use super::{json_pretty, load_spec, CommandError, EXIT_SUCCESS};
use console::style;
use kiln_schema::compute_spec_id;
use std::path::Path;

pub fn run(spec_path: &Path, json: bool) -> Result<u8, CommandError> {
    let spec = load_spec(spec_path)?;
    let identity = compute_spec_id(&spec)
        .map_err(|e| CommandError::failure(format!("cannot hash spec: {e}")))?;

    if json {
        let payload = serde_json::json!({
            "name": spec.name,
            "version": spec.version,
            "revision": spec.revision,
            "spec_id": identity.spec_id,
            "short_id": identity.short_id,
            "targets": spec.targets.keys().collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{} {} {} ({})",
            style("ok").green().bold(),
            spec.name,
            spec.version,
            style(&identity.short_id).dim()
        );
    }
    Ok(EXIT_SUCCESS)
}
