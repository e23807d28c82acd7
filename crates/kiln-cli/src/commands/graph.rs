use super::{build_graph, load_spec, BuildArgs, CommandError, EXIT_SUCCESS};
use std::path::Path;

/// Print the marshalled graph. The output is always JSON.
pub fn run(spec_path: &Path, args: &BuildArgs) -> Result<u8, CommandError> {
    let spec = load_spec(spec_path)?;
    let (_, definition) = build_graph(&spec, args)?;
    let json = definition
        .to_json()
        .map_err(|e| CommandError::failure(format!("JSON serialization failed: {e}")))?;
    println!("{json}");
    Ok(EXIT_SUCCESS)
}
