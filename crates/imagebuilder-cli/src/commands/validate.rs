use super::{json_pretty, with_spinner, EXIT_SUCCESS};
use imagebuilder_core::{CoreError, ImageBuilder};
use std::path::Path;

pub fn run(engine: &ImageBuilder, build_path: &Path, json: bool) -> Result<u8, CoreError> {
    let info = with_spinner(
        json,
        "validating application package...",
        "application package is valid",
        "validation failed",
        || engine.validate_application_package(build_path),
    )?;
    if json {
        let payload = serde_json::json!({
            "name": info.name,
            "version": info.version,
            "valid": true,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{}:{} is valid", info.name, info.version);
    }
    Ok(EXIT_SUCCESS)
}
