use super::{json_pretty, EXIT_SUCCESS};
use imagebuilder_core::{CoreError, ImageBuilder};
use std::path::Path;

pub fn run(engine: &ImageBuilder, build_path: &Path, json: bool) -> Result<u8, CoreError> {
    let info = engine.get_application_type_info(build_path)?;
    if json {
        println!("{}", json_pretty(&info)?);
    } else {
        println!("name:    {}", info.name);
        println!("version: {}", info.version);
    }
    Ok(EXIT_SUCCESS)
}
