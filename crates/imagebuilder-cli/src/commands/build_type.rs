use super::{json_pretty, with_spinner, EXIT_SUCCESS};
use imagebuilder_core::{CoreError, ImageBuilder};
use std::path::Path;

pub fn run(engine: &ImageBuilder, build_path: &Path, json: bool) -> Result<u8, CoreError> {
    let result = with_spinner(
        json,
        "building application type...",
        "application type provisioned",
        "build failed",
        || engine.build_application_type(build_path),
    )?;

    if json {
        println!("{}", json_pretty(&result)?);
    } else if result.already_provisioned {
        println!(
            "{}:{} is already provisioned",
            result.application_type_name, result.application_type_version
        );
    } else {
        println!(
            "provisioned {}:{}",
            result.application_type_name, result.application_type_version
        );
        println!(
            "uploaded: {}  reused packages: {}",
            result.uploaded_keys.len(),
            result.reused_packages
        );
        for pkg in &result.service_packages {
            println!(
                "  {} {} (rollout {})",
                pkg.name, pkg.manifest_version, pkg.rollout_version
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
