use super::{json_pretty, parse_params, with_spinner, EXIT_SUCCESS};
use imagebuilder_core::{ApplicationBuildResult, CoreError, ImageBuilder};

pub struct BuildAppArgs<'a> {
    pub type_name: &'a str,
    pub type_version: &'a str,
    pub application_id: &'a str,
    pub name_uri: &'a str,
    pub params: &'a [String],
}

pub fn run(engine: &ImageBuilder, args: &BuildAppArgs<'_>, json: bool) -> Result<u8, CoreError> {
    let params = parse_params(args.params)?;
    let result = with_spinner(
        json,
        "building application...",
        "application built",
        "build failed",
        || {
            engine.build_application(
                args.type_name,
                args.type_version,
                args.application_id,
                args.name_uri,
                &params,
            )
        },
    )?;
    print_result(&result, json)
}

pub(crate) fn print_result(result: &ApplicationBuildResult, json: bool) -> Result<u8, CoreError> {
    if json {
        println!("{}", json_pretty(result)?);
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "application {} instance {} ({}:{})",
        result.application_id,
        result.instance_version,
        result.application_type_name,
        result.application_type_version
    );
    println!("application package: {}", result.application_package);
    for pkg in &result.service_packages {
        println!(
            "  {} {} (rollout {})",
            pkg.name, pkg.manifest_version, pkg.rollout_version
        );
    }
    println!("new artifacts: {}", result.written_keys.len());
    Ok(EXIT_SUCCESS)
}
