use super::build_app::print_result;
use super::{parse_params, with_spinner};
use imagebuilder_core::{CoreError, ImageBuilder};

pub fn run(
    engine: &ImageBuilder,
    type_name: &str,
    target_version: &str,
    application_id: &str,
    raw_params: &[String],
    json: bool,
) -> Result<u8, CoreError> {
    let params = parse_params(raw_params)?;
    let result = with_spinner(
        json,
        "upgrading application...",
        "application upgraded",
        "upgrade failed",
        || engine.upgrade_application(type_name, target_version, application_id, &params),
    )?;
    print_result(&result, json)
}
