use super::{json_pretty, EXIT_STORE_ERROR, EXIT_SUCCESS};
use imagebuilder_core::{CoreError, ImageBuilder};

pub fn run(engine: &ImageBuilder, json: bool) -> Result<u8, CoreError> {
    let report = engine.verify_store()?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "store integrity: {}/{} checksums passed, {}/{} records passed",
            report.passed, report.checked, report.records_passed, report.records_checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.key, f.reason);
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
