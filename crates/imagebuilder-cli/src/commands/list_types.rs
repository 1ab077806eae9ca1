use super::{json_pretty, EXIT_SUCCESS};
use imagebuilder_core::{CoreError, ImageBuilder};

pub fn run(engine: &ImageBuilder, type_name: &str, json: bool) -> Result<u8, CoreError> {
    let records = engine.list_application_types(type_name)?;
    if json {
        println!("{}", json_pretty(&records)?);
    } else if records.is_empty() {
        println!("no provisioned versions of {type_name}");
    } else {
        println!("{:<12} {:<10} PROVISIONED_AT", "VERSION", "SERVICES");
        for r in &records {
            println!(
                "{:<12} {:<10} {}",
                r.application_type_version,
                r.services.len(),
                r.provisioned_at
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
