use super::{json_pretty, EXIT_SUCCESS};
use imagebuilder_core::{CoreError, ImageBuilder};
use imagebuilder_schema::ApplicationInstance;

pub fn run(
    engine: &ImageBuilder,
    type_name: &str,
    application_id: &str,
    instance_version: Option<u32>,
    json: bool,
) -> Result<u8, CoreError> {
    let instance = engine.get_application_instance(type_name, application_id, instance_version)?;
    if json {
        println!("{}", json_pretty(&instance)?);
    } else {
        print_instance(&instance);
    }
    Ok(EXIT_SUCCESS)
}

fn print_instance(instance: &ApplicationInstance) {
    let bold = console::Style::new().bold();
    println!(
        "{} {} instance {}",
        bold.apply_to(&instance.application_id),
        instance.name_uri,
        instance.instance_version
    );
    println!(
        "type: {}:{}",
        instance.application_type_name, instance.application_type_version
    );
    println!("application package: {}", instance.application_package_ref);
    println!("service packages:");
    for pkg in &instance.service_package_refs {
        println!(
            "  {} {} (rollout {})",
            pkg.name, pkg.manifest_version, pkg.rollout_version
        );
    }
    if !instance.default_services.is_empty() {
        println!("default services:");
        for ds in &instance.default_services {
            match ds.service_dns_name.as_deref() {
                Some(dns) => println!("  {} ({dns})", ds.name),
                None => println!("  {}", ds.name),
            }
        }
    }
}
