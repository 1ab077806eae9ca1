pub mod build_app;
pub mod build_type;
pub mod completions;
pub mod list_types;
pub mod show_instance;
pub mod type_info;
pub mod upgrade_app;
pub mod validate;
pub mod verify_store;

use imagebuilder_core::{CoreError, ErrorKind};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_CONFLICT: u8 = 4;
pub const EXIT_NOT_FOUND: u8 = 5;

/// Process exit code for an engine error.
pub fn exit_code(err: &CoreError) -> u8 {
    match err.kind() {
        ErrorKind::Validation | ErrorKind::Schema => EXIT_MANIFEST_ERROR,
        ErrorKind::Conflict => EXIT_CONFLICT,
        ErrorKind::Timeout => EXIT_STORE_ERROR,
        ErrorKind::NotFound => EXIT_NOT_FOUND,
        ErrorKind::Internal => match err {
            CoreError::Store(_) => EXIT_STORE_ERROR,
            _ => EXIT_FAILURE,
        },
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CoreError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Print an error, itemizing aggregated violations and conflicts.
pub fn report_error(err: &CoreError, json: bool) {
    if json {
        let details = match err {
            CoreError::Validation(v) => serde_json::to_value(&v.violations).ok(),
            CoreError::Conflict(c) => serde_json::to_value(&c.conflicts).ok(),
            _ => None,
        };
        let payload = serde_json::json!({
            "error": err.kind().to_string(),
            "message": err.to_string(),
            "details": details,
        });
        match json_pretty(&payload) {
            Ok(s) => println!("{s}"),
            Err(_) => eprintln!("error: {err}"),
        }
        return;
    }

    let red = console::Style::new().red().bold();
    match err {
        CoreError::Validation(v) => {
            eprintln!(
                "{} validation failed with {} violation(s)",
                red.apply_to("error:"),
                v.violations.len()
            );
            for violation in &v.violations {
                eprintln!("  {violation}");
            }
        }
        CoreError::Conflict(c) => {
            eprintln!(
                "{} build conflicts with the store ({} conflict(s))",
                red.apply_to("error:"),
                c.conflicts.len()
            );
            for conflict in &c.conflicts {
                eprintln!("  {conflict}");
            }
        }
        other => eprintln!("{} {other}", red.apply_to("error:")),
    }
}

/// Parse repeated `NAME=VALUE` parameter arguments. Later values win.
pub fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>, CoreError> {
    let mut params = BTreeMap::new();
    for item in raw {
        let Some((name, value)) = item.split_once('=') else {
            return Err(CoreError::InvalidArgument(format!(
                "parameter '{item}' must be NAME=VALUE"
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "parameter '{item}' has an empty name"
            )));
        }
        params.insert(name.to_owned(), value.to_owned());
    }
    Ok(params)
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `op` under a spinner unless output is JSON.
pub fn with_spinner<T>(
    json: bool,
    running: &str,
    done: &str,
    failed: &str,
    op: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let pb = (!json).then(|| spinner(running));
    let result = op();
    if let Some(pb) = &pb {
        match &result {
            Ok(_) => spin_ok(pb, done),
            Err(_) => spin_fail(pb, failed),
        }
    }
    result
}
