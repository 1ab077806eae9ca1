//! CLI subprocess integration tests.
//!
//! These tests invoke the `imagebuilder` binary as a subprocess and verify
//! exit codes, stdout content, and JSON output stability.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Dirs {
    store: tempfile::TempDir,
    work: tempfile::TempDir,
    build: tempfile::TempDir,
}

impl Dirs {
    fn new() -> Self {
        Self {
            store: tempfile::tempdir().unwrap(),
            work: tempfile::tempdir().unwrap(),
            build: tempfile::tempdir().unwrap(),
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_imagebuilder"))
            .env_remove("IMAGEBUILDER_LOG")
            .arg("--store")
            .arg(self.store.path())
            .arg("--work-dir")
            .arg(self.work.path())
            .args(args)
            .output()
            .unwrap()
    }
}

fn write_layout(root: &Path, version: &str, percent: &str) -> PathBuf {
    let service = root.join("Echo");
    std::fs::create_dir_all(service.join("Code")).unwrap();
    std::fs::write(
        root.join("ApplicationManifest.toml"),
        format!(
            r#"
name = "EchoType"
version = "{version}"

[[parameters]]
name = "Count"
default_value = "1"

[[service_manifest_imports]]
service_manifest_ref = {{ name = "Echo", version = "1.0" }}

[[default_services]]
name = "Echo"

[default_services.service]
service_type_name = "EchoSvc"
kind = "stateless"
instance_count = "[Count]"

[policies.health_policy]
max_percent_unhealthy_deployed_applications = "{percent}"
"#
        ),
    )
    .unwrap();
    std::fs::write(
        service.join("ServiceManifest.toml"),
        r#"
name = "Echo"
version = "1.0"

[[service_types]]
service_type_name = "EchoSvc"
kind = "stateless"

[[code_packages]]
name = "Code"
version = "1.0"

[code_packages.entry_point]
kind = "exe_host"
program = "echo.exe"
"#,
    )
    .unwrap();
    std::fs::write(service.join("Code").join("echo.exe"), "echo").unwrap();
    root.to_path_buf()
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_imagebuilder"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("imagebuilder"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_imagebuilder"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["build-type", "validate", "build-app", "upgrade-app", "verify-store"] {
        assert!(stdout.contains(cmd), "help must list '{cmd}'");
    }
}

#[test]
fn cli_type_info_json() {
    let dirs = Dirs::new();
    let layout = write_layout(dirs.build.path(), "1.0", "0");
    let output = dirs.run(&["--json", "type-info", &layout.to_string_lossy()]);
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["name"], "EchoType");
    assert_eq!(json["version"], "1.0");
}

#[test]
fn cli_build_type_then_build_app() {
    let dirs = Dirs::new();
    let layout = write_layout(dirs.build.path(), "1.0", "0");

    let built = dirs.run(&["--json", "build-type", &layout.to_string_lossy()]);
    assert!(
        built.status.success(),
        "build-type must exit 0. stderr: {}",
        String::from_utf8_lossy(&built.stderr)
    );
    let json = stdout_json(&built);
    assert_eq!(json["already_provisioned"], false);

    let app = dirs.run(&[
        "--json",
        "build-app",
        "EchoType",
        "1.0",
        "echo",
        "fabric:/echo",
        "--param",
        "Count=3",
    ]);
    assert!(
        app.status.success(),
        "build-app must exit 0. stderr: {}",
        String::from_utf8_lossy(&app.stderr)
    );
    assert_eq!(stdout_json(&app)["instance_version"], 1);

    let shown = dirs.run(&["--json", "show-instance", "EchoType", "echo"]);
    assert!(shown.status.success());
    let instance = stdout_json(&shown);
    assert_eq!(instance["name_uri"], "fabric:/echo");
    assert_eq!(
        instance["default_services"][0]["service"]["instance_count"],
        "3"
    );

    let listed = dirs.run(&["--json", "list-types", "EchoType"]);
    assert!(listed.status.success());
    assert_eq!(stdout_json(&listed).as_array().unwrap().len(), 1);

    let verified = dirs.run(&["verify-store"]);
    assert!(verified.status.success());
}

#[test]
fn cli_validation_failure_exits_with_manifest_error() {
    let dirs = Dirs::new();
    let layout = write_layout(dirs.build.path(), "1.0", "101");
    let output = dirs.run(&["--json", "validate", &layout.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(2));
    let json = stdout_json(&output);
    assert_eq!(json["error"], "validation");
    assert_eq!(json["details"][0]["rule"], "InvalidValue");
}

#[test]
fn cli_missing_layout_exits_not_found() {
    let dirs = Dirs::new();
    let missing = dirs.build.path().join("nope");
    let output = dirs.run(&["build-type", &missing.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(5));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}

#[test]
fn cli_bad_param_syntax_fails() {
    let dirs = Dirs::new();
    let output = dirs.run(&[
        "build-app",
        "EchoType",
        "1.0",
        "echo",
        "fabric:/echo",
        "--param",
        "Count",
    ]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_completions_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_imagebuilder"))
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("imagebuilder"));
}
