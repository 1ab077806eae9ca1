mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{exit_code, report_error};
use imagebuilder_core::{CoreError, EngineConfig, ImageBuilder};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_STORE: &str = "~/.local/share/imagebuilder/store";
const DEFAULT_WORK_DIR: &str = "~/.local/share/imagebuilder/work";

#[derive(Debug, Parser)]
#[command(
    name = "imagebuilder",
    version,
    about = "Validate, compose, and provision cluster application packages"
)]
struct Cli {
    /// Image store root directory. Overrides the config file.
    #[arg(long, global = true)]
    store: Option<String>,

    /// Working directory for locks and the write-ahead log. Overrides the config file.
    #[arg(long, global = true)]
    work_dir: Option<String>,

    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Timeout in seconds for store operations of one build.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Keep stored content when a package changed without a version bump.
    #[arg(long, default_value_t = false, global = true)]
    skip_checksum_validation: bool,

    /// Validate services one at a time.
    #[arg(long, default_value_t = false, global = true)]
    sequential: bool,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a build layout and provision its application type.
    BuildType {
        /// Build layout directory.
        #[arg(default_value = ".")]
        build_path: PathBuf,
    },
    /// Run every check of build-type without writing to the store.
    Validate {
        /// Build layout directory.
        #[arg(default_value = ".")]
        build_path: PathBuf,
    },
    /// Print the application type name and version of a build layout.
    TypeInfo {
        /// Build layout directory.
        #[arg(default_value = ".")]
        build_path: PathBuf,
    },
    /// Create an application from a provisioned application type.
    BuildApp {
        type_name: String,
        type_version: String,
        application_id: String,
        /// Application name URI, e.g. fabric:/shop.
        name_uri: String,
        /// Parameter override NAME=VALUE (repeatable).
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
    },
    /// Write a new instance version of an application against another type version.
    UpgradeApp {
        type_name: String,
        target_version: String,
        application_id: String,
        /// Parameter override NAME=VALUE (repeatable).
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
    },
    /// List provisioned versions of an application type.
    ListTypes { type_name: String },
    /// Show an application instance (latest unless --instance is given).
    ShowInstance {
        type_name: String,
        application_id: String,
        #[arg(long)]
        instance: Option<u32>,
    },
    /// Verify store checksums and provisioning records.
    VerifyStore,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IMAGEBUILDER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        return ExitCode::from(commands::completions::run::<Cli>(shell));
    }

    let json = cli.json;
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            report_error(&e, json);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<u8, CoreError> {
    let engine = ImageBuilder::new(engine_config(&cli)?)?;
    let json = cli.json;

    match cli.command {
        Commands::BuildType { build_path } => commands::build_type::run(&engine, &build_path, json),
        Commands::Validate { build_path } => commands::validate::run(&engine, &build_path, json),
        Commands::TypeInfo { build_path } => commands::type_info::run(&engine, &build_path, json),
        Commands::BuildApp {
            type_name,
            type_version,
            application_id,
            name_uri,
            params,
        } => commands::build_app::run(
            &engine,
            &commands::build_app::BuildAppArgs {
                type_name: &type_name,
                type_version: &type_version,
                application_id: &application_id,
                name_uri: &name_uri,
                params: &params,
            },
            json,
        ),
        Commands::UpgradeApp {
            type_name,
            target_version,
            application_id,
            params,
        } => commands::upgrade_app::run(
            &engine,
            &type_name,
            &target_version,
            &application_id,
            &params,
            json,
        ),
        Commands::ListTypes { type_name } => commands::list_types::run(&engine, &type_name, json),
        Commands::ShowInstance {
            type_name,
            application_id,
            instance,
        } => commands::show_instance::run(&engine, &type_name, &application_id, instance, json),
        Commands::VerifyStore => commands::verify_store::run(&engine, json),
        Commands::Completions { shell } => Ok(commands::completions::run::<Cli>(shell)),
    }
}

/// Config file values (or defaults), then command-line overrides.
fn engine_config(cli: &Cli) -> Result<EngineConfig, CoreError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::new(expand_tilde(DEFAULT_STORE), expand_tilde(DEFAULT_WORK_DIR)),
    };
    if let Some(store) = &cli.store {
        config.store_root = expand_tilde(store);
    }
    if let Some(work_dir) = &cli.work_dir {
        config.working_dir = expand_tilde(work_dir);
    }
    if let Some(secs) = cli.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    if cli.skip_checksum_validation {
        config.skip_checksum_validation = true;
    }
    if cli.sequential {
        config.parallel_validation = false;
    }
    Ok(config)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_build_app_params() {
        let cli = Cli::try_parse_from([
            "imagebuilder",
            "build-app",
            "ShopType",
            "1.0",
            "shop",
            "fabric:/shop",
            "-p",
            "A=1",
            "--param",
            "B=2",
        ])
        .unwrap();
        match cli.command {
            Commands::BuildApp { params, .. } => assert_eq!(params, vec!["A=1", "B=2"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "imagebuilder",
            "--store",
            "/tmp/s",
            "--work-dir",
            "/tmp/w",
            "--timeout",
            "7",
            "--sequential",
            "verify-store",
        ])
        .unwrap();
        let config = engine_config(&cli).unwrap();
        assert_eq!(config.store_root, PathBuf::from("/tmp/s"));
        assert_eq!(config.working_dir, PathBuf::from("/tmp/w"));
        assert_eq!(config.default_timeout_secs, 7);
        assert!(!config.parallel_validation);
        assert!(!config.skip_checksum_validation);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imagebuilder.toml");
        EngineConfig::new("/from/file", "/work/file")
            .with_skip_checksum_validation(true)
            .save(&path)
            .unwrap();
        let cli = Cli::try_parse_from([
            "imagebuilder",
            "--config",
            path.to_str().unwrap(),
            "--store",
            "/from/flag",
            "verify-store",
        ])
        .unwrap();
        let config = engine_config(&cli).unwrap();
        assert_eq!(config.store_root, PathBuf::from("/from/flag"));
        assert_eq!(config.working_dir, PathBuf::from("/work/file"));
        assert!(config.skip_checksum_validation);
    }

    #[test]
    fn expand_tilde_passes_absolute_paths() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
