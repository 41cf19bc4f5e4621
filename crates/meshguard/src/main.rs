use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use meshguard::{
    AccessRequest, AttributeValue, Clock, ManualClock, MeshGuard, MeshGuardConfig, PolicyEngine,
    RootError, SystemClock, Timestamp,
};
use meshguard_policy::PolicyEngineSettings;

/// Meshguard: decide-and-enforce core for zero-trust service meshes
#[derive(Parser, Debug)]
#[command(name = "meshguard", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the effective configuration to the config path
    Init,

    /// Policy bundle tooling
    Policies {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Evaluate one request against the configured policies
    Evaluate {
        /// Resource being accessed, e.g. /api/orders
        #[arg(long)]
        resource: String,

        /// Action being performed, e.g. read
        #[arg(long)]
        action: String,

        /// Subject attribute as key=value (repeatable)
        #[arg(long = "subject", value_parser = parse_key_value)]
        subject: Vec<(String, AttributeValue)>,

        /// Extra resource attribute as key=value (repeatable)
        #[arg(long = "resource-attr", value_parser = parse_key_value)]
        resource_attrs: Vec<(String, AttributeValue)>,

        /// Environment attribute as key=value (repeatable)
        #[arg(long = "env", value_parser = parse_key_value)]
        env: Vec<(String, AttributeValue)>,

        /// Evaluate at this RFC 3339 instant instead of now
        #[arg(long)]
        at: Option<String>,
    },

    /// Isolation tooling
    Isolation {
        #[command(subcommand)]
        command: IsolationCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommands {
    /// Print the configured policies as a JSON bundle
    Export,

    /// Validate a JSON policy bundle and print its stats
    Check {
        /// Bundle file to validate
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum IsolationCommands {
    /// Print the configured escalation curves as JSON
    Policies,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("meshguard=debug,meshguard_policy=debug,meshguard_isolation=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshguard=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse `key=value`. Booleans and numbers are typed; anything else is a string.
fn parse_key_value(raw: &str) -> Result<(String, AttributeValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = if let Ok(b) = value.parse::<bool>() {
        AttributeValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        AttributeValue::Int(i)
    } else if let Ok(f) = value.parse::<f64>() {
        AttributeValue::Float(f)
    } else {
        AttributeValue::String(value.to_string())
    };
    Ok((key.to_string(), value))
}

fn config_path(path: Option<&PathBuf>) -> PathBuf {
    path.cloned()
        .unwrap_or_else(MeshGuardConfig::default_config_path)
}

fn load_config(path: Option<&PathBuf>) -> Result<MeshGuardConfig, RootError> {
    MeshGuardConfig::load(&config_path(path))
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli);
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), RootError> {
    let config_path = cli.config.as_ref();
    match cli.command {
        Commands::Init => cmd_init(config_path),
        Commands::Policies { command } => match command {
            PolicyCommands::Export => cmd_policies_export(config_path),
            PolicyCommands::Check { file } => cmd_policies_check(config_path, &file),
        },
        Commands::Evaluate {
            resource,
            action,
            subject,
            resource_attrs,
            env,
            at,
        } => {
            let mut request = AccessRequest::new(resource, action);
            for (key, value) in subject {
                request = request.with_subject(key, value);
            }
            for (key, value) in resource_attrs {
                request = request.with_resource_attribute(key, value);
            }
            for (key, value) in env {
                request = request.with_environment(key, value);
            }
            cmd_evaluate(config_path, &request, at.as_deref())
        }
        Commands::Isolation { command } => match command {
            IsolationCommands::Policies => cmd_isolation_policies(config_path),
        },
    }
}

fn cmd_init(path: Option<&PathBuf>) -> Result<(), RootError> {
    let config = load_config(path)?;
    let save_path = config_path(path);
    config.save(&save_path)?;

    info!(path = %save_path.display(), "configuration written");
    println!("Meshguard configuration written to {}", save_path.display());
    Ok(())
}

fn cmd_policies_export(path: Option<&PathBuf>) -> Result<(), RootError> {
    let config = load_config(path)?;
    let guard = MeshGuard::from_config(&config, Arc::new(SystemClock))?;
    println!("{}", guard.engine().export_policies()?);
    Ok(())
}

fn cmd_policies_check(path: Option<&PathBuf>, file: &Path) -> Result<(), RootError> {
    let config = load_config(path)?;
    let data = std::fs::read_to_string(file)?;

    let engine = PolicyEngine::with_config(
        PolicyEngineSettings {
            load_defaults: false,
            ..config.policy.engine_settings()
        },
        Arc::new(SystemClock),
    );
    let imported = engine.import_policies(&data)?;

    info!(file = %file.display(), imported, "policy bundle is valid");
    println!("{}", serde_json::to_string_pretty(&engine.get_stats())?);
    Ok(())
}

fn cmd_evaluate(
    path: Option<&PathBuf>,
    request: &AccessRequest,
    at: Option<&str>,
) -> Result<(), RootError> {
    let config = load_config(path)?;
    let clock: Arc<dyn Clock> = match at {
        Some(instant) => Arc::new(ManualClock::new(Timestamp::from_rfc3339(instant)?)),
        None => Arc::new(SystemClock),
    };
    let guard = MeshGuard::from_config(&config, clock)?;

    let verdict = guard.authorize(request);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

fn cmd_isolation_policies(path: Option<&PathBuf>) -> Result<(), RootError> {
    let config = load_config(path)?;
    let policies = config.isolation.effective_policies();
    println!("{}", serde_json::to_string_pretty(&policies)?);
    Ok(())
}
