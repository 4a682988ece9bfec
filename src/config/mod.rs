pub mod merge;
pub mod schema;

pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::model::RosterEntry;
use anyhow::Context;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "agency.toml";

/// Load configuration by merging global, workspace, environment and CLI
/// sources. Precedence: CLI > environment > workspace config > global
/// config > defaults.
///
/// Missing config files are handled gracefully (defaults apply).
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    load_config_with_env(cli, |key| std::env::var(key).ok())
}

/// [`load_config`] with an injectable environment lookup.
pub fn load_config_with_env(
    cli: &Cli,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<AppConfig> {
    // Layer 1: Global config (~/.config/agency/agency.toml or platform equivalent)
    let global = load_global_config();

    // Layer 3 and 4 are needed up front: they may move the agency dir, and
    // the workspace config lives inside it.
    let env_partial = env_to_partial(&env)?;
    let cli_partial = cli_to_partial(cli);

    // Layer 2: Workspace config ({agency_dir}/agency.toml, or --config)
    let workspace = match cli_config_path(cli) {
        Some(path) => load_toml_file(path)
            .with_context(|| format!("Config file {} could not be loaded", path.display()))?,
        None => {
            let agency_dir = cli_partial
                .agency_dir
                .clone()
                .or_else(|| env_partial.agency_dir.clone())
                .or_else(|| global.agency_dir.clone())
                .unwrap_or_else(|| PathBuf::from("./agency"));
            load_toml_file(&agency_dir.join(CONFIG_FILE_NAME)).unwrap_or_default()
        }
    };

    // Merge: CLI > env > workspace > global > defaults
    let config = cli_partial
        .with_fallback(env_partial)
        .with_fallback(workspace)
        .with_fallback(global)
        .finalize();

    Ok(config)
}

/// Load global config from the platform-specific config directory.
/// Returns empty PartialConfig if file not found.
fn load_global_config() -> PartialConfig {
    match global_config_path() {
        Some(p) => load_toml_file(&p).unwrap_or_default(),
        None => {
            tracing::debug!("Could not determine global config directory");
            PartialConfig::default()
        }
    }
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns None on file-not-found; parse errors are logged and skipped.
fn load_toml_file(path: &Path) -> Option<PartialConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            match toml::from_str::<ConfigFile>(&contents)
                .context(format!("Failed to parse {}", path.display()))
            {
                Ok(config_file) => {
                    tracing::info!("Loaded config from {}", path.display());
                    let base = path.parent().unwrap_or_else(|| Path::new("."));
                    Some(config_file.to_partial(base))
                }
                Err(e) => {
                    tracing::warn!("Config parse error: {:#}", e);
                    None
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read config at {}: {}", path.display(), e);
            None
        }
    }
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/agency/agency.toml
/// macOS: ~/Library/Application Support/agency/agency.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "agency")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// Read the supported environment variables into a PartialConfig.
fn env_to_partial(env: &impl Fn(&str) -> Option<String>) -> anyhow::Result<PartialConfig> {
    let port = match env("PORT") {
        Some(raw) => Some(raw.parse::<u16>().map_err(|e| {
            crate::error::ConfigError::InvalidValue {
                key: "PORT".to_string(),
                message: e.to_string(),
            }
        })?),
        None => None,
    };
    Ok(PartialConfig {
        agency_dir: env("AGENCY_DIR").map(PathBuf::from),
        data_dir: env("DATA_DIR").map(PathBuf::from),
        projects_dir: env("PROJECTS_DIR").map(PathBuf::from),
        host: env("HOST"),
        port,
        ..Default::default()
    })
}

fn cli_config_path(cli: &Cli) -> Option<&Path> {
    match &cli.command {
        Commands::Serve { config, .. } => config.as_deref(),
        Commands::Init { .. } => None,
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    match &cli.command {
        Commands::Serve {
            agency_dir,
            data_dir,
            projects_dir,
            host,
            port,
            auto_orchestrate,
            interval_ms,
            config: _,
        } => PartialConfig {
            agency_dir: agency_dir.clone(),
            data_dir: data_dir.clone(),
            projects_dir: projects_dir.clone(),
            host: host.clone(),
            port: *port,
            // A bare flag can only turn the loop on.
            auto_orchestrate: auto_orchestrate.then_some(true),
            orchestration_interval_ms: *interval_ms,
            ..Default::default()
        },
        Commands::Init { agency_dir } => PartialConfig {
            agency_dir: agency_dir.clone(),
            ..Default::default()
        },
    }
}

/// Create the agency directory layout: data and projects directories plus a
/// stub `AGENT.md` for every roster member that lacks one. Existing role
/// definitions are left alone. Returns the stubs that were written.
pub fn scaffold(config: &AppConfig) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
    std::fs::create_dir_all(&config.projects_dir)
        .with_context(|| format!("Failed to create {}", config.projects_dir.display()))?;

    let mut written = Vec::new();
    for entry in &config.roster {
        let path = crate::agent::prompt::role_definition_path(&config.agency_dir, &entry.name);
        if path.exists() {
            continue;
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::write(&path, stub_role_definition(entry))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

fn stub_role_definition(entry: &RosterEntry) -> String {
    let specialization = entry
        .specialization
        .as_deref()
        .map(|s| format!(" Your specialization is {s}."))
        .unwrap_or_default();
    format!(
        "# {name}\n\nYou are {name}, the team's {role}.{specialization}\n\n\
         Describe this agent's responsibilities, working style and definition of done here.\n",
        name = entry.name,
        role = entry.agent_type.as_str(),
    )
}
