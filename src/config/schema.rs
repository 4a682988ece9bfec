use serde::Deserialize;
use std::path::PathBuf;

use crate::model::RosterEntry;
use crate::orchestration::types::ProcessTimeouts;

/// The TOML file structure for agency.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub paths: Option<PathsConfig>,
    pub server: Option<ServerConfig>,
    pub orchestration: Option<OrchestrationConfig>,
    pub agent: Option<AgentConfig>,
    /// If specified, fully replaces the default roster.
    pub roster: Option<Vec<RosterEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    pub agency_dir: Option<String>,
    pub data_dir: Option<String>,
    pub projects_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct OrchestrationConfig {
    pub interval_ms: Option<u64>,
    pub auto_start: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// The agent CLI executable.
    pub command: Option<String>,
    pub inject_timeout_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agency_dir: PathBuf,
    pub data_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub orchestration_interval_ms: u64,
    pub auto_orchestrate: bool,
    pub cli_command: String,
    pub inject_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub stop_timeout_ms: u64,
    pub roster: Vec<RosterEntry>,
}

impl AppConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("agency.db")
    }

    /// Base URL agents use to call back into the API.
    pub fn api_base(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" => "localhost",
            other => other,
        };
        format!("http://{host}:{}/api", self.port)
    }

    pub fn timeouts(&self) -> ProcessTimeouts {
        ProcessTimeouts {
            inject_wait: std::time::Duration::from_millis(self.inject_timeout_ms),
            stop_grace: std::time::Duration::from_millis(self.stop_grace_ms),
            stop_bound: std::time::Duration::from_millis(self.stop_timeout_ms),
            ..ProcessTimeouts::default()
        }
    }
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub agency_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub projects_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub orchestration_interval_ms: Option<u64>,
    pub auto_orchestrate: Option<bool>,
    pub cli_command: Option<String>,
    pub inject_timeout_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub roster: Option<Vec<RosterEntry>>,
}

impl ConfigFile {
    /// Flatten the sectioned file into a mergeable layer. Relative paths are
    /// resolved against `base`, the directory the file was read from.
    pub fn to_partial(self, base: &std::path::Path) -> PartialConfig {
        let resolve = |p: String| {
            let path = PathBuf::from(p);
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        };
        let paths = self.paths;
        let server = self.server;
        let orchestration = self.orchestration;
        let agent = self.agent;
        PartialConfig {
            agency_dir: paths.as_ref().and_then(|p| p.agency_dir.clone()).map(resolve),
            data_dir: paths.as_ref().and_then(|p| p.data_dir.clone()).map(resolve),
            projects_dir: paths.as_ref().and_then(|p| p.projects_dir.clone()).map(resolve),
            host: server.as_ref().and_then(|s| s.host.clone()),
            port: server.as_ref().and_then(|s| s.port),
            orchestration_interval_ms: orchestration.as_ref().and_then(|o| o.interval_ms),
            auto_orchestrate: orchestration.as_ref().and_then(|o| o.auto_start),
            cli_command: agent.as_ref().and_then(|a| a.command.clone()),
            inject_timeout_ms: agent.as_ref().and_then(|a| a.inject_timeout_ms),
            stop_grace_ms: agent.as_ref().and_then(|a| a.stop_grace_ms),
            stop_timeout_ms: agent.as_ref().and_then(|a| a.stop_timeout_ms),
            roster: self.roster,
        }
    }
}
