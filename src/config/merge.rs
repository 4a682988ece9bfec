use super::schema::{AppConfig, PartialConfig};
use crate::model::default_roster;
use std::path::PathBuf;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For roster: REPLACE semantics (if self has Some, use it entirely).
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            agency_dir: self.agency_dir.or(fallback.agency_dir),
            data_dir: self.data_dir.or(fallback.data_dir),
            projects_dir: self.projects_dir.or(fallback.projects_dir),
            host: self.host.or(fallback.host),
            port: self.port.or(fallback.port),
            orchestration_interval_ms: self
                .orchestration_interval_ms
                .or(fallback.orchestration_interval_ms),
            auto_orchestrate: self.auto_orchestrate.or(fallback.auto_orchestrate),
            cli_command: self.cli_command.or(fallback.cli_command),
            inject_timeout_ms: self.inject_timeout_ms.or(fallback.inject_timeout_ms),
            stop_grace_ms: self.stop_grace_ms.or(fallback.stop_grace_ms),
            stop_timeout_ms: self.stop_timeout_ms.or(fallback.stop_timeout_ms),
            roster: self.roster.or(fallback.roster),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let agency_dir = self.agency_dir.unwrap_or_else(|| PathBuf::from("./agency"));
        let data_dir = self.data_dir.unwrap_or_else(|| agency_dir.join("data"));
        let projects_dir = self
            .projects_dir
            .unwrap_or_else(|| agency_dir.join("projects"));

        AppConfig {
            agency_dir,
            data_dir,
            projects_dir,
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(3000),
            orchestration_interval_ms: self.orchestration_interval_ms.unwrap_or(10_000),
            auto_orchestrate: self.auto_orchestrate.unwrap_or(false),
            cli_command: self.cli_command.unwrap_or_else(|| "claude".to_string()),
            inject_timeout_ms: self.inject_timeout_ms.unwrap_or(5_000),
            stop_grace_ms: self.stop_grace_ms.unwrap_or(5_000),
            stop_timeout_ms: self.stop_timeout_ms.unwrap_or(10_000),
            roster: self.roster.unwrap_or_else(default_roster),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_layer_wins() {
        let cli = PartialConfig {
            port: Some(4000),
            ..Default::default()
        };
        let file = PartialConfig {
            port: Some(5000),
            host: Some("0.0.0.0".into()),
            ..Default::default()
        };
        let config = cli.with_fallback(file).finalize();
        assert_eq!(config.port, 4000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.api_base(), "http://localhost:4000/api");
    }

    #[test]
    fn defaults_hang_off_the_agency_dir() {
        let config = PartialConfig {
            agency_dir: Some(PathBuf::from("/srv/agency")),
            ..Default::default()
        }
        .finalize();
        assert_eq!(config.data_dir, PathBuf::from("/srv/agency/data"));
        assert_eq!(config.projects_dir, PathBuf::from("/srv/agency/projects"));
        assert_eq!(config.database_path(), PathBuf::from("/srv/agency/data/agency.db"));
        assert_eq!(config.orchestration_interval_ms, 10_000);
        assert_eq!(config.cli_command, "claude");
        assert_eq!(config.roster.len(), 8);
    }

    #[test]
    fn roster_is_replaced_not_merged() {
        let workspace = PartialConfig {
            roster: Some(vec![crate::model::RosterEntry::new(
                "solo",
                crate::model::AgentType::Developer,
            )]),
            ..Default::default()
        };
        let config = PartialConfig::default().with_fallback(workspace).finalize();
        assert_eq!(config.roster.len(), 1);
        assert_eq!(config.roster[0].name, "solo");
    }
}
