// Agent configuration.
//
// Sources, later wins: defaults, an optional JSON file, `CI_AGENT_*`
// environment variables, then command-line flags (applied by the binary).

use crate::errors::AgentError;
use agent_sdk::StringUtil;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of the environment variables that override settings.
pub const ENV_PREFIX: &str = "CI_AGENT_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSettings {
    /// Base URL of the control-plane service.
    pub api_endpoint: String,
    pub task_id: String,
    /// Token the agent authenticates with.
    pub client_token: String,
    /// Token the control plane proves itself with; replaced by the plan's.
    pub server_token: String,
    /// First command of the sub-range to run (inclusive).
    pub command_from: Option<String>,
    /// Command the sub-range stops at (exclusive).
    pub command_to: Option<String>,
    pub pre_created_working_dir: Option<PathBuf>,
    pub log_timestamps: bool,
    /// Kill leftover process-group members after a script exits.
    pub kill_orphans: bool,
    pub temp_directory: Option<PathBuf>,
    pub shell_override: Option<String>,
    pub heartbeat_interval_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_endpoint: "https://grpc.ci.example.com".to_string(),
            task_id: String::new(),
            client_token: String::new(),
            server_token: String::new(),
            command_from: None,
            command_to: None,
            pre_created_working_dir: None,
            log_timestamps: false,
            kill_orphans: true,
            temp_directory: None,
            shell_override: None,
            heartbeat_interval_secs: 60,
        }
    }
}

impl AgentSettings {
    /// Defaults, then `config_file` if given, then the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, AgentError> {
        let mut settings = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env_overrides(std::env::vars());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| AgentError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Apply `CI_AGENT_*` variables from `vars`. Unknown names are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "API_ENDPOINT" => self.api_endpoint = value,
                "TASK_ID" => self.task_id = value,
                "CLIENT_TOKEN" => self.client_token = value,
                "SERVER_TOKEN" => self.server_token = value,
                "COMMAND_FROM" => self.command_from = non_empty(value),
                "COMMAND_TO" => self.command_to = non_empty(value),
                "PRE_CREATED_WORKING_DIR" => {
                    self.pre_created_working_dir = non_empty(value).map(PathBuf::from)
                }
                "TEMP_DIRECTORY" => self.temp_directory = non_empty(value).map(PathBuf::from),
                "SHELL" => self.shell_override = non_empty(value),
                "LOG_TIMESTAMPS" => {
                    if let Some(flag) = StringUtil::convert_to_bool(&value) {
                        self.log_timestamps = flag;
                    }
                }
                "KILL_ORPHANS" => {
                    if let Some(flag) = StringUtil::convert_to_bool(&value) {
                        self.kill_orphans = flag;
                    }
                }
                "HEARTBEAT_INTERVAL_SECS" => match value.parse() {
                    Ok(secs) => self.heartbeat_interval_secs = secs,
                    Err(_) => tracing::warn!("Ignoring invalid {}{}: '{}'", ENV_PREFIX, key, value),
                },
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.api_endpoint.trim().is_empty() {
            return Err(AgentError::Config("api endpoint must not be empty".into()));
        }
        if self.task_id.trim().is_empty() {
            return Err(AgentError::Config("task id must not be empty".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(AgentError::Config("heartbeat interval must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Directory for script, spool and env files.
    pub fn temp_directory(&self) -> PathBuf {
        self.temp_directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("ci-agent"))
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = AgentSettings::default();
        assert!(settings.kill_orphans);
        assert!(!settings.log_timestamps);
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = AgentSettings::default();
        settings.apply_env_overrides(vars(&[
            ("CI_AGENT_TASK_ID", "123"),
            ("CI_AGENT_COMMAND_FROM", "build"),
            ("CI_AGENT_COMMAND_TO", ""),
            ("CI_AGENT_KILL_ORPHANS", "false"),
            ("CI_AGENT_LOG_TIMESTAMPS", "yes"),
            ("CI_AGENT_HEARTBEAT_INTERVAL_SECS", "oops"),
            ("UNRELATED", "x"),
        ]));
        assert_eq!(settings.task_id, "123");
        assert_eq!(settings.command_from.as_deref(), Some("build"));
        assert_eq!(settings.command_to, None);
        assert!(!settings.kill_orphans);
        assert!(settings.log_timestamps);
        assert_eq!(settings.heartbeat_interval_secs, 60);
    }

    #[test]
    fn test_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"apiEndpoint": "https://ci.internal", "taskId": "1"}}"#).unwrap();
        let mut settings = AgentSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.api_endpoint, "https://ci.internal");
        assert!(settings.kill_orphans);
        settings.apply_env_overrides(vars(&[("CI_AGENT_TASK_ID", "2")]));
        assert_eq!(settings.task_id, "2");
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            AgentSettings::from_file(file.path()),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut settings = AgentSettings::default();
        assert!(settings.validate().is_err());
        settings.task_id = "7".into();
        assert!(settings.validate().is_ok());
        settings.api_endpoint = " ".into();
        assert!(settings.validate().is_err());
    }
}
