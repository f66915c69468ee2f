use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path};

use crate::trace::{LogLevel, TraceCategory};
use crate::{ScriptError, ScriptResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Initial root of the read cursor for every process context.
    #[serde(default = "default_root")]
    pub read_root: String,

    #[serde(default = "default_root")]
    pub write_root: String,

    #[serde(default)]
    pub warning_as_failure: bool,

    #[serde(default)]
    pub trace: TraceConfig,

    /// Every log agent variant known to the host.
    #[serde(default)]
    pub log_agents: Vec<LogAgentConfig>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            read_root: default_root(),
            write_root: default_root(),
            warning_as_failure: false,
            trace: TraceConfig::default(),
            log_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Highest level still emitted.
    #[serde(default = "default_threshold")]
    pub threshold: LogLevel,

    /// Overrides of the built-in per-category defaults.
    #[serde(default)]
    pub levels: HashMap<TraceCategory, LogLevel>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            levels: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogAgentConfig {
    pub name: String,

    #[serde(rename = "type", default)]
    pub variant_type: String,

    #[serde(default)]
    pub group: String,
}

fn default_root() -> String {
    "/".to_string()
}

fn default_threshold() -> LogLevel {
    LogLevel::NORMAL
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> ScriptResult<T> {
    let file = File::open(path)
        .map_err(|e| ScriptError::Config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| ScriptError::Config(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> ScriptResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| ScriptError::Config(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

impl EnvironmentConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ScriptResult<Self> {
        from_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: EnvironmentConfig = from_str("{}").unwrap();
        assert_eq!(config.read_root, "/");
        assert_eq!(config.write_root, "/");
        assert!(!config.warning_as_failure);
        assert_eq!(config.trace.threshold, LogLevel::NORMAL);
        assert!(config.log_agents.is_empty());
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "read_root": "/Request",
            "warning_as_failure": true,
            "trace": { "threshold": 10, "levels": { "user_info": 5 } },
            "log_agents": [
                { "name": "audit", "type": "db", "group": "compliance" },
                { "name": "file" }
            ]
        }"#;
        let config: EnvironmentConfig = from_str(json).unwrap();
        assert_eq!(config.read_root, "/Request");
        assert_eq!(config.write_root, "/");
        assert_eq!(config.trace.threshold, LogLevel::MAX);
        assert_eq!(
            config.trace.levels.get(&TraceCategory::UserInfo),
            Some(&LogLevel::NORMAL)
        );
        assert_eq!(config.log_agents[1].variant_type, "");
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let result: ScriptResult<EnvironmentConfig> = from_str("{ not json");
        assert!(matches!(result, Err(ScriptError::Config(_))));
        assert!(EnvironmentConfig::from_file("/nonexistent/esdl.json").is_err());
    }
}
