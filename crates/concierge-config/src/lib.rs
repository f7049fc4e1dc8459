use chrono::NaiveTime;
use chrono_tz::Tz;
use concierge_contracts::SystemConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub audit: Audit,
    pub assistant: Assistant,
    pub calendar: Calendar,
    pub messaging: Messaging,
    pub llm: Llm,
    pub scheduler: Scheduler,
    #[serde(default)]
    pub proactive: Option<Proactive>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub user_chat_id: Option<String>,
    pub public_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calendar {
    pub mode: String,
    #[serde(default = "default_calendar_api_base")]
    pub api_base: String,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    #[serde(default)]
    pub token_path: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_calendar_retries")]
    pub retries: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Messaging {
    pub mode: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_messaging_session")]
    pub session: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_messaging_retries")]
    pub retries: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Llm {
    pub mode: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_llm_retries")]
    pub retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheduler {
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_digest_hour")]
    pub digest_hour: u32,
    #[serde(default)]
    pub digest_minute: u32,
}

/// Optional overrides applied over the hardcoded `SystemConfig` defaults when the
/// singleton is first created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Proactive {
    #[serde(default)]
    pub quiet_hours: Option<String>,
    #[serde(default)]
    pub strong_window: Option<String>,
    #[serde(default)]
    pub daily_limit: Option<u32>,
    #[serde(default)]
    pub cooldown_minutes: Option<i64>,
    #[serde(default)]
    pub urgent_threshold: Option<i64>,
    #[serde(default)]
    pub maybe_threshold: Option<i64>,
    #[serde(default)]
    pub llm_model: Option<String>,
}

fn default_timezone() -> String {
    "America/Argentina/Buenos_Aires".to_string()
}

fn default_calendar_api_base() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_messaging_session() -> String {
    "default".to_string()
}

fn default_calendar_retries() -> usize {
    2
}

fn default_messaging_retries() -> usize {
    2
}

fn default_retry_backoff_ms() -> u64 {
    300
}

fn default_llm_timeout_ms() -> u64 {
    10_000
}

fn default_llm_retries() -> usize {
    1
}

fn default_tick_interval_secs() -> u64 {
    120
}

fn default_digest_hour() -> u32 {
    21
}

impl Config {
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.assistant.timezone.parse::<Tz>().map_err(|e| {
            ConfigError::UnsupportedConfig(format!(
                "assistant.timezone={} is not a known zone: {e}",
                self.assistant.timezone
            ))
        })
    }

    pub fn system_defaults(&self) -> Result<SystemConfig, ConfigError> {
        let mut sys = SystemConfig::default();
        let Some(p) = &self.proactive else {
            return Ok(sys);
        };
        if let Some(window) = &p.quiet_hours {
            (sys.quiet_hours_start, sys.quiet_hours_end) =
                parse_window("proactive.quiet_hours", window)?;
        }
        if let Some(window) = &p.strong_window {
            (sys.strong_window_start, sys.strong_window_end) =
                parse_window("proactive.strong_window", window)?;
        }
        if let Some(v) = p.daily_limit {
            sys.daily_limit = v;
        }
        if let Some(v) = p.cooldown_minutes {
            sys.cooldown_minutes = v;
        }
        if let Some(v) = p.urgent_threshold {
            sys.urgent_threshold = v;
        }
        if let Some(v) = p.maybe_threshold {
            sys.maybe_threshold = v;
        }
        if let Some(v) = &p.llm_model {
            sys.llm.model = v.clone();
        }
        Ok(sys)
    }
}

/// Parses `HH:MM-HH:MM`.
pub fn parse_window(field: &str, value: &str) -> Result<(NaiveTime, NaiveTime), ConfigError> {
    let invalid = || {
        ConfigError::UnsupportedConfig(format!("{field}={value} must look like HH:MM-HH:MM"))
    };
    let (start, end) = value.split_once('-').ok_or_else(invalid)?;
    let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
    let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
    Ok((start, end))
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.calendar.mode != "disabled" && cfg.calendar.mode != "google" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "calendar.mode={} is not implemented; supported: disabled, google",
            cfg.calendar.mode
        )));
    }
    if cfg.messaging.mode != "log" && cfg.messaging.mode != "waha" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "messaging.mode={} is not implemented; supported: log, waha",
            cfg.messaging.mode
        )));
    }
    if cfg.messaging.mode == "waha"
        && cfg
            .messaging
            .base_url
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "messaging.base_url is required when messaging.mode=waha".to_string(),
        ));
    }
    if cfg.llm.mode != "disabled" && cfg.llm.mode != "ollama" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "llm.mode={} is not implemented; supported: disabled, ollama",
            cfg.llm.mode
        )));
    }
    if cfg.llm.mode == "ollama" && cfg.llm.base_url.is_none() {
        return Err(ConfigError::UnsupportedConfig(
            "llm.base_url is required when llm.mode=ollama".to_string(),
        ));
    }
    if cfg.scheduler.tick_interval_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "scheduler.tick_interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.scheduler.digest_hour > 23 || cfg.scheduler.digest_minute > 59 {
        return Err(ConfigError::UnsupportedConfig(
            "scheduler.digest_hour/digest_minute out of range".to_string(),
        ));
    }
    cfg.timezone()?;
    cfg.system_defaults()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("concierge-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

audit:
  jsonl_path: "./concierge-audit.jsonl"

assistant:
  user_chat_id: "5491100000000@c.us"
  public_base_url: "http://localhost:8000"

calendar:
  mode: "disabled"

messaging:
  mode: "log"

llm:
  mode: "disabled"

scheduler:
  enabled: false
"#
        .to_string()
    }

    #[test]
    fn loads_base_config_with_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should load");
        assert_eq!(cfg.assistant.timezone, "America/Argentina/Buenos_Aires");
        assert_eq!(cfg.messaging.retries, 2);
        assert_eq!(cfg.calendar.retries, 2);
        assert_eq!(cfg.calendar.retry_backoff_ms, 300);
        assert_eq!(cfg.scheduler.tick_interval_secs, 120);
        assert_eq!(cfg.scheduler.digest_hour, 21);
        assert_eq!(cfg.llm.timeout_ms, 10_000);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaLoad(_)
                | ConfigError::SchemaValidation(_)
                | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_waha_without_base_url() {
        let path = write_temp_config(&base_yaml().replace("mode: \"log\"", "mode: \"waha\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_excessive_calendar_retries() {
        let path = write_temp_config(&base_yaml().replace(
            "mode: \"disabled\"\n\nmessaging",
            "mode: \"disabled\"\n  retries: 9\n\nmessaging",
        ));
        let err = load_and_validate(&path).expect_err("expected schema rejection");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn rejects_unknown_timezone() {
        let path = write_temp_config(&base_yaml().replace(
            "user_chat_id:",
            "timezone: \"Mars/Olympus\"\n  user_chat_id:",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported timezone");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn proactive_overrides_apply_over_defaults() {
        let yaml = format!(
            "{}\nproactive:\n  quiet_hours: \"23:00-08:00\"\n  daily_limit: 2\n",
            base_yaml()
        );
        let path = write_temp_config(&yaml);
        let cfg = load_and_validate(&path).expect("overrides should load");
        let sys = cfg.system_defaults().unwrap();
        assert_eq!(sys.quiet_hours_start, NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert_eq!(sys.quiet_hours_end, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(sys.daily_limit, 2);
        assert_eq!(sys.cooldown_minutes, 240);
    }

    #[test]
    fn malformed_window_is_rejected() {
        assert!(parse_window("proactive.quiet_hours", "9-10").is_err());
        assert!(parse_window("proactive.quiet_hours", "09:00").is_err());
    }
}
