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
    pub sheets: Sheets,
    pub transport: Transport,
    #[serde(default)]
    pub session: Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheets {
    #[serde(rename = "type")]
    pub kind: String,
    pub api_base: Option<String>,
    pub spreadsheet_id: Option<String>,
    pub source_spreadsheet_id: Option<String>,
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub names: SheetNames,
}

/// Sheet (tab) names inside the spreadsheets. The defaults match the
/// layout the deployed spreadsheets already use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetNames {
    #[serde(default = "default_catalog_sheet")]
    pub catalog: String,
    #[serde(default = "default_orders_sheet")]
    pub orders: String,
    #[serde(default = "default_venues_sheet")]
    pub venues: String,
    #[serde(default = "default_bindings_sheet")]
    pub bindings: String,
    #[serde(default = "default_employees_sheet")]
    pub employees: String,
    #[serde(default = "default_venue_source_sheet")]
    pub venue_source: String,
}

impl Default for SheetNames {
    fn default() -> Self {
        Self {
            catalog: default_catalog_sheet(),
            orders: default_orders_sheet(),
            venues: default_venues_sheet(),
            bindings: default_bindings_sheet(),
            employees: default_employees_sheet(),
            venue_source: default_venue_source_sheet(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub kind: String,
    pub api_base: Option<String>,
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_catalog_sheet() -> String {
    "SKU".to_string()
}

fn default_orders_sheet() -> String {
    "Requests".to_string()
}

fn default_venues_sheet() -> String {
    "Venues".to_string()
}

fn default_bindings_sheet() -> String {
    "Chats".to_string()
}

fn default_employees_sheet() -> String {
    "Employees".to_string()
}

fn default_venue_source_sheet() -> String {
    "Form Responses".to_string()
}

fn default_idle_timeout_ms() -> u64 {
    30 * 60 * 1000
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

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    match cfg.sheets.kind.as_str() {
        "memory" => {
            if cfg.sheets.bearer_token.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "sheets.bearer_token is not supported when sheets.type=memory".to_string(),
                ));
            }
        }
        "http" => {
            for (field, value) in [
                ("sheets.api_base", &cfg.sheets.api_base),
                ("sheets.spreadsheet_id", &cfg.sheets.spreadsheet_id),
                ("sheets.bearer_token", &cfg.sheets.bearer_token),
            ] {
                if value.as_ref().map(|v| v.trim().is_empty()).unwrap_or(true) {
                    return Err(ConfigError::UnsupportedConfig(format!(
                        "{field} is required when sheets.type=http"
                    )));
                }
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "sheets.type={other} is not implemented; supported: memory, http"
            )));
        }
    }

    match cfg.transport.kind.as_str() {
        "memory" => {}
        "http" => {
            for (field, value) in [
                ("transport.api_base", &cfg.transport.api_base),
                ("transport.bot_token", &cfg.transport.bot_token),
            ] {
                if value.as_ref().map(|v| v.trim().is_empty()).unwrap_or(true) {
                    return Err(ConfigError::UnsupportedConfig(format!(
                        "{field} is required when transport.type=http"
                    )));
                }
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "transport.type={other} is not implemented; supported: memory, http"
            )));
        }
    }

    if cfg.session.idle_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "session.idle_timeout_ms must be >= 1".to_string(),
        ));
    }
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
        let path = std::env::temp_dir().join(format!("courier-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

sheets:
  type: "memory"

transport:
  type: "memory"

session:
  idle_timeout_ms: 60000
"#
        .to_string()
    }

    #[test]
    fn accepts_memory_backends_and_applies_sheet_name_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("memory config should be accepted");
        assert_eq!(cfg.sheets.kind, "memory");
        assert_eq!(cfg.sheets.names.catalog, "SKU");
        assert_eq!(cfg.sheets.names.orders, "Requests");
        assert_eq!(cfg.session.idle_timeout_ms, 60_000);
    }

    #[test]
    fn session_section_is_optional() {
        let yaml = base_yaml().replace("session:\n  idle_timeout_ms: 60000", "");
        let path = write_temp_config(&yaml);
        let cfg = load_and_validate(&path).expect("session defaults should apply");
        assert_eq!(cfg.session.idle_timeout_ms, 30 * 60 * 1000);
    }

    #[test]
    fn accepts_http_sheets_with_connection_fields() {
        let yaml = base_yaml().replace(
            "sheets:\n  type: \"memory\"",
            "sheets:\n  type: \"http\"\n  api_base: \"https://sheets.example/v4/spreadsheets\"\n  spreadsheet_id: \"s1\"\n  bearer_token: \"t\"",
        );
        let path = write_temp_config(&yaml);
        let cfg = load_and_validate(&path).expect("http sheets config should be accepted");
        assert_eq!(cfg.sheets.kind, "http");
        assert_eq!(cfg.sheets.spreadsheet_id.as_deref(), Some("s1"));
    }

    #[test]
    fn rejects_http_sheets_without_spreadsheet_id() {
        let yaml = base_yaml().replace(
            "sheets:\n  type: \"memory\"",
            "sheets:\n  type: \"http\"\n  api_base: \"https://sheets.example\"\n  bearer_token: \"t\"",
        );
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_bearer_token_under_memory_sheets() {
        let yaml = base_yaml().replace(
            "sheets:\n  type: \"memory\"",
            "sheets:\n  type: \"memory\"\n  bearer_token: \"t\"",
        );
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_transport_kind() {
        let yaml = base_yaml().replace("transport:\n  type: \"memory\"", "transport:\n  type: \"smtp\"");
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_idle_timeout() {
        let yaml = base_yaml().replace("idle_timeout_ms: 60000", "idle_timeout_ms: 0");
        let path = write_temp_config(&yaml);
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }
}
