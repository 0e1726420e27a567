//! TOML config file loading, environment overrides, and validation.
//!
//! Every key has a default, so the file is optional; a deployment on a PaaS
//! usually sets only the environment variables.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Empty disables the broker connection entirely.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub data_topic: String,
    pub command_topic: String,
    pub tls: bool,
    pub keep_alive_secs: u64,
    pub publish_timeout_secs: u64,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            username: String::new(),
            password: String::new(),
            client_id: "fensterkraftwerk-backend".into(),
            data_topic: "fensterkraftwerk/data".into(),
            command_topic: "fensterkraftwerk/command".into(),
            tls: true,
            keep_alive_secs: 60,
            publish_timeout_secs: 5,
            reconnect_min_secs: 1,
            reconnect_max_secs: 30,
        }
    }
}

impl MqttConfig {
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Username/password pair, only when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() || self.password.is_empty() {
            None
        } else {
            Some((&self.username, &self.password))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the PostgREST endpoint, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub key: String,
    pub table: String,
    pub history_limit: usize,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key: String::new(),
            table: "power_logs".into(),
            history_limit: 500,
            request_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.key.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Overlay environment variables on top of the file values.
    ///
    /// `lookup` is `std::env::var` in production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(v) = lookup(key) {
                *target = v;
            }
        };

        set(&mut self.mqtt.host, "MQTT_HOST");
        set(&mut self.mqtt.username, "MQTT_USERNAME");
        set(&mut self.mqtt.password, "MQTT_PASSWORD");
        set(&mut self.mqtt.client_id, "MQTT_CLIENT_ID");
        set(&mut self.mqtt.data_topic, "MQTT_TOPIC_DATA");
        set(&mut self.mqtt.command_topic, "MQTT_TOPIC_COMMAND");
        set(&mut self.store.url, "SUPABASE_URL");
        set(&mut self.store.key, "SUPABASE_KEY");
        set(&mut self.api.host, "API_HOST");

        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT must be a port number, got {v:?}"))?;
        }
        if let Some(v) = lookup("MQTT_TLS") {
            self.mqtt.tls = parse_flag(&v)
                .with_context(|| format!("MQTT_TLS must be true or false, got {v:?}"))?;
        }
        if let Some(v) = lookup("API_PORT") {
            self.api.port = v
                .trim()
                .parse()
                .with_context(|| format!("API_PORT must be a port number, got {v:?}"))?;
        }
        if let Some(v) = lookup("HISTORY_LIMIT") {
            self.store.history_limit = v
                .trim()
                .parse()
                .with_context(|| format!("HISTORY_LIMIT must be a positive integer, got {v:?}"))?;
        }

        Ok(())
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_store(&mut errors);

        if self.api.port == 0 {
            errors.push("api: port must not be 0".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.port == 0 {
            errors.push("mqtt: port must not be 0".into());
        }
        if m.client_id.trim().is_empty() || m.client_id.starts_with(char::is_whitespace) {
            errors.push(format!("mqtt: invalid client_id {:?}", m.client_id));
        }

        if m.data_topic.trim().is_empty() {
            errors.push("mqtt: data_topic is empty".into());
        }
        if m.command_topic.trim().is_empty() {
            errors.push("mqtt: command_topic is empty".into());
        } else if m.command_topic.contains(['+', '#']) {
            errors.push(format!(
                "mqtt: command_topic {:?} must not contain wildcards",
                m.command_topic
            ));
        }

        if m.username.is_empty() != m.password.is_empty() {
            errors.push("mqtt: username and password must be set together".into());
        }

        // The keep-alive travels as a u16 in CONNECT.
        for (name, v, max) in [
            ("keep_alive_secs", m.keep_alive_secs, u64::from(u16::MAX)),
            ("publish_timeout_secs", m.publish_timeout_secs, 300),
            ("reconnect_min_secs", m.reconnect_min_secs, 3600),
            ("reconnect_max_secs", m.reconnect_max_secs, 3600),
        ] {
            if v == 0 {
                errors.push(format!("mqtt: {name} must be positive"));
            } else if v > max {
                errors.push(format!("mqtt: {name} ({v}) exceeds {max}"));
            }
        }
        if m.reconnect_min_secs > m.reconnect_max_secs {
            errors.push(format!(
                "mqtt: reconnect_min_secs ({}) exceeds reconnect_max_secs ({})",
                m.reconnect_min_secs, m.reconnect_max_secs
            ));
        }
    }

    fn validate_store(&self, errors: &mut Vec<String>) {
        let s = &self.store;

        if s.url.is_empty() != s.key.is_empty() {
            errors.push("store: url and key must be set together (or both left empty)".into());
        }
        if !s.url.is_empty() && !(s.url.starts_with("http://") || s.url.starts_with("https://")) {
            errors.push(format!("store: url {:?} must start with http:// or https://", s.url));
        }
        if s.table.trim().is_empty() {
            errors.push("store: table is empty".into());
        }
        if s.history_limit == 0 {
            errors.push("store: history_limit must be positive".into());
        }
        if s.request_timeout_secs == 0 {
            errors.push("store: request_timeout_secs must be positive".into());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read the TOML file at `path` if it exists, overlay the process
/// environment, and validate the result.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults and environment");
        Config::default()
    };

    config.apply_env(|k| std::env::var(k).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        broker = config.mqtt.is_enabled(),
        store = config.store.is_configured(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[mqtt]
host = "abc123.s1.eu.hivemq.cloud"
port = 8883
username = "bridge"
password = "secret"
data_topic = "balkon/+/data"
command_topic = "balkon/command"
publish_timeout_secs = 3

[store]
url = "https://xyz.supabase.co"
key = "anon"
history_limit = 1000

[api]
port = 9000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mqtt.host, "abc123.s1.eu.hivemq.cloud");
        assert_eq!(config.mqtt.data_topic, "balkon/+/data");
        assert_eq!(config.mqtt.publish_timeout_secs, 3);
        assert_eq!(config.mqtt.reconnect_max_secs, 30);
        assert_eq!(config.store.history_limit, 1000);
        assert_eq!(config.store.table, "power_logs");
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "0.0.0.0");
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(!config.mqtt.is_enabled());
        assert!(!config.store.is_configured());
        assert_eq!(config.mqtt.port, 8883);
        assert!(config.mqtt.tls);
        assert_eq!(config.mqtt.publish_timeout_secs, 5);
        assert_eq!(config.mqtt.reconnect_min_secs, 1);
        assert_eq!(config.store.history_limit, 500);
        assert_eq!(config.api.port, 8000);
        config.validate().unwrap();
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("MQTT_HOST", "broker.local"),
                ("MQTT_PORT", "1883"),
                ("MQTT_TLS", "false"),
                ("MQTT_USERNAME", "u"),
                ("MQTT_PASSWORD", "p"),
                ("SUPABASE_URL", "https://xyz.supabase.co"),
                ("SUPABASE_KEY", "anon"),
                ("API_PORT", "8081"),
                ("HISTORY_LIMIT", "42"),
            ]))
            .unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.tls);
        assert_eq!(config.mqtt.credentials(), Some(("u", "p")));
        assert!(config.store.is_configured());
        assert_eq!(config.api.port, 8081);
        assert_eq!(config.store.history_limit, 42);
        config.validate().unwrap();
    }

    #[test]
    fn env_absent_keeps_values() {
        let mut config = Config::default();
        config.mqtt.host = "from-file".into();
        config.apply_env(env(&[])).unwrap();
        assert_eq!(config.mqtt.host, "from-file");
    }

    #[test]
    fn env_bad_port_is_an_error() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("MQTT_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("MQTT_PORT"));
    }

    #[test]
    fn env_tls_accepts_common_spellings() {
        for (raw, want) in [("TRUE", true), ("1", true), (" yes ", true), ("off", false), ("0", false)] {
            let mut config = Config::default();
            config.mqtt.tls = !want;
            config.apply_env(env(&[("MQTT_TLS", raw)])).unwrap();
            assert_eq!(config.mqtt.tls, want, "{raw:?}");
        }
    }

    #[test]
    fn env_bad_tls_is_an_error() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("MQTT_TLS", "ture")])).unwrap_err();
        assert!(err.to_string().contains("MQTT_TLS"));
        assert!(config.mqtt.tls);
    }

    #[test]
    fn credentials_require_both_parts() {
        let mut m = MqttConfig::default();
        assert_eq!(m.credentials(), None);
        m.username = "u".into();
        assert_eq!(m.credentials(), None);
        m.password = "p".into();
        assert_eq!(m.credentials(), Some(("u", "p")));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn zero_ports_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.port = 0;
        assert_validation_err(&cfg, "mqtt: port");
        let mut cfg = Config::default();
        cfg.api.port = 0;
        assert_validation_err(&cfg, "api: port");
    }

    #[test]
    fn empty_topics_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.data_topic = " ".into();
        assert_validation_err(&cfg, "data_topic is empty");
    }

    #[test]
    fn wildcard_command_topic_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.command_topic = "balkon/+/command".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn wildcard_data_topic_accepted() {
        let mut cfg = Config::default();
        cfg.mqtt.data_topic = "balkon/+/data".into();
        cfg.validate().unwrap();
    }

    #[test]
    fn blank_client_id_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.client_id = " bridge".into();
        assert_validation_err(&cfg, "invalid client_id");
    }

    #[test]
    fn username_without_password_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.username = "u".into();
        assert_validation_err(&cfg, "username and password");
    }

    #[test]
    fn zero_timeouts_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.publish_timeout_secs = 0;
        assert_validation_err(&cfg, "publish_timeout_secs must be positive");
    }

    #[test]
    fn oversized_timeouts_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.publish_timeout_secs = u64::MAX;
        assert_validation_err(&cfg, "publish_timeout_secs");
        let mut cfg = Config::default();
        cfg.mqtt.keep_alive_secs = 70_000;
        assert_validation_err(&cfg, "keep_alive_secs (70000) exceeds 65535");
        let mut cfg = Config::default();
        cfg.mqtt.reconnect_max_secs = u64::MAX;
        assert_validation_err(&cfg, "reconnect_max_secs");
    }

    #[test]
    fn backoff_bounds_must_be_ordered() {
        let mut cfg = Config::default();
        cfg.mqtt.reconnect_min_secs = 60;
        assert_validation_err(&cfg, "exceeds reconnect_max_secs");
    }

    #[test]
    fn store_half_configured_rejected() {
        let mut cfg = Config::default();
        cfg.store.key = "anon".into();
        assert_validation_err(&cfg, "url and key must be set together");
    }

    #[test]
    fn store_url_scheme_checked() {
        let mut cfg = Config::default();
        cfg.store.url = "xyz.supabase.co".into();
        cfg.store.key = "anon".into();
        assert_validation_err(&cfg, "must start with http");
    }

    #[test]
    fn zero_history_limit_rejected() {
        let mut cfg = Config::default();
        cfg.store.history_limit = 0;
        assert_validation_err(&cfg, "history_limit must be positive");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.mqtt.port = 0;
        cfg.mqtt.command_topic = "#".into();
        cfg.store.history_limit = 0;

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }
}
