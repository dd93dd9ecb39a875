//! Configuration management
//!
//! Handles:
//! - Detection, session, command and notification tuning
//! - Notification channel destinations
//! - SMS gateway credentials (env or OS keyring)
//! - Validation of every option before the agent may enter `Monitoring`

use crate::error::{ConfigError, ConfigIssue};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentInfo,
    pub detection: DetectionConfig,
    pub session: SessionConfig,
    pub command: CommandConfig,
    pub notify: NotifyConfig,
    pub audit: AuditConfig,
    pub platform: PlatformConfig,
    pub source: SourceConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentInfo {
    pub agent_id: String,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    /// Largest foreground region (pixels) above which a frame is an intrusion
    #[serde(alias = "detection_area_threshold")]
    pub area_threshold: u32,
    /// Frames absorbed into the background model before any detection
    #[serde(alias = "warmup_frame_count")]
    pub warmup_frames: u32,
    /// Squared Mahalanobis distance marking a pixel as foreground
    pub variance_threshold: f32,
    /// Background adaptation rate once warm-up is over
    pub learning_rate: f32,
    pub initial_variance: f32,
    pub min_variance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(alias = "cooldown_seconds")]
    pub cooldown_secs: u64,
    pub max_consecutive_frame_failures: u32,
    /// Acquisition pace; 0 runs cycles back to back
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    #[serde(alias = "max_command_retries")]
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    /// Upper bound on the whole return-to-base exchange
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    #[serde(alias = "max_channel_retries")]
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub send_timeout_ms: u64,
    #[serde(alias = "channel_destinations")]
    pub channels: Vec<ChannelConfig>,
    pub sms: SmsConfig,
    pub email: EmailConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ChannelKind,
    pub destination: String,
}

impl ChannelConfig {
    pub fn new(kind: ChannelKind, destination: impl Into<String>) -> Self {
        Self { name: None, kind, destination: destination.into() }
    }

    /// Stable channel identifier used in delivery results and the audit log
    pub fn channel_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.kind, self.destination))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
    Sms,
    Email,
    Mqtt,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelKind::Webhook => "webhook",
            ChannelKind::Sms => "sms",
            ChannelKind::Email => "email",
            ChannelKind::Mqtt => "mqtt",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmsConfig {
    pub api_base: String,
    pub account_sid: Option<String>,
    pub from_number: Option<String>,
    #[serde(skip)] // Never serialize tokens
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmailConfig {
    pub relay_url: Option<String>,
    pub from_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(alias = "audit_log_path")]
    pub path: PathBuf,
    /// Rebuild the delivery ledger from the log so terminal outcomes survive restarts
    pub replay_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Directory of binary PGM frames, read in file-name order
    pub frames_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind: String,
    pub recent_alerts: usize,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            agent_id: gethostname::gethostname().to_string_lossy().to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            area_threshold: 500,
            warmup_frames: 30,
            variance_threshold: 16.0,
            learning_rate: 0.002,
            initial_variance: 15.0,
            min_variance: 4.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            max_consecutive_frame_failures: 5,
            frame_rate: 15,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 250,
            attempt_timeout_ms: 2000,
            timeout_secs: 15,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 500,
            send_timeout_ms: 5000,
            channels: Vec::new(),
            sms: SmsConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.twilio.com/2010-04-01".to_string(),
            account_sid: None,
            from_number: None,
            auth_token: None,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vigil-audit.jsonl"),
            replay_on_start: true,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            keep_alive_secs: 30,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { frames_dir: PathBuf::from("frames") }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8090".to_string(),
            recent_alerts: 50,
        }
    }
}

/// Top-level option names and the section field they stand for
const FLAT_OPTIONS: &[(&str, &str, &str)] = &[
    ("detection_area_threshold", "detection", "area_threshold"),
    ("warmup_frame_count", "detection", "warmup_frames"),
    ("cooldown_seconds", "session", "cooldown_secs"),
    ("max_consecutive_frame_failures", "session", "max_consecutive_frame_failures"),
    ("max_command_retries", "command", "max_retries"),
    ("max_channel_retries", "notify", "max_retries"),
    ("channel_destinations", "notify", "channels"),
    ("audit_log_path", "audit", "path"),
];

fn lift_flat_options(table: &mut toml::Table) -> Result<(), ConfigError> {
    for (flat, section, field) in FLAT_OPTIONS {
        let Some(value) = table.remove(*flat) else {
            continue;
        };
        let entry = table
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let Some(section_table) = entry.as_table_mut() else {
            return Err(ConfigError::Unreadable(format!("[{}] must be a table", section)));
        };
        if section_table.contains_key(*field) {
            return Err(ConfigError::Unreadable(format!(
                "{} is set both at top level and as {}.{}",
                flat, section, field
            )));
        }
        section_table.insert(field.to_string(), value);
    }
    Ok(())
}

impl AgentConfig {
    /// Load config from `VIGIL_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .map_err(|e| ConfigError::Unreadable(format!("{}: {}", config_path.display(), e)))?;
            Self::from_toml(&content)?
        } else {
            // First start - defaults, validation will ask for channels
            Self::default()
        };

        config.notify.sms.auth_token = std::env::var("VIGIL_SMS_TOKEN")
            .ok()
            .or_else(|| Self::load_sms_token().ok());

        Ok(config)
    }

    /// Parse a config file. Unknown keys are rejected; the flat option names
    /// (`cooldown_seconds = 30` at top level) are moved into their section.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table =
            toml::from_str(content).map_err(|e| ConfigError::Unreadable(e.to_string()))?;
        lift_flat_options(&mut table)?;
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Unreadable(e.to_string()))
    }

    /// Get config file path, honouring `VIGIL_AGENT_CONFIG`
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var("VIGIL_AGENT_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| ConfigError::Unreadable("could not find config directory".into()))?;
        path.push("vigil-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Load SMS gateway token from secure OS keyring
    fn load_sms_token() -> Result<String, keyring::Error> {
        let entry = Entry::new("vigil-agent", "sms-auth-token")?;
        entry.get_password()
    }

    /// Save SMS gateway token to secure OS keyring
    pub fn save_sms_token(token: &str) -> Result<(), keyring::Error> {
        let entry = Entry::new("vigil-agent", "sms-auth-token")?;
        entry.set_password(token)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.session.cooldown_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command.timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.agent.shutdown_grace_secs)
    }

    /// Check every option, reporting all problems at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();
        let mut issue = |option: &str, message: &str| {
            issues.push(ConfigIssue { option: option.to_string(), message: message.to_string() });
        };

        if self.agent.agent_id.trim().is_empty() {
            issue("agent.agent_id", "must not be empty");
        }
        if self.detection.area_threshold == 0 {
            issue("detection.area_threshold", "must be greater than 0");
        }
        if !(self.detection.variance_threshold > 0.0) {
            issue("detection.variance_threshold", "must be greater than 0");
        }
        if !(self.detection.learning_rate > 0.0 && self.detection.learning_rate <= 1.0) {
            issue("detection.learning_rate", "must be in (0, 1]");
        }
        if !(self.detection.min_variance > 0.0) {
            issue("detection.min_variance", "must be greater than 0");
        }
        if self.detection.initial_variance < self.detection.min_variance {
            issue("detection.initial_variance", "must be at least min_variance");
        }
        if self.session.max_consecutive_frame_failures == 0 {
            issue("session.max_consecutive_frame_failures", "must be at least 1");
        }
        if self.command.attempt_timeout_ms == 0 {
            issue("command.attempt_timeout_ms", "must be greater than 0");
        }
        if self.command.timeout_secs == 0 {
            issue("command.timeout_secs", "must be greater than 0");
        }
        if self.audit.path.as_os_str().is_empty() {
            issue("audit.path", "must not be empty");
        }
        if self.notify.channels.is_empty() {
            issue("notify.channels", "at least one notification channel is required");
        }

        let mut seen = std::collections::HashSet::new();
        for (i, channel) in self.notify.channels.iter().enumerate() {
            let option = format!("notify.channels[{}]", i);
            if let Err(message) = self.check_channel(channel) {
                issue(&option, &message);
            }
            if !seen.insert(channel.channel_name()) {
                issue(&option, "duplicate channel name");
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    /// Channels that can be built even when the rest of the configuration is rejected
    pub fn usable_channels(&self) -> Vec<ChannelConfig> {
        self.notify
            .channels
            .iter()
            .filter(|c| self.check_channel(c).is_ok())
            .cloned()
            .collect()
    }

    fn check_channel(&self, channel: &ChannelConfig) -> Result<(), String> {
        let dest = channel.destination.trim();
        if dest.is_empty() {
            return Err("destination must not be empty".into());
        }
        match channel.kind {
            ChannelKind::Webhook => {
                if !(dest.starts_with("http://") || dest.starts_with("https://")) {
                    return Err(format!("webhook destination '{}' is not an http(s) URL", dest));
                }
            }
            ChannelKind::Sms => {
                let digits = dest.strip_prefix('+').unwrap_or("");
                if digits.len() < 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
                    return Err(format!("sms destination '{}' is not an E.164 number", dest));
                }
                if self.notify.sms.account_sid.is_none() || self.notify.sms.from_number.is_none() {
                    return Err("sms channel requires notify.sms.account_sid and from_number".into());
                }
            }
            ChannelKind::Email => {
                if !dest.contains('@') {
                    return Err(format!("email destination '{}' has no '@'", dest));
                }
                if self.notify.email.relay_url.is_none() {
                    return Err("email channel requires notify.email.relay_url".into());
                }
            }
            ChannelKind::Mqtt => {
                if dest.contains('#') || dest.contains('+') {
                    return Err("mqtt destination must be a topic without wildcards".into());
                }
            }
        }
        Ok(())
    }

    pub fn control_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.control.bind.parse().map_err(|_| {
            ConfigError::Invalid(vec![ConfigIssue {
                option: "control.bind".into(),
                message: format!("'{}' is not a socket address", self.control.bind),
            }])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.agent.agent_id = "drone-7".into();
        config.notify.channels = vec![ChannelConfig::new(ChannelKind::Webhook, "https://ops.example/alerts")];
        config
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.detection.area_threshold, 500);
        assert_eq!(config.session.cooldown_secs, 30);
        assert_eq!(config.command.max_retries, 3);
        assert_eq!(config.notify.max_retries, 3);
        assert_eq!(config.platform.broker_port, 1883);
    }

    #[test]
    fn test_default_config_without_channels_is_rejected() {
        let err = AgentConfig::default().validate().unwrap_err();
        assert!(err.issues().iter().any(|i| i.option == "notify.channels"));
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_all_invalid_options_reported() {
        let mut config = valid_config();
        config.detection.area_threshold = 0;
        config.session.max_consecutive_frame_failures = 0;
        config.notify.channels.push(ChannelConfig::new(ChannelKind::Webhook, "ftp://nope"));

        let err = config.validate().unwrap_err();
        let options: Vec<&str> = err.issues().iter().map(|i| i.option.as_str()).collect();
        assert!(options.contains(&"detection.area_threshold"));
        assert!(options.contains(&"session.max_consecutive_frame_failures"));
        assert!(options.contains(&"notify.channels[1]"));
    }

    #[test]
    fn test_duplicate_channels_rejected() {
        let mut config = valid_config();
        config.notify.channels.push(ChannelConfig::new(ChannelKind::Webhook, "https://ops.example/alerts"));
        let err = config.validate().unwrap_err();
        assert!(err.issues().iter().any(|i| i.message == "duplicate channel name"));
    }

    #[test]
    fn test_usable_channels_skips_broken_entries() {
        let mut config = valid_config();
        config.notify.channels.push(ChannelConfig::new(ChannelKind::Sms, "+15550100"));
        config.notify.channels.push(ChannelConfig::new(ChannelKind::Mqtt, "ops/alerts"));
        // sms has no account configured
        let usable = config.usable_channels();
        assert_eq!(usable.len(), 2);
        assert!(usable.iter().all(|c| c.kind != ChannelKind::Sms));
    }

    #[test]
    fn test_parse_toml() {
        let config = AgentConfig::from_toml(
            r#"
            [agent]
            agent_id = "patrol-1"

            [detection]
            area_threshold = 800
            warmup_frames = 10

            [session]
            cooldown_secs = 45

            [[notify.channels]]
            kind = "mqtt"
            destination = "operators/alerts"

            [[notify.channels]]
            name = "ops-email"
            kind = "email"
            destination = "ops@example.org"

            [notify.email]
            relay_url = "https://mail.example.org/send"
            "#,
        )
        .unwrap();

        assert_eq!(config.agent.agent_id, "patrol-1");
        assert_eq!(config.detection.area_threshold, 800);
        assert_eq!(config.detection.variance_threshold, 16.0);
        assert_eq!(config.cooldown(), Duration::from_secs(45));
        assert_eq!(config.notify.channels[0].channel_name(), "mqtt:operators/alerts");
        assert_eq!(config.notify.channels[1].channel_name(), "ops-email");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flat_option_names() {
        let config = AgentConfig::from_toml(
            r#"
            detection_area_threshold = 100
            warmup_frame_count = 2
            cooldown_seconds = 5
            max_consecutive_frame_failures = 4
            max_command_retries = 1
            max_channel_retries = 6
            audit_log_path = "/var/log/vigil/audit.jsonl"

            [[channel_destinations]]
            kind = "webhook"
            destination = "https://ops.example/alerts"
            "#,
        )
        .unwrap();

        assert_eq!(config.detection.area_threshold, 100);
        assert_eq!(config.detection.warmup_frames, 2);
        assert_eq!(config.cooldown(), Duration::from_secs(5));
        assert_eq!(config.session.max_consecutive_frame_failures, 4);
        assert_eq!(config.command.max_retries, 1);
        assert_eq!(config.notify.max_retries, 6);
        assert_eq!(config.audit.path, PathBuf::from("/var/log/vigil/audit.jsonl"));
        assert_eq!(config.notify.channels.len(), 1);
    }

    #[test]
    fn test_option_names_inside_sections() {
        let config = AgentConfig::from_toml(
            r#"
            [detection]
            detection_area_threshold = 120

            [session]
            cooldown_seconds = 7

            [notify]
            max_channel_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.detection.area_threshold, 120);
        assert_eq!(config.session.cooldown_secs, 7);
        assert_eq!(config.notify.max_retries, 2);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = AgentConfig::from_toml("[session]\ncooldown = 5\n").unwrap_err();
        assert!(err.to_string().contains("cooldown"));
        assert!(AgentConfig::from_toml("cooldwn_seconds = 5\n").is_err());
    }

    #[test]
    fn test_flat_and_section_option_conflict() {
        let err = AgentConfig::from_toml("cooldown_seconds = 5\n[session]\ncooldown_secs = 9\n").unwrap_err();
        assert!(err.to_string().contains("cooldown_seconds"));
    }

    #[test]
    fn test_config_file_path() {
        if let Ok(path) = AgentConfig::config_file_path() {
            assert!(path.to_string_lossy().contains("config.toml")
                || std::env::var("VIGIL_AGENT_CONFIG").is_ok());
        }
    }
}
