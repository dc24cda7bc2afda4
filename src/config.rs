//! Runtime configuration.
//!
//! Configuration comes from the environment (optionally seeded by a `.env`
//! file) and, when a path is given, from a YAML file whose values the
//! environment then overrides. Per-queue keys are derived from the queue's
//! logical name, so `ai-service` is tuned by `AI_SERVICE_QUEUE`,
//! `AI_SERVICE_MAX_CONCURRENT_JOBS` and `AI_SERVICE_WEBHOOK_URL`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use convert_case::{Case, Casing};
use serde::{Deserialize, Serialize};

use crate::broker::RedeliveryBackoff;
use crate::error::{OfficeError, Result};

/// Logical name of the single routing queue.
pub const POST_OFFICE: &str = "post-office";

/// Throttled subsystems and their default concurrency caps.
pub const DEFAULT_SUBSYSTEMS: [(&str, usize); 6] = [
    ("ai-service", 2),
    ("prep-media", 3),
    ("get-media", 2),
    ("analyse-media", 2),
    ("crawl-media", 2),
    ("search-crawl", 2),
];

const MIN_TOKEN_LENGTH: usize = 32;

/// NATS JetStream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub stream_name: String,
    pub max_age_secs: u64,
    pub max_bytes: i64,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait_secs: u64,
    /// Deliveries before the broker gives up on a message.
    pub max_deliver: i64,
    /// First redelivery delay after an abandon; doubles per delivery.
    pub redelivery_initial_ms: u64,
    pub redelivery_max_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "POSTOFFICE".to_string(),
            max_age_secs: 24 * 60 * 60, // 24 hours
            max_bytes: 1024 * 1024 * 1024, // 1GB
            ack_wait_secs: 300,
            max_deliver: 5,
            redelivery_initial_ms: 1000,
            redelivery_max_secs: 60,
        }
    }
}

impl BrokerConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn backoff(&self) -> RedeliveryBackoff {
        RedeliveryBackoff {
            initial: Duration::from_millis(self.redelivery_initial_ms),
            max: Duration::from_secs(self.redelivery_max_secs),
        }
    }
}

/// Shared secrets for the admission and transit checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Token required on operator HTTP endpoints.
    pub api_token: String,
    /// Stamped into broker metadata on every message.
    pub message_security_token: String,
    /// Secret a producer must present to admit a message.
    pub admission_secret: String,
    /// Older transit tokens still accepted while a rotation rolls out.
    pub previous_message_tokens: Vec<String>,
    /// Older admission secrets still accepted while a rotation rolls out.
    pub previous_admission_secrets: Vec<String>,
    pub api_token_header_name: String,
    pub message_token_property: String,
    pub enable_api_security: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            message_security_token: String::new(),
            admission_secret: String::new(),
            previous_message_tokens: Vec::new(),
            previous_admission_secrets: Vec::new(),
            api_token_header_name: "x-api-token".to_string(),
            message_token_property: "securityToken".to_string(),
            enable_api_security: true,
        }
    }
}

/// One broker-backed queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Logical subsystem name used for routing and status.
    pub name: String,
    /// Broker queue the subsystem consumes from.
    pub queue_name: String,
    pub max_concurrent_jobs: usize,
    /// Worker endpoint the default job handler posts to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl QueueSettings {
    pub fn new(name: &str, max_concurrent_jobs: usize) -> Self {
        Self {
            name: name.to_string(),
            queue_name: name.to_string(),
            max_concurrent_jobs,
            webhook_url: None,
        }
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(queue) = lookup(&env_key(&self.name, "QUEUE")) {
            self.queue_name = queue;
        }
        if let Some(max) = parse_env(lookup, &env_key(&self.name, "MAX_CONCURRENT_JOBS"))? {
            self.max_concurrent_jobs = max;
        }
        if let Some(url) = lookup(&env_key(&self.name, "WEBHOOK_URL")) {
            self.webhook_url = Some(url);
        }
        Ok(())
    }
}

/// Everything the post office needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficeConfig {
    pub broker: BrokerConfig,
    pub security: SecurityConfig,
    pub post_office: QueueSettings,
    pub throttle_queues: Vec<QueueSettings>,
    /// Upper bound on one handler invocation; must stay below the ack wait.
    pub handler_timeout_secs: u64,
    /// Time given to in-flight jobs when a queue stops.
    pub shutdown_grace_secs: u64,
    pub http_port: u16,
}

impl Default for OfficeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            security: SecurityConfig::default(),
            post_office: QueueSettings::new(POST_OFFICE, 5),
            throttle_queues: DEFAULT_SUBSYSTEMS
                .iter()
                .map(|(name, max)| QueueSettings::new(name, *max))
                .collect(),
            handler_timeout_secs: 240,
            shutdown_grace_secs: 10,
            http_port: 8080,
        }
    }
}

/// Derive the environment key for a queue setting, e.g. `ai-service` + `QUEUE`.
pub fn env_key(queue: &str, suffix: &str) -> String {
    format!("{}_{}", queue.to_case(Case::UpperSnake), suffix)
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| OfficeError::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl OfficeConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file and apply environment overrides on top.
    pub fn load_from_file<P, F>(path: P, lookup: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            OfficeError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config: OfficeConfig = serde_yaml::from_str(&contents)
            .map_err(|e| OfficeError::Config(format!("Failed to parse YAML: {}", e)))?;

        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Broker
        if let Some(url) = lookup("NATS_URL") {
            self.broker.url = url;
        }
        if let Some(stream) = lookup("NATS_STREAM") {
            self.broker.stream_name = stream;
        }
        if let Some(secs) = parse_env(lookup, "NATS_ACK_WAIT_SECS")? {
            self.broker.ack_wait_secs = secs;
        }
        if let Some(max) = parse_env(lookup, "MAX_DELIVER")? {
            self.broker.max_deliver = max;
        }
        if let Some(ms) = parse_env(lookup, "REDELIVERY_INITIAL_MS")? {
            self.broker.redelivery_initial_ms = ms;
        }
        if let Some(secs) = parse_env(lookup, "REDELIVERY_MAX_SECS")? {
            self.broker.redelivery_max_secs = secs;
        }

        // Security
        let security = &mut self.security;
        if let Some(token) = lookup("API_TOKEN") {
            security.api_token = token;
        }
        if let Some(token) = lookup("MESSAGE_SECURITY_TOKEN") {
            security.message_security_token = token;
        }
        if let Some(secret) = lookup("ADMISSION_SECRET") {
            security.admission_secret = secret;
        }
        if let Some(previous) = lookup("MESSAGE_SECURITY_TOKEN_PREVIOUS") {
            security.previous_message_tokens = split_list(&previous);
        }
        if let Some(previous) = lookup("ADMISSION_SECRET_PREVIOUS") {
            security.previous_admission_secrets = split_list(&previous);
        }
        if let Some(header) = lookup("API_TOKEN_HEADER_NAME") {
            security.api_token_header_name = header;
        }
        if let Some(property) = lookup("MESSAGE_TOKEN_PROPERTY") {
            security.message_token_property = property;
        }
        if let Some(flag) = lookup("ENABLE_API_SECURITY") {
            security.enable_api_security = flag.trim() != "false";
        }

        // Queues
        self.post_office.apply_env(lookup)?;
        for queue in &mut self.throttle_queues {
            queue.apply_env(lookup)?;
        }

        if let Some(secs) = parse_env(lookup, "HANDLER_TIMEOUT_SECS")? {
            self.handler_timeout_secs = secs;
        }
        if let Some(secs) = parse_env(lookup, "SHUTDOWN_GRACE_SECS")? {
            self.shutdown_grace_secs = secs;
        }
        if let Some(port) = parse_env(lookup, "PORT")? {
            self.http_port = port;
        }

        Ok(())
    }

    /// Reject configurations the consumers cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        let security = &self.security;
        if security.message_security_token.is_empty() || security.admission_secret.is_empty() {
            return Err(OfficeError::Config(
                "Security tokens not configured. Set MESSAGE_SECURITY_TOKEN and ADMISSION_SECRET".to_string(),
            ));
        }
        if security.enable_api_security && security.api_token.is_empty() {
            return Err(OfficeError::Config(
                "API_TOKEN is required while ENABLE_API_SECURITY is on".to_string(),
            ));
        }
        if security.message_security_token.len() < MIN_TOKEN_LENGTH
            || security.admission_secret.len() < MIN_TOKEN_LENGTH
        {
            tracing::warn!(
                min_length = MIN_TOKEN_LENGTH,
                "Security tokens should be at least {} characters long",
                MIN_TOKEN_LENGTH
            );
        }

        if self.handler_timeout_secs == 0 || self.handler_timeout_secs >= self.broker.ack_wait_secs {
            return Err(OfficeError::Config(format!(
                "Handler timeout ({}s) must be non-zero and shorter than the broker ack wait ({}s)",
                self.handler_timeout_secs, self.broker.ack_wait_secs
            )));
        }

        let mut seen = Vec::new();
        for queue in std::iter::once(&self.post_office).chain(self.throttle_queues.iter()) {
            if queue.max_concurrent_jobs == 0 {
                return Err(OfficeError::Config(format!(
                    "Queue '{}' needs at least one concurrent job",
                    queue.name
                )));
            }
            if seen.contains(&queue.name) {
                return Err(OfficeError::Config(format!("Queue '{}' is defined twice", queue.name)));
            }
            seen.push(queue.name.clone());
        }

        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn throttle_queue(&self, name: &str) -> Option<&QueueSettings> {
        self.throttle_queues.iter().find(|q| q.name == name)
    }

    /// Copy with every secret masked, for printing.
    pub fn redacted(&self) -> Self {
        fn mask(secret: &str) -> String {
            if secret.is_empty() { String::new() } else { "***".to_string() }
        }

        let mut copy = self.clone();
        let security = &mut copy.security;
        security.api_token = mask(&security.api_token);
        security.message_security_token = mask(&security.message_security_token);
        security.admission_secret = mask(&security.admission_secret);
        security.previous_message_tokens = security.previous_message_tokens.iter().map(|s| mask(s)).collect();
        security.previous_admission_secrets = security.previous_admission_secrets.iter().map(|s| mask(s)).collect();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = [
            ("API_TOKEN", "a".repeat(32)),
            ("MESSAGE_SECURITY_TOKEN", "m".repeat(32)),
            ("ADMISSION_SECRET", "s".repeat(32)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        map
    }

    #[test]
    fn test_env_key_derivation() {
        assert_eq!(env_key("ai-service", "QUEUE"), "AI_SERVICE_QUEUE");
        assert_eq!(env_key("post-office", "MAX_CONCURRENT_JOBS"), "POST_OFFICE_MAX_CONCURRENT_JOBS");
    }

    #[test]
    fn test_defaults_from_env() {
        let vars = env(&[]);
        let config = OfficeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.post_office.max_concurrent_jobs, 5);
        assert_eq!(config.throttle_queue("ai-service").unwrap().max_concurrent_jobs, 2);
        assert_eq!(config.throttle_queue("prep-media").unwrap().max_concurrent_jobs, 3);
        assert_eq!(config.security.message_token_property, "securityToken");
        assert!(config.handler_timeout() < config.broker.ack_wait());
    }

    #[test]
    fn test_queue_overrides() {
        let vars = env(&[
            ("AI_SERVICE_QUEUE", "ai-service-staging"),
            ("AI_SERVICE_MAX_CONCURRENT_JOBS", "4"),
            ("PREP_MEDIA_WEBHOOK_URL", "http://worker/prep"),
            ("MESSAGE_SECURITY_TOKEN_PREVIOUS", "old-one, old-two"),
        ]);
        let config = OfficeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        let ai = config.throttle_queue("ai-service").unwrap();
        assert_eq!(ai.queue_name, "ai-service-staging");
        assert_eq!(ai.max_concurrent_jobs, 4);
        assert_eq!(
            config.throttle_queue("prep-media").unwrap().webhook_url.as_deref(),
            Some("http://worker/prep")
        );
        assert_eq!(config.security.previous_message_tokens, vec!["old-one", "old-two"]);
    }

    #[test]
    fn test_redelivery_backoff_overrides() {
        let vars = env(&[("REDELIVERY_INITIAL_MS", "250"), ("REDELIVERY_MAX_SECS", "5")]);
        let config = OfficeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        let backoff = config.broker.backoff();
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(3), Duration::from_secs(1));
        assert_eq!(backoff.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let vars = env(&[("AI_SERVICE_MAX_CONCURRENT_JOBS", "lots")]);
        assert!(matches!(
            OfficeConfig::from_lookup(|k| vars.get(k).cloned()),
            Err(OfficeError::Config(_))
        ));

        let vars = env(&[("PREP_MEDIA_MAX_CONCURRENT_JOBS", "0")]);
        assert!(OfficeConfig::from_lookup(|k| vars.get(k).cloned()).is_err());

        let vars = env(&[("HANDLER_TIMEOUT_SECS", "600")]);
        assert!(OfficeConfig::from_lookup(|k| vars.get(k).cloned()).is_err());

        let mut vars = env(&[]);
        vars.remove("MESSAGE_SECURITY_TOKEN");
        assert!(OfficeConfig::from_lookup(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn test_api_token_optional_when_disabled() {
        let mut vars = env(&[("ENABLE_API_SECURITY", "false")]);
        vars.remove("API_TOKEN");
        let config = OfficeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert!(!config.security.enable_api_security);
    }

    #[test]
    fn test_load_yaml_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
broker:
  url: nats://broker:4222
  ack_wait_secs: 120
handler_timeout_secs: 60
security:
  message_security_token: from-yaml-token
  admission_secret: from-yaml-secret
  enable_api_security: false
throttle_queues:
  - name: ai-service
    queue_name: ai
    max_concurrent_jobs: 1
"#
        )
        .unwrap();

        let vars: HashMap<String, String> =
            [("AI_SERVICE_MAX_CONCURRENT_JOBS".to_string(), "3".to_string())].into();
        let config = OfficeConfig::load_from_file(file.path(), |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.broker.url, "nats://broker:4222");
        assert_eq!(config.broker.stream_name, "POSTOFFICE");
        assert_eq!(config.throttle_queues.len(), 1);
        assert_eq!(config.throttle_queues[0].queue_name, "ai");
        assert_eq!(config.throttle_queues[0].max_concurrent_jobs, 3);
        assert_eq!(config.post_office.name, POST_OFFICE);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let vars = env(&[]);
        let config = OfficeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap().redacted();
        assert_eq!(config.security.api_token, "***");
        assert_eq!(config.security.admission_secret, "***");
    }
}
