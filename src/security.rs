//! Shared-secret checks guarding the broker.
//!
//! Two independent secrets are in play: the admission secret a producer must
//! present before anything is published, and the transit token stamped into
//! broker metadata on every message and checked again on receipt. Both are
//! static bearer secrets. Previous values stay valid while a rotation rolls
//! out across deployments.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

use crate::broker::Properties;
use crate::config::SecurityConfig;
use crate::error::{OfficeError, Result};

/// Compare without short-circuiting on the first differing byte.
fn secret_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn matches_any(candidate: &str, current: &str, previous: &[String]) -> bool {
    if current.is_empty() {
        return false;
    }
    secret_eq(candidate, current) || previous.iter().any(|p| !p.is_empty() && secret_eq(candidate, p))
}

#[derive(Debug, Clone)]
pub struct SecurityManager {
    config: SecurityConfig,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Self {
        Self { config }
    }

    /// Log what the configured scheme does and does not protect against.
    pub fn log_startup_warning(&self) {
        tracing::warn!(
            target: "postoffice::security",
            api_security = self.config.enable_api_security,
            rotation_tokens = self.config.previous_message_tokens.len(),
            "Message security uses static shared secrets: anyone holding the admission secret or transit token can publish. Rotate them per environment"
        );
        if !self.config.enable_api_security {
            tracing::warn!(target: "postoffice::security", "API token checks are disabled");
        }
    }

    pub fn header_name(&self) -> &str {
        &self.config.api_token_header_name
    }

    /// Secret presented by in-process producers such as job follow-ups.
    pub(crate) fn admission_secret(&self) -> &str {
        &self.config.admission_secret
    }

    pub fn api_security_enabled(&self) -> bool {
        self.config.enable_api_security
    }

    /// Check an operator API token. Always passes when API security is off.
    pub fn validate_api_token(&self, token: Option<&str>) -> bool {
        if !self.config.enable_api_security {
            return true;
        }
        match token {
            Some(token) => !self.config.api_token.is_empty() && secret_eq(token, &self.config.api_token),
            None => false,
        }
    }

    /// Origination check run before a message may be published.
    pub fn validate_admission_secret(&self, secret: Option<&str>) -> Result<()> {
        let secret = secret.ok_or_else(|| OfficeError::Unauthorized("Missing API secret".to_string()))?;
        if matches_any(secret, &self.config.admission_secret, &self.config.previous_admission_secrets) {
            Ok(())
        } else {
            Err(OfficeError::Unauthorized("Invalid API secret".to_string()))
        }
    }

    /// Stamp the current transit token into outgoing message properties.
    pub fn add_message_security(&self, mut properties: Properties) -> Properties {
        properties.insert(
            self.config.message_token_property.clone(),
            self.config.message_security_token.clone(),
        );
        properties
    }

    /// Transit check run on every received message before its body is read.
    pub fn validate_message_security(&self, properties: &Properties, message_id: Option<&str>) -> bool {
        let property = &self.config.message_token_property;
        let message_id = message_id.unwrap_or("-");

        let Some(token) = properties.get(property) else {
            tracing::warn!(
                target: "postoffice::security",
                message_id = %message_id,
                "Message rejected: missing {}",
                property
            );
            return false;
        };

        if !matches_any(token, &self.config.message_security_token, &self.config.previous_message_tokens) {
            tracing::warn!(
                target: "postoffice::security",
                message_id = %message_id,
                "Message rejected: invalid {}",
                property
            );
            return false;
        }

        true
    }

    /// Random alphanumeric token suitable for any of the configured secrets.
    pub fn generate_secure_token(length: usize) -> String {
        OsRng
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecurityManager {
        SecurityManager::new(SecurityConfig {
            api_token: "api-token".to_string(),
            message_security_token: "transit-token".to_string(),
            admission_secret: "admission-secret".to_string(),
            previous_message_tokens: vec!["old-transit".to_string()],
            previous_admission_secrets: vec!["old-admission".to_string()],
            ..SecurityConfig::default()
        })
    }

    #[test]
    fn test_admission_secret() {
        let security = manager();
        assert!(security.validate_admission_secret(Some("admission-secret")).is_ok());
        assert!(security.validate_admission_secret(Some("old-admission")).is_ok());
        assert!(matches!(
            security.validate_admission_secret(Some("wrong")),
            Err(OfficeError::Unauthorized(_))
        ));
        assert!(security.validate_admission_secret(None).is_err());
    }

    #[test]
    fn test_stamp_then_validate() {
        let security = manager();
        let props = security.add_message_security(Properties::new());
        assert_eq!(props.get("securityToken").map(String::as_str), Some("transit-token"));
        assert!(security.validate_message_security(&props, Some("m1")));
    }

    #[test]
    fn test_transit_rejects_missing_and_wrong() {
        let security = manager();
        assert!(!security.validate_message_security(&Properties::new(), None));

        let mut props = Properties::new();
        props.insert("securityToken".to_string(), "nope".to_string());
        assert!(!security.validate_message_security(&props, Some("m2")));

        props.insert("securityToken".to_string(), "old-transit".to_string());
        assert!(security.validate_message_security(&props, Some("m3")));
    }

    #[test]
    fn test_api_token() {
        let security = manager();
        assert!(security.validate_api_token(Some("api-token")));
        assert!(!security.validate_api_token(Some("api-token-x")));
        assert!(!security.validate_api_token(None));

        let open = SecurityManager::new(SecurityConfig {
            enable_api_security: false,
            ..SecurityConfig::default()
        });
        assert!(open.validate_api_token(None));
    }

    #[test]
    fn test_empty_configured_secret_never_matches() {
        let security = SecurityManager::new(SecurityConfig::default());
        assert!(security.validate_admission_secret(Some("")).is_err());
    }

    #[test]
    fn test_generate_secure_token() {
        let token = SecurityManager::generate_secure_token(64);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, SecurityManager::generate_secure_token(64));
    }

    #[test]
    fn test_token_symbols_are_uniform() {
        let mut counts = std::collections::HashMap::new();
        for _ in 0..2000 {
            for c in SecurityManager::generate_secure_token(64).chars() {
                *counts.entry(c).or_insert(0usize) += 1;
            }
        }

        assert_eq!(counts.len(), 62);
        let expected = (2000 * 64) as f64 / 62.0;
        for (symbol, count) in counts {
            let ratio = count as f64 / expected;
            assert!((0.85..1.15).contains(&ratio), "{} drawn {:.2}x expected", symbol, ratio);
        }
    }
}
