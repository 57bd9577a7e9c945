//! Router configuration.
//!
//! Every section has defaults, so an empty document yields a working setup:
//!
//! ```toml
//! domain = "proxy"
//!
//! [router]
//! iq_timeout_ms = 2000
//! duplicate_cache_size = 512
//! presence_sender_cache_size = 4096
//! interceptor_failure_policy = "open"
//!
//! [router.delivery]
//! core_pool_size = 10
//! max_pool_size = 20
//!
//! [components]
//! enabled = ["ping"]
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::component::ComponentSettings;
use crate::interceptor::{FailurePolicy, DEFAULT_PRESENCE_SENDERS};
use crate::XopError;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XopConfig {
    /// Domain served by this proxy (e.g., "proxy")
    pub domain: String,
    /// Routing core settings
    pub router: RouterConfig,
    /// Component loading settings
    pub components: ComponentsConfig,
}

impl Default for XopConfig {
    fn default() -> Self {
        Self {
            domain: "proxy".into(),
            router: RouterConfig::default(),
            components: ComponentsConfig::default(),
        }
    }
}

impl XopConfig {
    /// Check the configuration for values the router cannot run with.
    pub fn validate(&self) -> Result<(), XopError> {
        if self.domain.trim().is_empty() {
            return Err(XopError::config("domain must not be empty"));
        }
        jid::BareJid::new(&self.domain)
            .map_err(|e| XopError::config(format!("invalid domain '{}': {}", self.domain, e)))?;
        self.router.validate()
    }
}

/// Routing core settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Time an IQ request may stay unanswered before an error is synthesized
    pub iq_timeout_ms: u64,
    /// Number of message fingerprints remembered for duplicate suppression
    pub duplicate_cache_size: usize,
    /// Number of presence senders whose latest presence is remembered
    pub presence_sender_cache_size: usize,
    /// What to do when an interceptor errors or panics
    pub interceptor_failure_policy: FailurePolicy,
    /// Maximum wait for delivery workers when shutting down
    pub shutdown_grace_ms: u64,
    /// Delivery worker pool
    pub delivery: DeliveryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            iq_timeout_ms: 2000,
            duplicate_cache_size: 512,
            presence_sender_cache_size: DEFAULT_PRESENCE_SENDERS,
            interceptor_failure_policy: FailurePolicy::Open,
            shutdown_grace_ms: 5000,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl RouterConfig {
    /// IQ timeout as a duration.
    pub fn iq_timeout(&self) -> Duration {
        Duration::from_millis(self.iq_timeout_ms)
    }

    /// Shutdown grace period as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<(), XopError> {
        if self.iq_timeout_ms == 0 {
            return Err(XopError::config("router.iq_timeout_ms must be greater than 0"));
        }
        self.delivery.validate()
    }
}

/// Delivery worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Workers started eagerly, one per submission, and kept alive while idle
    pub core_pool_size: usize,
    /// Upper bound on workers; 0 means unbounded
    pub max_pool_size: usize,
    /// Idle time after which a worker above the core size exits
    pub keep_alive_ms: u64,
    /// Stanzas waiting for a worker; 0 means unbounded
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 10,
            max_pool_size: 20,
            keep_alive_ms: 30_000,
            queue_capacity: 1024,
        }
    }
}

impl DeliveryConfig {
    /// Keep-alive as a duration.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Effective worker limit.
    pub fn max_workers(&self) -> usize {
        if self.max_pool_size == 0 {
            usize::MAX
        } else {
            self.max_pool_size.max(self.core_pool_size)
        }
    }

    /// Effective queue limit, `None` when unbounded.
    pub fn queue_limit(&self) -> Option<usize> {
        (self.queue_capacity > 0).then_some(self.queue_capacity)
    }

    fn validate(&self) -> Result<(), XopError> {
        if self.max_pool_size != 0 && self.max_pool_size < self.core_pool_size {
            return Err(XopError::config(format!(
                "router.delivery.max_pool_size ({}) is smaller than core_pool_size ({})",
                self.max_pool_size, self.core_pool_size
            )));
        }
        Ok(())
    }
}

/// Component loading settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentsConfig {
    /// Components to load; empty loads every registered component
    pub enabled: Vec<String>,
    /// Free-form settings per component name
    pub settings: HashMap<String, ComponentSettings>,
}

impl ComponentsConfig {
    /// Settings for the named component, empty if none are configured.
    pub fn settings_for(&self, name: &str) -> ComponentSettings {
        self.settings.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = XopConfig::default();
        assert_eq!(config.domain, "proxy");
        assert_eq!(config.router.iq_timeout(), Duration::from_millis(2000));
        assert_eq!(config.router.duplicate_cache_size, 512);
        assert_eq!(config.router.presence_sender_cache_size, 4096);
        assert_eq!(config.router.interceptor_failure_policy, FailurePolicy::Open);
        assert_eq!(config.router.delivery.core_pool_size, 10);
        assert_eq!(config.router.delivery.max_pool_size, 20);
        assert!(config.components.enabled.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: XopConfig = toml::from_str("").unwrap();
        assert_eq!(config, XopConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config: XopConfig = toml::from_str(
            r#"
            domain = "lan.proxy"

            [router]
            iq_timeout_ms = 500
            interceptor_failure_policy = "closed"

            [router.delivery]
            max_pool_size = 0
            queue_capacity = 0

            [components]
            enabled = ["ping"]

            [components.settings.ping]
            reply_from = "proxy"
            "#,
        )
        .unwrap();

        assert_eq!(config.domain, "lan.proxy");
        assert_eq!(config.router.iq_timeout_ms, 500);
        assert_eq!(config.router.duplicate_cache_size, 512);
        assert_eq!(config.router.interceptor_failure_policy, FailurePolicy::Closed);
        assert_eq!(config.router.delivery.core_pool_size, 10);
        assert_eq!(config.router.delivery.max_workers(), usize::MAX);
        assert_eq!(config.router.delivery.queue_limit(), None);
        assert_eq!(config.components.enabled, vec!["ping".to_string()]);
        assert_eq!(
            config.components.settings_for("ping").get("reply_from").map(String::as_str),
            Some("proxy")
        );
        assert!(config.components.settings_for("console").is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = XopConfig::default();
        config.domain = " ".into();
        assert!(matches!(config.validate(), Err(XopError::Config(_))));

        let mut config = XopConfig::default();
        config.router.iq_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = XopConfig::default();
        config.router.delivery.core_pool_size = 8;
        config.router.delivery.max_pool_size = 4;
        assert!(config.validate().is_err());
    }
}
