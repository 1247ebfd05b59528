//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: RELAY_)
//! 2. Current working directory: ./config.toml
//! 3. Default values
//!
//! The `oauth2` section is additionally bridged from the platform-injected
//! `OAUTH2_SERVICE_*` environment variables after extraction; those names
//! predate the RELAY_ prefix and are set by the deployment platform rather
//! than by service operators, so they win over file values.

use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Token verification configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    /// Default queue endpoints registered at startup
    #[serde(default)]
    pub queue: QueueConfig,

    /// OAuth2 client self-registration settings
    #[serde(default)]
    pub oauth2: OAuth2RegistrationConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            environment: default_environment(),
        }
    }
}

/// Token verification configuration
///
/// Authentication is enabled iff a JWKS source is configured (either inline
/// or by URI); an empty source leaves the ingress interceptors passing
/// requests through unauthenticated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Inline JWKS document (JSON). Takes precedence over `jwks_uri`.
    #[serde(default)]
    pub jwks: String,

    /// URI to fetch the JWKS document from at startup
    #[serde(default)]
    pub jwks_uri: String,

    /// Expected token audience; empty disables the check
    #[serde(default)]
    pub audience: String,

    /// Expected token issuer; empty disables the check
    #[serde(default)]
    pub issuer: String,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Capacity multiplier applied to available parallelism when `capacity`
    /// is zero
    #[serde(default = "default_cpu_factor")]
    pub cpu_factor: usize,

    /// Maximum concurrent jobs; zero derives the cap from `cpu_factor`
    #[serde(default)]
    pub capacity: usize,

    /// Resident workers kept warm regardless of load
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Seconds an ephemeral worker stays idle before it is released
    #[serde(default = "default_worker_expiry")]
    pub expiry_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            cpu_factor: default_cpu_factor(),
            capacity: 0,
            count: default_worker_count(),
            expiry_secs: default_worker_expiry(),
        }
    }
}

impl WorkerPoolConfig {
    /// Resolved job-concurrency cap: the explicit capacity when set,
    /// otherwise `cpu_factor` times the available parallelism.
    pub fn effective_capacity(&self) -> usize {
        if self.capacity > 0 {
            return self.capacity;
        }
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (self.cpu_factor * parallelism).max(1)
    }

    /// Idle expiry as a [`Duration`].
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// Queue endpoints declared in configuration
///
/// Registered on a queue manager via
/// [`QueueManager::register_from_config`](crate::queue::QueueManager::register_from_config).
/// Config-declared subscribers carry no handlers and are therefore pull-only;
/// handler-driven subscribers are registered programmatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Publishers to register at startup
    #[serde(default)]
    pub publishers: Vec<QueueEndpointConfig>,

    /// Subscribers to register at startup (pull mode)
    #[serde(default)]
    pub subscribers: Vec<QueueEndpointConfig>,
}

/// One named queue endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueEndpointConfig {
    /// Reference the endpoint is registered under
    pub reference: String,

    /// Destination DSN
    pub url: String,
}

/// OAuth2 client self-registration settings
///
/// Registration runs at startup only when both the client secret and the
/// admin URI are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuth2RegistrationConfig {
    /// Client secret to register with
    #[serde(default)]
    pub client_secret: String,

    /// OAuth2 admin endpoint to register against
    #[serde(default)]
    pub admin_uri: String,

    /// Audiences the registered client may request tokens for
    #[serde(default)]
    pub audiences: Vec<String>,
}

impl OAuth2RegistrationConfig {
    /// Read the registration settings from the process environment alone.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.overlay_env();
        config
    }

    /// Overlay the `OAUTH2_SERVICE_*` environment variables onto this
    /// section. Set variables win over file values.
    pub fn overlay_env(&mut self) {
        if let Ok(secret) = std::env::var("OAUTH2_SERVICE_CLIENT_SECRET") {
            if !secret.is_empty() {
                self.client_secret = secret;
            }
        }
        if let Ok(uri) = std::env::var("OAUTH2_SERVICE_ADMIN_URI") {
            if !uri.is_empty() {
                self.admin_uri = uri;
            }
        }
        if let Ok(audience) = std::env::var("OAUTH2_SERVICE_AUDIENCE") {
            let audiences: Vec<String> = audience
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
            if !audiences.is_empty() {
                self.audiences = audiences;
            }
        }
    }

    /// Whether enough settings are present to attempt registration.
    pub fn is_configured(&self) -> bool {
        !self.client_secret.is_empty() && !self.admin_uri.is_empty()
    }
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Environment variables (RELAY_ prefix) override the working-directory
    /// `config.toml`, which overrides the built-in defaults. The `oauth2`
    /// section is then overlaid with the `OAUTH2_SERVICE_*` variables.
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load configuration from a specific file
    ///
    /// Useful for testing or non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RELAY_").split("_"))
            .extract()?;
        config.oauth2.overlay_env();
        Ok(config)
    }
}

// Default value functions
fn default_service_name() -> String {
    "relay-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_cpu_factor() -> usize {
    4
}

fn default_worker_count() -> usize {
    2
}

fn default_worker_expiry() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.service.name, "relay-service");
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.worker_pool.count, 2);
        assert_eq!(config.worker_pool.expiry_secs, 60);
        assert!(config.auth.jwks.is_empty());
        assert!(config.queue.publishers.is_empty());
        assert!(config.queue.subscribers.is_empty());
        assert!(!config.oauth2.is_configured());
    }

    #[test]
    fn test_effective_capacity_prefers_explicit_value() {
        let pool = WorkerPoolConfig {
            cpu_factor: 4,
            capacity: 7,
            count: 2,
            expiry_secs: 60,
        };
        assert_eq!(pool.effective_capacity(), 7);
    }

    #[test]
    fn test_effective_capacity_derives_from_cpu_factor() {
        let pool = WorkerPoolConfig {
            cpu_factor: 2,
            capacity: 0,
            count: 2,
            expiry_secs: 60,
        };
        assert!(pool.effective_capacity() >= 2);
    }

    #[test]
    fn test_oauth2_config_requires_secret_and_uri() {
        let config = OAuth2RegistrationConfig {
            client_secret: "s".to_string(),
            admin_uri: String::new(),
            audiences: Vec::new(),
        };
        assert!(!config.is_configured());

        let config = OAuth2RegistrationConfig {
            client_secret: "s".to_string(),
            admin_uri: "https://hydra.internal/clients".to_string(),
            audiences: Vec::new(),
        };
        assert!(config.is_configured());
    }

    #[test]
    fn test_oauth2_env_overlay_wins_over_file_values() {
        std::env::set_var("OAUTH2_SERVICE_CLIENT_SECRET", "env-secret");
        std::env::set_var("OAUTH2_SERVICE_AUDIENCE", "svc-a, svc-b,");
        std::env::remove_var("OAUTH2_SERVICE_ADMIN_URI");

        let mut config = OAuth2RegistrationConfig {
            client_secret: "file-secret".to_string(),
            admin_uri: "https://hydra.internal/clients".to_string(),
            audiences: vec!["file-aud".to_string()],
        };
        config.overlay_env();

        assert_eq!(config.client_secret, "env-secret");
        // File value survives when the variable is absent
        assert_eq!(config.admin_uri, "https://hydra.internal/clients");
        assert_eq!(config.audiences, vec!["svc-a", "svc-b"]);

        std::env::remove_var("OAUTH2_SERVICE_CLIENT_SECRET");
        std::env::remove_var("OAUTH2_SERVICE_AUDIENCE");
    }
}
