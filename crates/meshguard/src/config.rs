use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use meshguard_isolation::{CircuitBreakerConfig, IsolationPolicy, IsolationSettings};
use meshguard_policy::PolicyEngineSettings;

use crate::error::{RootError, RootResult};

/// Configuration for the ABAC policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// How long a cached decision stays valid, in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Upper bound on cached decisions.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Install the bootstrap policies at startup.
    #[serde(default = "default_true")]
    pub load_default_policies: bool,

    /// Policy bundle (JSON) imported at startup, after the bootstrap policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<PathBuf>,
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            load_default_policies: true,
            bundle_path: None,
        }
    }
}

impl PolicyConfig {
    pub fn engine_settings(&self) -> PolicyEngineSettings {
        PolicyEngineSettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            cache_max_entries: self.cache_max_entries,
            load_defaults: self.load_default_policies,
        }
    }
}

/// Configuration for automatic isolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Start from the shipped escalation curves.
    #[serde(default = "default_true")]
    pub use_default_policies: bool,

    /// Extra curves. A curve replaces any default for the same trigger reason.
    #[serde(default)]
    pub policies: Vec<IsolationPolicy>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            use_default_policies: true,
            policies: Vec::new(),
        }
    }
}

impl IsolationConfig {
    /// Effective curves: defaults (if enabled) overlaid with the configured ones.
    pub fn effective_policies(&self) -> Vec<IsolationPolicy> {
        let mut policies = if self.use_default_policies {
            meshguard_isolation::default_policies()
        } else {
            Vec::new()
        };
        for custom in &self.policies {
            policies.retain(|p| p.trigger_reason != custom.trigger_reason);
            policies.push(custom.clone());
        }
        policies
    }
}

/// Configuration for the quarantine zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineConfig {
    #[serde(default = "default_zone_id")]
    pub zone_id: String,

    /// Bandwidth cap for quarantined peers, bytes per second.
    #[serde(default = "default_max_bandwidth")]
    pub max_bandwidth: u64,

    #[serde(default = "default_allowed_operations")]
    pub allowed_operations: Vec<String>,

    /// Outsiders that may still talk to quarantined nodes.
    #[serde(default)]
    pub allowed_peers: Vec<String>,

    /// Keep zone membership in step with isolation levels.
    #[serde(default = "default_true")]
    pub sync_with_isolation: bool,
}

fn default_zone_id() -> String {
    "quarantine".to_string()
}

fn default_max_bandwidth() -> u64 {
    meshguard_isolation::quarantine::DEFAULT_MAX_BANDWIDTH
}

fn default_allowed_operations() -> Vec<String> {
    meshguard_isolation::quarantine::DEFAULT_ALLOWED_OPERATIONS
        .iter()
        .map(|op| op.to_string())
        .collect()
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            zone_id: default_zone_id(),
            max_bandwidth: default_max_bandwidth(),
            allowed_operations: default_allowed_operations(),
            allowed_peers: Vec::new(),
            sync_with_isolation: true,
        }
    }
}

/// Top-level configuration for a meshguard node.
///
/// Loaded from a TOML file (typically `~/.meshguard/config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshGuardConfig {
    /// Identity of the local node.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub quarantine: QuarantineConfig,
}

fn default_node_id() -> String {
    "local".to_string()
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

impl Default for MeshGuardConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            policy: PolicyConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            isolation: IsolationConfig::default(),
            quarantine: QuarantineConfig::default(),
        }
    }
}

impl MeshGuardConfig {
    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration.
    pub fn load(path: &Path) -> RootResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
        let config: MeshGuardConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> RootResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(RootError::Config("node_id must not be empty".into()));
        }
        if self.policy.cache_ttl_secs == 0 {
            return Err(RootError::Config("policy.cache_ttl_secs must be > 0".into()));
        }
        if self.policy.cache_max_entries == 0 {
            return Err(RootError::Config(
                "policy.cache_max_entries must be > 0".into(),
            ));
        }
        self.circuit_breaker.validate()?;
        for policy in &self.isolation.policies {
            policy.validate()?;
        }
        if self.quarantine.zone_id.trim().is_empty() {
            return Err(RootError::Config(
                "quarantine.zone_id must not be empty".into(),
            ));
        }
        if self.quarantine.max_bandwidth == 0 {
            return Err(RootError::Config(format!(
                "quarantine.max_bandwidth must be > 0, got {}",
                self.quarantine.max_bandwidth
            )));
        }
        Ok(())
    }

    pub fn isolation_settings(&self) -> IsolationSettings {
        IsolationSettings {
            breaker: self.circuit_breaker.clone(),
            policies: self.isolation.effective_policies(),
        }
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".meshguard/config.toml")
    }
}
