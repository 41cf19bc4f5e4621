use thiserror::Error;

/// Error type for the meshguard root library and binary, aggregating the
/// errors of the member crates.
#[derive(Debug, Error)]
pub enum RootError {
    #[error("core error: {0}")]
    Core(#[from] meshguard_core::CoreError),

    #[error("policy error: {0}")]
    Policy(#[from] meshguard_policy::PolicyError),

    #[error("isolation error: {0}")]
    Isolation(#[from] meshguard_isolation::IsolationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RootError {
    fn from(e: serde_json::Error) -> Self {
        RootError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for RootError {
    fn from(e: toml::de::Error) -> Self {
        RootError::Config(format!("TOML parse error: {}", e))
    }
}

pub type RootResult<T> = Result<T, RootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_error_config() {
        let err = RootError::Config("node_id must not be empty".into());
        assert_eq!(
            err.to_string(),
            "configuration error: node_id must not be empty"
        );
    }

    #[test]
    fn test_root_error_from_policy() {
        let policy_err = meshguard_policy::PolicyError::ValidationError("no rules".into());
        let root_err: RootError = policy_err.into();
        assert!(root_err.to_string().contains("no rules"));
    }

    #[test]
    fn test_root_error_from_isolation() {
        let iso_err = meshguard_isolation::IsolationError::InvalidBreakerConfig(
            "failure_threshold must be > 0".into(),
        );
        let root_err: RootError = iso_err.into();
        assert!(matches!(root_err, RootError::Isolation(_)));
        assert!(root_err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn test_root_error_from_core() {
        let core_err = meshguard_core::CoreError::InvalidTimestamp("yesterday".into());
        let root_err: RootError = core_err.into();
        assert!(root_err.to_string().contains("yesterday"));
    }

    #[test]
    fn test_root_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let root_err: RootError = json_err.into();
        assert!(matches!(root_err, RootError::Serialization(_)));
    }

    #[test]
    fn test_root_error_from_toml() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let root_err: RootError = toml_err.into();
        assert!(matches!(root_err, RootError::Config(_)));
    }

    #[test]
    fn test_root_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "bundle.json");
        let root_err: RootError = io_err.into();
        assert!(root_err.to_string().starts_with("io error"));
    }

    #[test]
    fn test_every_variant_has_a_producer() {
        let produced: Vec<RootError> = vec![
            meshguard_core::CoreError::InvalidTimestamp("t".into()).into(),
            meshguard_policy::PolicyError::ValidationError("p".into()).into(),
            meshguard_isolation::IsolationError::InvalidBreakerConfig("b".into()).into(),
            toml::from_str::<toml::Value>("= invalid").unwrap_err().into(),
            std::io::Error::new(std::io::ErrorKind::Other, "io").into(),
            serde_json::from_str::<serde_json::Value>("{").unwrap_err().into(),
        ];
        let labels: Vec<&str> = produced
            .iter()
            .map(|err| match err {
                RootError::Core(_) => "core",
                RootError::Policy(_) => "policy",
                RootError::Isolation(_) => "isolation",
                RootError::Config(_) => "config",
                RootError::Io(_) => "io",
                RootError::Serialization(_) => "serialization",
            })
            .collect();
        assert_eq!(
            labels,
            vec!["core", "policy", "isolation", "config", "io", "serialization"]
        );
    }
}
