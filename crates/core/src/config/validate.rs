use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - HTTP timeout is not 0
/// - User agent is not empty
/// - Action timeout, when set, is not 0
/// - Explicit paths are not empty
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.http.timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "http.timeout_secs cannot be 0".to_string(),
        ));
    }

    if config.http.user_agent.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "http.user_agent cannot be empty".to_string(),
        ));
    }

    if config.engine.action_timeout_secs == Some(0) {
        return Err(ConfigError::ValidationError(
            "engine.action_timeout_secs cannot be 0".to_string(),
        ));
    }

    if config
        .store
        .path
        .as_ref()
        .is_some_and(|p| p.as_os_str().is_empty())
    {
        return Err(ConfigError::ValidationError(
            "store.path cannot be empty".to_string(),
        ));
    }

    if config
        .downloads
        .dir
        .as_ref()
        .is_some_and(|p| p.as_os_str().is_empty())
    {
        return Err(ConfigError::ValidationError(
            "downloads.dir cannot be empty".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_timeout_zero_fails() {
        let mut config = Config::default();
        config.http.timeout_secs = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_empty_user_agent_fails() {
        let mut config = Config::default();
        config.http.user_agent = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_action_timeout_zero_fails() {
        let mut config = Config::default();
        config.engine.action_timeout_secs = Some(0);
        assert!(validate_config(&config).is_err());

        config.engine.action_timeout_secs = Some(30);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_empty_store_path_fails() {
        let mut config = Config::default();
        config.store.path = Some(PathBuf::new());
        assert!(validate_config(&config).is_err());
    }
}
