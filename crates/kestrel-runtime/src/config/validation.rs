//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{ContactsConfig, DispatchConfig, KestrelConfig, LogLevel, LoggingConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &KestrelConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_dispatch_config(&config.dispatch)?;
    validate_contacts_config(&config.contacts)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    for (module, level) in &logging.filters {
        if module.is_empty() {
            return Err(ConfigError::validation("Log filter module must not be empty"));
        }
        if !LogLevel::NAMES.contains(&level.to_lowercase().as_str()) {
            return Err(ConfigError::validation(format!(
                "Invalid log level for {module}: {level}. Valid values are: {:?}",
                LogLevel::NAMES
            )));
        }
    }
    Ok(())
}

fn validate_dispatch_config(dispatch: &DispatchConfig) -> ConfigResult<()> {
    if dispatch.command_prefix.is_empty() {
        return Err(ConfigError::missing_field("dispatch.command_prefix"));
    }
    if dispatch.command_prefix.chars().any(char::is_whitespace) {
        return Err(ConfigError::validation(
            "Command prefix must not contain whitespace",
        ));
    }
    if dispatch.root_users.iter().any(String::is_empty) {
        return Err(ConfigError::validation("Root user identifiers must not be empty"));
    }
    Ok(())
}

fn validate_contacts_config(contacts: &ContactsConfig) -> ConfigResult<()> {
    if contacts.refresh_interval_secs == 0 {
        return Err(ConfigError::validation(
            "Contacts refresh interval must be greater than 0",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&KestrelConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let mut config = KestrelConfig::default();
        config.dispatch.command_prefix.clear();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_unknown_filter_level_rejected() {
        let mut config = KestrelConfig::default();
        config
            .logging
            .filters
            .insert("kestrel_core".into(), "loud".into());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_zero_refresh_interval_rejected() {
        let mut config = KestrelConfig::default();
        config.contacts.refresh_interval_secs = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}
