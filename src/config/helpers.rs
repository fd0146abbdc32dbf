use crate::error::ConfigError;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be valid UTF-8".to_string(),
        }),
    }
}

/// Parse an optional env var with `FromStr`, falling back to `default`.
pub(crate) fn parse_env_or<T>(key: &str, default: T, expected: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| s.parse())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be {expected}: {e}"),
        })
        .map(|value| value.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENV_MUTEX;

    #[test]
    fn blank_values_are_unset() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("PROVISIONER_HELPER_TEST", "   ");
        }
        assert_eq!(optional_env("PROVISIONER_HELPER_TEST").unwrap(), None);
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("PROVISIONER_HELPER_TEST", "42");
        }
        assert_eq!(
            parse_env_or::<u64>("PROVISIONER_HELPER_TEST", 7, "an integer").unwrap(),
            42
        );
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("PROVISIONER_HELPER_TEST", "forty-two");
        }
        assert!(matches!(
            parse_env_or::<u64>("PROVISIONER_HELPER_TEST", 7, "an integer"),
            Err(ConfigError::InvalidValue { .. })
        ));
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("PROVISIONER_HELPER_TEST");
        }
        assert_eq!(
            parse_env_or::<u64>("PROVISIONER_HELPER_TEST", 7, "an integer").unwrap(),
            7
        );
    }
}
