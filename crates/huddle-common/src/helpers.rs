//! Common helper functions for Huddle.

/// Reads a boolean toggle from the environment.
///
/// `1`, `true`, `yes` and `on` (any case, surrounding whitespace ignored) count
/// as true; any other value is false. Unset variables yield `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// True when `HUDDLE_ENVIRONMENT=production` or `HUDDLE_ENVIRONMENT_PRODUCTION` is set.
pub fn is_production() -> bool {
    env_bool("HUDDLE_ENVIRONMENT_PRODUCTION", false)
        || std::env::var("HUDDLE_ENVIRONMENT")
            .map(|v| v.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_true_values() {
        for (name, value) in [
            ("HUDDLE_TEST_ENV_TRUE", "true"),
            ("HUDDLE_TEST_ENV_1", "1"),
            ("HUDDLE_TEST_ENV_YES", "yes"),
            ("HUDDLE_TEST_ENV_ON", "on"),
            ("HUDDLE_TEST_ENV_UPPER", "TRUE"),
        ] {
            std::env::set_var(name, value);
            assert!(env_bool(name, false), "{value} should be true");
        }
    }

    #[test]
    fn test_env_bool_false_values() {
        for (name, value) in [
            ("HUDDLE_TEST_ENV_FALSE", "false"),
            ("HUDDLE_TEST_ENV_0", "0"),
            ("HUDDLE_TEST_ENV_GARBAGE", "maybe"),
        ] {
            std::env::set_var(name, value);
            assert!(!env_bool(name, true), "{value} should be false");
        }
    }

    #[test]
    fn test_env_bool_missing_uses_default() {
        assert!(env_bool("HUDDLE_DEFINITELY_NOT_SET_12345", true));
        assert!(!env_bool("HUDDLE_DEFINITELY_NOT_SET_12345", false));
    }

    #[test]
    fn test_env_bool_whitespace_handling() {
        std::env::set_var("HUDDLE_TEST_ENV_SPACES", "  on\t");
        assert!(env_bool("HUDDLE_TEST_ENV_SPACES", false));
    }
}
