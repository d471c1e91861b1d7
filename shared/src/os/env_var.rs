use mockall::{automock, predicate::*};
use std::{env, env::VarError};

/// This provides a mockable way to query env vars, so configuration can
/// be exercised in tests without mutating process state.
#[automock]
pub trait EnvVarQuery: Send + Sync {
    fn get_env_var(&self, name: &'static str) -> Result<String, VarError>;
}

pub struct ActualEnvVarQuery;

impl EnvVarQuery for ActualEnvVarQuery {
    fn get_env_var(&self, name: &'static str) -> Result<String, VarError> {
        env::var(name)
    }
}

/// Read a boolean flag; unset or unparseable values are false. `1`,
/// `true`, `yes` and `on` (any case) are true.
pub fn env_flag(env: &dyn EnvVarQuery, name: &'static str) -> bool {
    match env.get_env_var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Read a variable with a default.
pub fn env_or(env: &dyn EnvVarQuery, name: &'static str, default: &str) -> String {
    env.get_env_var(name)
        .unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_flag_accepts_truthy_spellings() {
        for value in ["1", "true", "TRUE", "yes", "On"] {
            let mut mock = MockEnvVarQuery::new();
            mock.expect_get_env_var()
                .returning(move |_| Ok(value.to_string()));
            assert!(env_flag(&mock, "KECS_CONTAINER_MODE"), "{}", value);
        }
    }

    #[test]
    fn test_env_flag_unset_is_false() {
        let mut mock = MockEnvVarQuery::new();
        mock.expect_get_env_var()
            .returning(|_| Err(VarError::NotPresent));
        assert!(!env_flag(&mock, "KECS_CONTAINER_MODE"));
    }

    #[test]
    fn test_env_or_falls_back() {
        let mut mock = MockEnvVarQuery::new();
        mock.expect_get_env_var()
            .returning(|_| Err(VarError::NotPresent));
        assert_eq!(
            "172.17.0.1",
            env_or(&mock, "KECS_HOST_GATEWAY_ADDRESS", "172.17.0.1")
        );
    }
}
