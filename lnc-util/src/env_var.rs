use std::env;

/// Compare environment variable to a value
pub fn compare_env_var(key: &str, value: &str) -> bool {
    match env::var(key) {
        Ok(val) => val == value,
        Err(_) => false,
    }
}

/// `LNC_WATCHER_DISABLE=1` turns the chain watcher off
pub fn watcher_disabled() -> bool {
    compare_env_var("LNC_WATCHER_DISABLE", "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_env_var_test() {
        env::set_var("LNC_UTIL_TEST_VAR", "1");
        assert!(compare_env_var("LNC_UTIL_TEST_VAR", "1"));
        assert!(!compare_env_var("LNC_UTIL_TEST_VAR", "0"));
        assert!(!compare_env_var("LNC_UTIL_TEST_UNSET", "1"));
    }
}
