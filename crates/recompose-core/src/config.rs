//! Tuning knobs for the composer.

use std::env;
use std::str::FromStr;

/// How far ahead of the cursor the reconciler looks for a keyed group before
/// giving up and inserting. Larger windows detect longer-distance moves at the
/// cost of more scanning per mismatch.
pub const DEFAULT_KEY_SEARCH_WINDOW: usize = 8;

/// Attempts made to apply the composition snapshot before reporting a conflict.
pub const DEFAULT_MAX_APPLY_RETRIES: usize = 3;

const KEY_SEARCH_WINDOW_VAR: &str = "RECOMPOSE_KEY_SEARCH_WINDOW";
const MAX_APPLY_RETRIES_VAR: &str = "RECOMPOSE_MAX_APPLY_RETRIES";
const DEBUG_VAR: &str = "RECOMPOSE_DEBUG";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposerConfig {
    pub key_search_window: usize,
    pub max_apply_retries: usize,
    /// Run `verify_well_formed` on the slot table after every committed pass.
    pub verify_after_write: bool,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            key_search_window: DEFAULT_KEY_SEARCH_WINDOW,
            max_apply_retries: DEFAULT_MAX_APPLY_RETRIES,
            verify_after_write: false,
        }
    }
}

impl ComposerConfig {
    /// Defaults overridden by `RECOMPOSE_KEY_SEARCH_WINDOW`,
    /// `RECOMPOSE_MAX_APPLY_RETRIES` and `RECOMPOSE_DEBUG`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            key_search_window: read_var(KEY_SEARCH_WINDOW_VAR, defaults.key_search_window),
            max_apply_retries: read_var(MAX_APPLY_RETRIES_VAR, defaults.max_apply_retries).max(1),
            verify_after_write: env::var(DEBUG_VAR).is_ok(),
        }
    }

    pub fn with_key_search_window(mut self, window: usize) -> Self {
        self.key_search_window = window;
        self
    }

    pub fn with_max_apply_retries(mut self, retries: usize) -> Self {
        self.max_apply_retries = retries.max(1);
        self
    }

    pub fn with_verify_after_write(mut self, verify: bool) -> Self {
        self.verify_after_write = verify;
        self
    }
}

fn read_var<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("ignoring {name}={raw:?}: not a valid value, using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_retries_to_one() {
        let config = ComposerConfig::default().with_max_apply_retries(0);
        assert_eq!(config.max_apply_retries, 1);
    }

    #[test]
    fn read_var_falls_back_on_garbage() {
        env::set_var("RECOMPOSE_TEST_GARBAGE_WINDOW", "not-a-number");
        assert_eq!(read_var("RECOMPOSE_TEST_GARBAGE_WINDOW", 8usize), 8);
        env::set_var("RECOMPOSE_TEST_GARBAGE_WINDOW", " 12 ");
        assert_eq!(read_var("RECOMPOSE_TEST_GARBAGE_WINDOW", 8usize), 12);
        env::remove_var("RECOMPOSE_TEST_GARBAGE_WINDOW");
    }
}
