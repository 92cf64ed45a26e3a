//! Garbage-collector tuning, loadable from `ember.toml` or environment
//! variables (SPEC_FULL.md §11.3). Mirrors
//! `examples/navicore-cem3/crates/compiler/src/lint.rs`'s
//! `LintConfig::from_toml` shape: a `serde::Deserialize` struct parsed with
//! `toml::from_str` and mapped to a `String` error, rather than a
//! `thiserror` enum.
//!
//! `ember-runtime` only deserializes the struct; reading `ember.toml` off
//! disk and applying `--config` is `ember-cli`'s job.

use serde::Deserialize;

fn default_stress_gc() -> bool {
    false
}

fn default_gc_initial_threshold_bytes() -> usize {
    1024 * 1024
}

/// The two knobs the original source exposed as compile-time `#define`s in
/// `common.h`: whether the collector runs on every allocation, and the
/// byte threshold the first cycle triggers at.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_stress_gc")]
    pub stress_gc: bool,
    #[serde(default = "default_gc_initial_threshold_bytes")]
    pub gc_initial_threshold_bytes: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            stress_gc: default_stress_gc(),
            gc_initial_threshold_bytes: default_gc_initial_threshold_bytes(),
        }
    }
}

impl GcConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        toml::from_str(toml_str).map_err(|e| format!("Failed to parse ember.toml: {e}"))
    }

    /// Applies `EMBER_STRESS_GC`/`EMBER_GC_THRESHOLD` overrides on top of
    /// whatever `ember.toml` (or the defaults) produced, env vars winning
    /// since they're the thing a user reaches for without editing a file.
    pub fn apply_env(mut self, vars: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = vars("EMBER_STRESS_GC") {
            self.stress_gc = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = vars("EMBER_GC_THRESHOLD") {
            if let Ok(bytes) = v.parse::<usize>() {
                self.gc_initial_threshold_bytes = bytes;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = GcConfig::default();
        assert!(!cfg.stress_gc);
        assert_eq!(cfg.gc_initial_threshold_bytes, 1024 * 1024);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = GcConfig::from_toml("stress_gc = true\n").unwrap();
        assert!(cfg.stress_gc);
        assert_eq!(cfg.gc_initial_threshold_bytes, 1024 * 1024);
    }

    #[test]
    fn env_overrides_win() {
        let cfg = GcConfig::default().apply_env(|k| match k {
            "EMBER_STRESS_GC" => Some("1".to_string()),
            "EMBER_GC_THRESHOLD" => Some("4096".to_string()),
            _ => None,
        });
        assert!(cfg.stress_gc);
        assert_eq!(cfg.gc_initial_threshold_bytes, 4096);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(GcConfig::from_toml("stress_gc = \"not a bool\"").is_err());
    }
}
