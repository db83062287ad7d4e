//! Environment-driven configuration for kiln.
//!
//! Every option is reachable from the environment and has a documented
//! default; there is no config file and no shared mutable singleton.
//! [`Config::from_env`] is read once at an entry point and the resulting
//! record is captured by value into long-lived objects (the compute lock,
//! the reconciler). Tests override via [`Config::from_env_with`], a
//! context-scoped lookup function, rather than mutating process environment
//! state that other tests might observe.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Which classes' cached success is invalidated on every access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlwaysRerun {
    None,
    All,
    Named(BTreeSet<String>),
}

impl AlwaysRerun {
    pub fn matches(&self, class_name: &str) -> bool {
        match self {
            AlwaysRerun::None => false,
            AlwaysRerun::All => true,
            AlwaysRerun::Named(set) => set.contains(class_name),
        }
    }
}

/// Central configuration for kiln behavior, assembled once from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Parent directory of artifact roots.
    pub base_root: PathBuf,
    /// Alternate root for artifacts intended to be tracked in VCS, if set.
    pub vcs_root: Option<PathBuf>,
    /// Default `lease_duration_sec` for new attempts.
    pub lease_duration: Duration,
    /// Default heartbeat period; must be strictly less than `lease_duration`.
    pub heartbeat_interval: Duration,
    /// Sleep between wait-loop iterations.
    pub poll_interval: Duration,
    /// Ceiling for waits on the compute lock and dependencies.
    pub max_wait: Duration,
    /// Threshold for declaring an in-doubt lock stale when timestamps are missing.
    pub stale_timeout: Duration,
    /// When true, `result = failed` is not sticky: a new run may proceed.
    pub retry_failed: bool,
    /// Remap remote `cancelled` verdicts to `preempted` during classification.
    pub cancelled_is_preempted: bool,
    /// Class-qualified names whose cached success is invalidated on access.
    pub always_rerun: AlwaysRerun,
    /// Whether to collect a git snapshot into `metadata.json`.
    pub record_git: bool,
    /// Whether a missing `origin` remote is tolerated rather than surfaced.
    pub allow_missing_remote: bool,
}

impl Config {
    /// Build a [`Config`] from the process environment, applying documented defaults.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build a [`Config`] from an arbitrary lookup function, for tests that
    /// want isolated environment overrides without mutating process state.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base_root = lookup("KILN_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data-kiln"));

        let vcs_root = lookup("KILN_VCS_PATH").map(PathBuf::from);

        let lease_duration = parse_secs(&lookup, "KILN_LEASE_DURATION_SECS", 300.0);
        let heartbeat_interval = parse_secs(&lookup, "KILN_HEARTBEAT_INTERVAL_SECS", 100.0);
        let poll_interval = parse_secs(&lookup, "KILN_POLL_INTERVAL_SECS", 10.0);
        let max_wait = parse_secs(&lookup, "KILN_MAX_WAIT_SECS", 3600.0);
        let stale_timeout = parse_secs(&lookup, "KILN_STALE_AFTER_SECS", 30.0 * 60.0);

        let retry_failed = parse_bool(&lookup, "KILN_RETRY_FAILED", false);
        let cancelled_is_preempted = parse_bool(&lookup, "KILN_CANCELLED_IS_PREEMPTED", false);
        let record_git = parse_bool(&lookup, "KILN_RECORD_GIT", true);
        let allow_missing_remote = parse_bool(&lookup, "KILN_ALLOW_MISSING_REMOTE", true);

        let always_rerun = match lookup("KILN_ALWAYS_RERUN") {
            None => AlwaysRerun::None,
            Some(s) if s.trim().eq_ignore_ascii_case("all") => AlwaysRerun::All,
            Some(s) => AlwaysRerun::Named(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        };

        Self {
            base_root,
            vcs_root,
            lease_duration,
            heartbeat_interval,
            poll_interval,
            max_wait,
            stale_timeout,
            retry_failed,
            cancelled_is_preempted,
            always_rerun,
            record_git,
            allow_missing_remote,
        }
    }

    /// Root directory for storage; `version_controlled` selects the VCS override if set.
    pub fn root(&self, version_controlled: bool) -> PathBuf {
        if version_controlled {
            self.vcs_root.clone().unwrap_or_else(|| self.base_root.join("git"))
        } else {
            self.base_root.join("data")
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env_with(|_| None)
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> Duration {
    let secs = lookup(key)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .unwrap_or(default);
    Duration::from_secs_f64(secs)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_env_with(|_| None);
        assert_eq!(config.base_root, PathBuf::from("data-kiln"));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.stale_timeout, Duration::from_secs(1800));
        assert!(!config.retry_failed);
        assert!(!config.cancelled_is_preempted);
        assert_eq!(config.always_rerun, AlwaysRerun::None);
    }

    #[test]
    fn heartbeat_interval_is_strictly_less_than_lease_by_default() {
        let config = Config::default();
        assert!(config.heartbeat_interval < config.lease_duration);
    }

    #[test]
    fn always_rerun_all_matches_everything() {
        let config = Config::from_env_with(env_from(&[("KILN_ALWAYS_RERUN", "all")]));
        assert!(config.always_rerun.matches("anything.AtAll"));
    }

    #[test]
    fn always_rerun_named_set_matches_only_named() {
        let config = Config::from_env_with(env_from(&[("KILN_ALWAYS_RERUN", "foo.Bar, baz.Qux")]));
        assert!(config.always_rerun.matches("foo.Bar"));
        assert!(config.always_rerun.matches("baz.Qux"));
        assert!(!config.always_rerun.matches("other.Thing"));
    }

    #[test]
    fn boolean_env_vars_accept_common_truthy_spellings() {
        for value in ["1", "true", "TRUE", "yes"] {
            let config = Config::from_env_with(env_from(&[("KILN_RETRY_FAILED", value)]));
            assert!(config.retry_failed, "{value} should be truthy");
        }
        let config = Config::from_env_with(env_from(&[("KILN_RETRY_FAILED", "0")]));
        assert!(!config.retry_failed);
    }

    #[test]
    fn vcs_root_override_takes_precedence_over_base_root_join() {
        let config = Config::from_env_with(env_from(&[
            ("KILN_PATH", "/data"),
            ("KILN_VCS_PATH", "/tracked"),
        ]));
        assert_eq!(config.root(true), PathBuf::from("/tracked"));
        assert_eq!(config.root(false), PathBuf::from("/data/data"));
    }

    #[test]
    fn vcs_root_defaults_to_base_root_slash_git() {
        let config = Config::from_env_with(env_from(&[("KILN_PATH", "/data")]));
        assert_eq!(config.root(true), PathBuf::from("/data/git"));
    }
}
