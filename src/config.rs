//! Runtime configuration read from the environment.
//!
//! Values are read once, at [`Runtime::init_thread`](crate::Runtime::init_thread),
//! and are not reloaded afterwards.
//!
//! # Environment Variables
//!
//! | Field | Variable | Default |
//! |-------|----------|---------|
//! | `async_progress` | `FERROCOMM_ASYNC_PROGRESS` | `false` |
//! | `progress_thread_affinity` | `FERROCOMM_PROGRESS_THREAD_AFFINITY` | unset |
//! | `progress_cpus_per_process` | `FERROCOMM_PROGRESS_CPUS_PER_PROCESS` | `1` |
//! | `num_cliques` | `FERROCOMM_NUM_CLIQUES` | `1` |
//! | `odd_even_cliques` | `FERROCOMM_ODD_EVEN_CLIQUES` | `false` |

use std::env;

/// Enables the async progress thread.
pub const ENV_ASYNC_PROGRESS: &str = "FERROCOMM_ASYNC_PROGRESS";
/// Logical processor list for progress threads.
pub const ENV_PROGRESS_THREAD_AFFINITY: &str = "FERROCOMM_PROGRESS_THREAD_AFFINITY";
/// Processors per process in the affinity table.
pub const ENV_PROGRESS_CPUS_PER_PROCESS: &str = "FERROCOMM_PROGRESS_CPUS_PER_PROCESS";
/// Number of virtual nodes per physical node.
pub const ENV_NUM_CLIQUES: &str = "FERROCOMM_NUM_CLIQUES";
/// Odd/even two-clique partition.
pub const ENV_ODD_EVEN_CLIQUES: &str = "FERROCOMM_ODD_EVEN_CLIQUES";

/// Process-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Start a background thread that drives progress.
    pub async_progress: bool,
    /// Comma/whitespace separated logical processors for progress threads.
    ///
    /// The table is laid out per node: the first `progress_cpus_per_process`
    /// entries belong to the first local process, the next ones to the second,
    /// and so on.
    pub progress_thread_affinity: Option<String>,
    /// Processors each process's progress thread is bound to.
    pub progress_cpus_per_process: usize,
    /// Partition every node into this many virtual nodes.
    pub num_cliques: usize,
    /// Partition every node into two virtual nodes by rank parity.
    pub odd_even_cliques: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            async_progress: false,
            progress_thread_affinity: None,
            progress_cpus_per_process: 1,
            num_cliques: 1,
            odd_even_cliques: false,
        }
    }
}

impl RuntimeConfig {
    /// Read the configuration from `FERROCOMM_*` environment variables.
    ///
    /// Unparsable values are reported with a warning and replaced by the
    /// default; they never fail initialization.
    pub fn from_env() -> Self {
        let defaults = RuntimeConfig::default();
        RuntimeConfig {
            async_progress: env_bool(ENV_ASYNC_PROGRESS).unwrap_or(defaults.async_progress),
            progress_thread_affinity: env::var(ENV_PROGRESS_THREAD_AFFINITY)
                .ok()
                .filter(|s| !s.trim().is_empty()),
            progress_cpus_per_process: env_usize(ENV_PROGRESS_CPUS_PER_PROCESS)
                .filter(|&n| n >= 1)
                .unwrap_or(defaults.progress_cpus_per_process),
            num_cliques: env_usize(ENV_NUM_CLIQUES)
                .filter(|&n| n >= 1)
                .unwrap_or(defaults.num_cliques),
            odd_even_cliques: env_bool(ENV_ODD_EVEN_CLIQUES).unwrap_or(defaults.odd_even_cliques),
        }
    }

    /// Number of virtual nodes each physical node is split into.
    pub fn effective_cliques(&self) -> usize {
        if self.num_cliques > 1 {
            self.num_cliques
        } else if self.odd_even_cliques {
            2
        } else {
            1
        }
    }

    /// Whether the user supplied an explicit affinity list.
    pub fn has_explicit_affinity(&self) -> bool {
        self.progress_thread_affinity
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }
}

/// Parse a boolean flag value.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    let parsed = parse_bool(&raw);
    if parsed.is_none() {
        tracing::warn!(variable = name, value = %raw, "ignoring unparsable boolean");
    }
    parsed
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(variable = name, value = %raw, "ignoring unparsable integer");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" on "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }

    #[test]
    fn effective_cliques_prefers_explicit_count() {
        let mut cfg = RuntimeConfig {
            odd_even_cliques: true,
            ..RuntimeConfig::default()
        };
        assert_eq!(cfg.effective_cliques(), 2);
        cfg.num_cliques = 4;
        assert_eq!(cfg.effective_cliques(), 4);
        cfg.num_cliques = 1;
        cfg.odd_even_cliques = false;
        assert_eq!(cfg.effective_cliques(), 1);
    }

    /// Tests that mutate environment variables are combined into a single test
    /// to avoid data races when tests run in parallel.
    #[test]
    fn env_var_parsing() {
        unsafe {
            env::set_var(ENV_ASYNC_PROGRESS, "yes");
            env::set_var(ENV_PROGRESS_THREAD_AFFINITY, "0,1 2");
            env::set_var(ENV_PROGRESS_CPUS_PER_PROCESS, "2");
            env::set_var(ENV_NUM_CLIQUES, "garbage");
            env::remove_var(ENV_ODD_EVEN_CLIQUES);
        }
        let cfg = RuntimeConfig::from_env();
        assert!(cfg.async_progress);
        assert_eq!(cfg.progress_thread_affinity.as_deref(), Some("0,1 2"));
        assert!(cfg.has_explicit_affinity());
        assert_eq!(cfg.progress_cpus_per_process, 2);
        assert_eq!(cfg.num_cliques, 1);
        assert!(!cfg.odd_even_cliques);

        unsafe {
            env::set_var(ENV_PROGRESS_THREAD_AFFINITY, "   ");
            env::set_var(ENV_PROGRESS_CPUS_PER_PROCESS, "0");
        }
        let cfg = RuntimeConfig::from_env();
        assert_eq!(cfg.progress_thread_affinity, None);
        assert_eq!(cfg.progress_cpus_per_process, 1);

        unsafe {
            env::remove_var(ENV_ASYNC_PROGRESS);
            env::remove_var(ENV_PROGRESS_THREAD_AFFINITY);
            env::remove_var(ENV_PROGRESS_CPUS_PER_PROCESS);
            env::remove_var(ENV_NUM_CLIQUES);
        }
        assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());
    }
}
