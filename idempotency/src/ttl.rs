//! Processing and done TTLs.
//!
//! The processing TTL bounds how long a crashed worker can hold a key; the
//! done TTL is the window in which a retry gets the stored response back.

use std::sync::OnceLock;
use std::time::Duration;

pub const PROCESSING_TTL_ENV: &str = "IDEM_PROCESSING_TTL_MS";
pub const DONE_TTL_ENV: &str = "IDEM_DONE_TTL_MS";

pub const DEFAULT_PROCESSING_TTL_MS: u64 = 30_000;
pub const DEFAULT_DONE_TTL_MS: u64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttls {
    pub processing: Duration,
    pub done: Duration,
}

impl Default for Ttls {
    fn default() -> Self {
        Ttls {
            processing: Duration::from_millis(DEFAULT_PROCESSING_TTL_MS),
            done: Duration::from_millis(DEFAULT_DONE_TTL_MS),
        }
    }
}

impl Ttls {
    /// Process-wide TTLs, read from the environment on first use.
    pub fn global() -> Ttls {
        static TTLS: OnceLock<Ttls> = OnceLock::new();
        *TTLS.get_or_init(Ttls::from_env)
    }

    pub fn from_env() -> Ttls {
        Ttls::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolves both TTLs through `lookup`. Unset or empty variables use the
    /// default silently; anything that is not a positive integer logs a
    /// warning and uses the default.
    pub fn from_lookup<F>(lookup: F) -> Ttls
    where
        F: Fn(&str) -> Option<String>,
    {
        Ttls {
            processing: resolve(&lookup, PROCESSING_TTL_ENV, DEFAULT_PROCESSING_TTL_MS),
            done: resolve(&lookup, DONE_TTL_ENV, DEFAULT_DONE_TTL_MS),
        }
    }

    /// Replaces either TTL with an explicitly configured value.
    pub fn with_overrides(self, processing_ms: Option<u64>, done_ms: Option<u64>) -> Ttls {
        Ttls {
            processing: processing_ms.map_or(self.processing, Duration::from_millis),
            done: done_ms.map_or(self.done, Duration::from_millis),
        }
    }
}

fn resolve<F>(lookup: &F, name: &str, default_ms: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let millis = match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => ms,
            _ => {
                tracing::warn!(
                    variable = name,
                    value = %raw,
                    default_ms,
                    "invalid TTL, falling back to default"
                );
                default_ms
            }
        },
        _ => default_ms,
    };
    Duration::from_millis(millis)
}
