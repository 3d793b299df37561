//! The CLI-facing configuration surface, §3.1/§6.1.
//!
//! `Config` is plain data assembled from parsed command-line arguments; it
//! owns no I/O handles itself, so it can be constructed and inspected in
//! tests without touching a socket or the filesystem.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::libs::backend::PollingBudget;

/// Default listen address, kept as a configurable default rather than the
/// teacher's hardcoded constant, §6.1.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:12727";

/// Selects which [`DmiTransport`](crate::libs::dmi::DmiTransport)
/// implementation backs a session, §4.3.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmiSelector {
    /// In-memory loopback register file; no hardware required.
    Mock,
    /// Line-oriented TCP proxy at `host:port`.
    Tcp(String),
}

impl FromStr for DmiSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("mock") {
            return Ok(DmiSelector::Mock);
        }
        match s.strip_prefix("tcp:") {
            Some(host_port) if !host_port.is_empty() => Ok(DmiSelector::Tcp(host_port.to_string())),
            _ => Err(format!(
                "expected `mock` or `tcp:HOST:PORT`, got {s:?}"
            )),
        }
    }
}

/// Parsed, validated configuration for one `rsp-stub` invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub dmi: DmiSelector,
    pub xlen: u32,
    pub elf: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub verbosity: u8,
    pub budget: PollingBudget,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: DEFAULT_LISTEN.to_string(),
            dmi: DmiSelector::Mock,
            xlen: 32,
            elf: None,
            log_file: None,
            verbosity: 0,
            budget: PollingBudget::default(),
        }
    }
}

impl Config {
    /// Builds a [`PollingBudget`], overriding the §4.3 defaults only where
    /// the caller supplied an explicit value.
    pub fn polling_budget(
        busy_poll_sleep_us: Option<u64>,
        busy_poll_deadline_iters: Option<u32>,
        resume_settle_delay_us: Option<u64>,
    ) -> PollingBudget {
        let default = PollingBudget::default();
        PollingBudget {
            busy_poll_sleep: busy_poll_sleep_us
                .map(Duration::from_micros)
                .unwrap_or(default.busy_poll_sleep),
            busy_poll_deadline_iters: busy_poll_deadline_iters
                .unwrap_or(default.busy_poll_deadline_iters),
            resume_settle_delay: resume_settle_delay_us
                .map(Duration::from_micros)
                .unwrap_or(default.resume_settle_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmi_selector_parses_mock_and_tcp() {
        assert_eq!("mock".parse::<DmiSelector>().unwrap(), DmiSelector::Mock);
        assert_eq!(
            "tcp:localhost:9000".parse::<DmiSelector>().unwrap(),
            DmiSelector::Tcp("localhost:9000".to_string())
        );
        assert!("garbage".parse::<DmiSelector>().is_err());
        assert!("tcp:".parse::<DmiSelector>().is_err());
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.listen, "127.0.0.1:12727");
        assert_eq!(cfg.xlen, 32);
        assert_eq!(cfg.budget.busy_poll_deadline_iters, 1_000_000);
    }
}
