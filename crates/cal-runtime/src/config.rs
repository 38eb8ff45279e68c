//! Runtime configuration
//!
//! Defaults reproduce the vendor runtime's native behavior: the kernel entry point is
//! `main`, waits yield the processor between polls, and the `g[]` / `i*` / `o*` register
//! naming convention decides copy direction when a binding does not state one.

use std::env;
use std::time::Duration;

/// How a waiting thread behaves between two completion polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    /// Re-poll immediately
    Spin,
    /// Yield the scheduling quantum between polls
    Yield,
    /// Sleep for a fixed interval between polls
    Sleep(Duration),
}

impl PollStrategy {
    /// Parse `spin`, `yield` or `sleep:<micros>`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "spin" => Some(Self::Spin),
            "yield" => Some(Self::Yield),
            _ => {
                let micros = value.strip_prefix("sleep:")?.parse::<u64>().ok()?;
                Some(Self::Sleep(Duration::from_micros(micros)))
            }
        }
    }

    /// Pause once between polls
    pub fn pause(self) {
        match self {
            Self::Spin => std::hint::spin_loop(),
            Self::Yield => std::thread::yield_now(),
            Self::Sleep(interval) => std::thread::sleep(interval),
        }
    }
}

/// Configuration shared by every launch issued through a runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Symbol resolved as the kernel entry point
    pub entry_point: String,
    /// Behavior between completion polls
    pub poll: PollStrategy,
    /// Pending time after which a wait starts logging warnings
    pub slow_wait_warning: Duration,
    /// Derive copy direction from register names when a binding does not give one
    pub register_conventions: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            entry_point: "main".to_string(),
            poll: PollStrategy::Yield,
            slow_wait_warning: Duration::from_secs(60),
            register_conventions: true,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from the defaults plus environment overrides
    ///
    /// # Environment Variables
    ///
    /// - `CAL_RUNTIME_ENTRY_POINT` - Kernel entry symbol (default `main`)
    /// - `CAL_RUNTIME_POLL` - `spin`, `yield` (default) or `sleep:<micros>`
    /// - `CAL_RUNTIME_SLOW_WAIT_SECS` - Seconds pending before a wait warns
    /// - `CAL_RUNTIME_REGISTER_CONVENTIONS` - `true` (default) or `false`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(entry) = env::var("CAL_RUNTIME_ENTRY_POINT") {
            if !entry.trim().is_empty() {
                config.entry_point = entry.trim().to_string();
            }
        }

        if let Ok(poll) = env::var("CAL_RUNTIME_POLL") {
            match PollStrategy::parse(&poll) {
                Some(strategy) => config.poll = strategy,
                None => tracing::warn!(value = %poll, "ignoring unrecognized CAL_RUNTIME_POLL"),
            }
        }

        if let Ok(secs) = env::var("CAL_RUNTIME_SLOW_WAIT_SECS") {
            if let Ok(secs) = secs.trim().parse::<u64>() {
                config.slow_wait_warning = Duration::from_secs(secs);
            }
        }

        if let Ok(flag) = env::var("CAL_RUNTIME_REGISTER_CONVENTIONS") {
            config.register_conventions = !(flag.eq_ignore_ascii_case("false") || flag == "0" || flag.eq_ignore_ascii_case("no"));
        }

        config
    }

    /// Set the kernel entry symbol
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Set the poll strategy
    pub fn with_poll(mut self, poll: PollStrategy) -> Self {
        self.poll = poll;
        self
    }

    /// Enable or disable the register naming convention
    pub fn with_register_conventions(mut self, enabled: bool) -> Self {
        self.register_conventions = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = [
        "CAL_RUNTIME_ENTRY_POINT",
        "CAL_RUNTIME_POLL",
        "CAL_RUNTIME_SLOW_WAIT_SECS",
        "CAL_RUNTIME_REGISTER_CONVENTIONS",
    ];

    fn reset_env() {
        for key in VARS {
            env::remove_var(key);
        }
    }

    #[test]
    fn parses_poll_strategies() {
        assert_eq!(PollStrategy::parse("spin"), Some(PollStrategy::Spin));
        assert_eq!(PollStrategy::parse(" Yield "), Some(PollStrategy::Yield));
        assert_eq!(
            PollStrategy::parse("sleep:250"),
            Some(PollStrategy::Sleep(Duration::from_micros(250)))
        );
        assert_eq!(PollStrategy::parse("sleep:"), None);
        assert_eq!(PollStrategy::parse("block"), None);
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        reset_env();
        let config = RuntimeConfig::from_env();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.entry_point, "main");
    }

    #[test]
    #[serial]
    fn environment_overrides() {
        reset_env();
        env::set_var("CAL_RUNTIME_ENTRY_POINT", "kernel_main");
        env::set_var("CAL_RUNTIME_POLL", "sleep:10");
        env::set_var("CAL_RUNTIME_SLOW_WAIT_SECS", "5");
        env::set_var("CAL_RUNTIME_REGISTER_CONVENTIONS", "false");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.entry_point, "kernel_main");
        assert_eq!(config.poll, PollStrategy::Sleep(Duration::from_micros(10)));
        assert_eq!(config.slow_wait_warning, Duration::from_secs(5));
        assert!(!config.register_conventions);

        reset_env();
    }
}
