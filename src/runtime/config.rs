//! Runtime configuration, resolvable from the environment.

use tracing::debug;

/// How often the runner snapshots an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutosavePolicy {
    /// Never snapshot automatically; terminal states are still flushed.
    Disabled,
    /// Snapshot after every `n` macrosteps.
    EveryMacrosteps(u32),
}

impl AutosavePolicy {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "disabled" | "0" => Self::Disabled,
            other => other
                .parse::<u32>()
                .map_or(Self::EveryMacrosteps(1), Self::EveryMacrosteps),
        }
    }
}

/// Configuration for a [`ChartRunner`](crate::runtime::ChartRunner).
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Snapshot cadence. Defaults to every macrostep.
    pub autosave: AutosavePolicy,
    /// Database URL for the SQLite snapshot store, when the `sqlite` feature
    /// is enabled.
    pub database_url: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            autosave: AutosavePolicy::EveryMacrosteps(1),
            database_url: None,
        }
    }
}

impl RuntimeConfig {
    /// Resolve configuration from the environment, loading `.env` first if
    /// present.
    ///
    /// Recognized variables: `HARELITE_AUTOSAVE` (`off` or a macrostep
    /// interval, default `1`) and `HARELITE_DB_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let autosave = std::env::var("HARELITE_AUTOSAVE")
            .map(|raw| AutosavePolicy::parse(&raw))
            .unwrap_or(AutosavePolicy::EveryMacrosteps(1));
        let database_url = std::env::var("HARELITE_DB_URL").ok();
        debug!(?autosave, database_url = database_url.as_deref(), "runtime config resolved");
        Self {
            autosave,
            database_url,
        }
    }
}
