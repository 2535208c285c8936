//! Tracing setup for embedding applications.
//!
//! The interpreter and runner emit structured `tracing` events and spans
//! (one span per macrostep trigger, instrumented entry points on the
//! instance API). This module wires a sensible subscriber for binaries that
//! do not bring their own.

use std::io::IsTerminal;
use tracing_subscriber::{fmt, EnvFilter};

/// Whether log output should carry ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    /// Detect TTY capability via `stderr.is_terminal()`.
    #[default]
    Auto,
    Colored,
    Plain,
}

impl ColorMode {
    /// Resolve to a concrete on/off decision.
    #[must_use]
    pub fn is_colored(self) -> bool {
        match self {
            Self::Auto => std::io::stderr().is_terminal(),
            Self::Colored => true,
            Self::Plain => false,
        }
    }
}

/// Install a global subscriber filtered by `RUST_LOG` (default `info`),
/// writing to stderr.
///
/// Returns `false` when a global subscriber was already installed, which is
/// common in tests; callers can ignore the result.
pub fn init(color: ColorMode) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(color.is_colored())
        .try_init()
        .is_ok()
}
