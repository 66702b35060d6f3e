//! Reactive runtime error types

use std::fmt;

use thiserror::Error;

/// Where a user computation failed
///
/// Passed to the runtime's error handler alongside the error so the host can
/// tell a failing watch callback apart from a failing scheduler job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorContext {
    /// The body of a reactive effect
    EffectRun,
    /// The `on_stop` hook of an effect
    StopHook,
    /// A watch source getter
    WatchGetter,
    /// A watch callback or `watch_effect` body
    WatchCallback,
    /// A cleanup registered through `OnCleanup`
    WatchCleanup,
    /// A job executed during a scheduler flush
    SchedulerFlush,
    /// A callback registered with `next_tick_then`
    NextTick,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EffectRun => "effect run",
            Self::StopHook => "effect stop hook",
            Self::WatchGetter => "watcher getter",
            Self::WatchCallback => "watcher callback",
            Self::WatchCleanup => "watcher cleanup function",
            Self::SchedulerFlush => "scheduler flush",
            Self::NextTick => "next tick callback",
        };
        f.write_str(name)
    }
}

/// Reactive runtime errors
#[derive(Error, Debug)]
pub enum ReactiveError {
    /// A job or effect re-triggered itself past the configured ceiling
    #[error(
        "Maximum recursive updates exceeded ({limit}) for {job}: a reactive effect is mutating \
         its own dependencies and thus recursively triggering itself"
    )]
    RecursionLimit {
        /// Configured ceiling
        limit: u32,
        /// Description of the offending job
        job: String,
    },

    /// A user computation returned an error
    #[error("Unhandled error during execution of {context}: {source}")]
    Computation {
        /// Where the computation was invoked from
        context: ErrorContext,
        /// The error returned by the computation
        #[source]
        source: anyhow::Error,
    },

    /// Configuration could not be parsed
    #[error("Invalid runtime configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl ReactiveError {
    pub(crate) fn computation(context: ErrorContext, source: anyhow::Error) -> Self {
        Self::Computation { context, source }
    }

    /// Where the failing computation was invoked from, if it was one
    pub fn context(&self) -> Option<ErrorContext> {
        match self {
            Self::Computation { context, .. } => Some(*context),
            _ => None,
        }
    }

    /// Whether this error aborts a flush rather than being isolated to one job
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RecursionLimit { .. })
    }
}

/// Result type for reactive runtime operations
pub type Result<T> = std::result::Result<T, ReactiveError>;
