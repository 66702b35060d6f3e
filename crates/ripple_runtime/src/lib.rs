//! Ripple Embedding SDK
//!
//! Host the reactive core in an application: re-exports `ripple_core`,
//! drives deferred flushes from a tokio [`LocalSet`](tokio::task::LocalSet)
//! and sets up logging.
//!
//! ```ignore
//! let local = tokio::task::LocalSet::new();
//! local
//!     .run_until(async {
//!         ripple_runtime::init_tracing();
//!         let rt = ripple_runtime::init(RuntimeConfig::default());
//!         let count = rt.ref_cell(0);
//!         rt.watch(count.clone(), |_, new, old, _| {
//!             tracing::info!(?new, ?old, "count changed");
//!             Ok(())
//!         }, WatchOptions::default());
//!         count.set(1); // flushed by the LocalSet on its next turn
//!         ripple_runtime::settle(&rt).await
//!     })
//!     .await?;
//! ```

use anyhow::Context;

pub use ripple_core;
pub use ripple_core::{
    EffectOptions, FlushTiming, Observable, ReactiveError, Ref, Runtime, RuntimeConfig, Target,
    Value, WatchOptions, WatchSource,
};

/// Initialize logging from `RUST_LOG`, defaulting to `info`
///
/// Calling it again after a global subscriber is set does nothing.
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Defer flushes of `rt` to the current tokio `LocalSet`
///
/// Each coalesced flush request becomes one local task. Requests made while
/// no `LocalSet` is running panic inside tokio, so install this only from
/// code driven by `LocalSet::run_until` or `LocalSet::block_on`.
pub fn install_local_flush(rt: &Runtime) {
    rt.set_flush_hook(|request| {
        tokio::task::spawn_local(async move {
            request.run();
        });
    });
}

/// Create a runtime whose flushes run on the current `LocalSet`
pub fn init(config: RuntimeConfig) -> Runtime {
    let rt = Runtime::with_config(config);
    install_local_flush(&rt);
    tracing::debug!("reactive runtime initialized with local flush driver");
    rt
}

/// Like [`init`], reading the configuration from TOML
pub fn init_from_toml(source: &str) -> anyhow::Result<Runtime> {
    let config = RuntimeConfig::from_toml_str(source).context("invalid runtime configuration")?;
    Ok(init(config))
}

/// Let pending local tasks run, then finish any remaining flush
pub async fn settle(rt: &Runtime) -> ripple_core::Result<()> {
    tokio::task::yield_now().await;
    rt.next_tick().await
}
