//! Ripple Core
//!
//! A fine-grained reactive engine: containers wrapped in observable views
//! record which effects read which members, and writes re-run exactly the
//! effects that depend on the changed members.
//!
//! - **Observable Wrapper Layer**: tracked, read-only and shallow views over
//!   records, sequences, maps and sets, plus reference cells
//! - **Dependency Graph**: `(target, key) → effects` bookkeeping
//! - **Effect Runner**: re-runnable computations with dynamic dependencies
//! - **Job Scheduler**: deduplicated pre, main and post phases per flush
//! - **Watch Binding**: source/callback watchers on top of the above
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{EffectOptions, Runtime, Value};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let rt = Runtime::new();
//! let state = rt.reactive_record([("count", Value::from(0))]);
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let reader = state.clone();
//! let log = seen.clone();
//! rt.effect(
//!     move |_| {
//!         log.borrow_mut().push(reader.get("count"));
//!         Ok(())
//!     },
//!     EffectOptions::default(),
//! );
//!
//! state.set("count", 1);
//! assert_eq!(*seen.borrow(), vec![Value::from(0), Value::from(1)]);
//! ```

pub mod config;
pub mod dep;
pub mod effect;
pub mod error;
pub mod observable;
pub mod reference;
pub mod runtime;
pub mod scheduler;
pub mod target;
pub mod value;
pub mod watch;

pub use config::RuntimeConfig;
pub use dep::{DebugOp, DebuggerEvent, DepKey, TrackOp, TriggerOp};
pub use effect::{Computation, DebuggerHook, Effect, EffectId, EffectOptions, EffectScheduler, StopHook};
pub use error::{ErrorContext, ReactiveError, Result};
pub use observable::{
    is_observable, is_reactive, is_readonly, mark_raw, to_raw, Observable, WrapMode, MAX_SEQUENCE_LEN,
};
pub use reference::Ref;
pub use runtime::{ErrorHandler, FlushHook, ReactiveStats, Runtime, WeakRuntime};
pub use scheduler::{FlushRequest, Job, NextTick, RecursionPolicy};
pub use target::{Container, ContainerKind, Target, TargetId, WeakTarget};
pub use value::{has_changed, same_value_zero, Key, MapKey, Value};
pub use watch::{traverse, FlushTiming, Getter, OnCleanup, Owner, WatchHandle, WatchOptions, WatchSource};
