//! Trellis Core
//!
//! This crate provides a fine-grained reactive engine: plain objects whose
//! property reads are tracked and whose writes re-run exactly the
//! computations that read them.
//!
//! It implements:
//!
//! - Per-object dependency registries with batched, deduplicated flushes
//! - A reaction executor that records dependencies while a reaction runs
//! - Cached derived values with structural change detection
//! - Effects and transactions
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: registries, reactions, stores, derived values, effects
//! - `value`: the dynamic [`Value`] held by store properties
//! - `equality`: the depth-bounded structural [`Comparator`]
//! - `config`: [`RuntimeConfig`]
//! - `error`: [`ReactiveError`]
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Effect, Runtime, Store, Value};
//!
//! let runtime = Runtime::new();
//! let count = Store::new(&runtime, "count");
//! count.set("value", 0).unwrap();
//!
//! // Create a derived value
//! let source = count.clone();
//! count.derive("doubled", move || {
//!     Ok(Value::from(source.get("value")?.as_int().unwrap_or(0) * 2))
//! });
//!
//! // Create an effect
//! let view = count.clone();
//! Effect::new(&runtime, move || {
//!     let (value, doubled) = (view.get("value")?, view.get("doubled")?);
//!     println!("Count: {}, Doubled: {}", value.to_json(), doubled.to_json());
//!     Ok(())
//! })
//! .unwrap();
//!
//! // Update the store, then let the runtime flush
//! count.set("value", 5).unwrap();
//! runtime.run_until_idle().unwrap();
//! // Prints: "Count: 5, Doubled: 10"
//! ```

pub mod config;
pub mod equality;
pub mod error;
pub mod reactive;
pub mod value;

pub use config::RuntimeConfig;
pub use equality::Comparator;
pub use error::{ReactiveError, Result};
pub use reactive::{
    Changes, DerivedState, DerivedValue, Effect, Execution, Interceptor, ReactionId, ReactionKind,
    Registry, RegistryId, Runtime, Store, Subscription, Trigger,
};
pub use value::Value;
