//! # harelite
//!
//! A hierarchical statechart interpreter runtime: nested and parallel
//! states, guarded transitions, history, invoked services, structured event
//! exchange, and durable, resumable execution state.
//!
//! The crate is the execution engine of a workflow platform. Statechart
//! documents are compiled elsewhere; here a [`model::StateChart`] is built
//! through [`model::ChartBuilder`], interpreted with precise
//! run-to-completion semantics by [`interpreter::Interpreter`], and hosted
//! for many concurrent instances by [`runtime::ChartRunner`], which also
//! persists every instance through [`persistence::SnapshotStore`].
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use harelite::capability::CapabilityRegistry;
//! use harelite::datamodel::DataModelValue;
//! use harelite::event::EventObject;
//! use harelite::model::{ChartBuilder, Transition};
//! use harelite::persistence::InMemorySnapshotStore;
//! use harelite::runtime::{ChartRunner, RuntimeConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let chart = Arc::new(
//!     ChartBuilder::new("greeter")
//!         .atomic("idle")
//!         .final_state("done")
//!         .transition("idle", Transition::on("greet").to("done"))
//!         .initial("idle")
//!         .build()?,
//! );
//!
//! let runner = ChartRunner::new(
//!     chart,
//!     Arc::new(CapabilityRegistry::default()),
//!     Arc::new(InMemorySnapshotStore::default()),
//!     RuntimeConfig::default(),
//! );
//!
//! let init = runner.create_instance(Some("greeter-1")).await?;
//! runner.start_instance(init.instance_id(), DataModelValue::Undefined).await?;
//! runner.send_event(init.instance_id(), EventObject::named("greet")).await?;
//!
//! let completion = runner.completion(init.instance_id()).await?;
//! assert!(completion.is_some_and(|c| c.is_completed()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`model`]: immutable compiled chart with a flat state arena,
//!   transitions, invokes, done-data, plus the validating builder.
//! - [`datamodel`]: the value union and the dotted-path data store.
//! - [`event`]: event objects and descriptor pattern matching.
//! - [`context`]: per-instance mutable state; every mutation is written to
//!   the transaction log before it takes effect.
//! - [`capability`]: pluggable expression evaluators and service
//!   factories, resolved by string discriminator.
//! - [`interpreter`]: the synchronous macrostep/microstep engine.
//! - [`invoke`]: invoked-service lifecycle from start and forwarding
//!   through cancellation and completion delivery.
//! - [`persistence`]: transaction log, snapshots, and snapshot stores
//!   (in-memory; SQLite behind the `sqlite` feature).
//! - [`runtime`]: the multi-instance runner and its configuration.
//! - [`telemetry`]: optional tracing-subscriber setup.
//! - [`types`]: shared identifier, status, and completion types.

pub mod capability;
pub mod context;
pub mod datamodel;
pub mod event;
pub mod interpreter;
pub mod invoke;
pub mod model;
pub mod persistence;
pub mod runtime;
pub mod telemetry;
pub mod types;
