//! `deferral-dispatch`: background dispatch of deferred work.
//!
//! ## Components
//!
//! - `WorkQueue`: non-blocking hand-off from request handlers to the worker
//! - `AdmissionGate`: one-shot shared/exclusive gate closing admissions at shutdown
//! - `InFlightRegistry`: tracks running executions so shutdown can drain them
//! - `Executor`: applies the item delay and performs the delivery
//! - `DispatchWorker`: the dequeue → admit → spawn loop
//! - `DispatchService`: hosted-service facade (`start` / `stop`)
//!
//! ## Shutdown
//!
//! Shutdown closes the gate, waits for in-flight executions within the same
//! budget, then cancels the worker loop. Executions still running at the
//! deadline are abandoned, never aborted.

pub mod config;
pub mod executor;
pub mod gate;
pub mod queue;
pub mod registry;
pub mod service;
pub mod worker;

pub use config::DispatchConfig;
pub use executor::{Executor, SignalDelivery};
pub use gate::{AdmissionGate, AdmissionPermit, ShutdownOutcome};
pub use queue::WorkQueue;
pub use registry::InFlightRegistry;
pub use service::DispatchService;
pub use worker::{DispatchHandle, DispatchStats, DispatchWorker, ShutdownReport, WorkerState};
