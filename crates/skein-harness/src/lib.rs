//! Simulated external systems and scenarios for skein.
//!
//! Simulators stand in for the systems production code talks to. They hold
//! their state explicitly, shared by reference among the operations that
//! use them, and expose their own asynchrony to the engine by suspending at
//! scheduling points around every request.
//!
//! # Scenarios
//!
//! The [`scenario`] module holds small programs with known answers, used by
//! the integration tests and by the `skein` command-line driver:
//!
//! - create/create race on a keyed store, buggy and fixed
//! - read-modify-write on a shared counter, unguarded and locked
//! - lock-order inversion
//! - retry after an injected lost acknowledgement

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod scenario;
pub mod store;

pub use scenario::{Registration, Scenario, UnknownScenario, register_atomic, register_checked};
pub use store::{ChaoticStore, ETag, Row, SimStore, Store, StoreError};
