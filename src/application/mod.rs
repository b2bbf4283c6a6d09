pub mod activities;
pub mod dispatcher;
pub mod engine;
pub mod expenses;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Engine, EngineOptions, RetryPolicy};
pub use runtime::{ExpenseRuntime, RuntimeParts};
pub use service::ExpenseApp;
pub use workflow::StepTimeouts;
