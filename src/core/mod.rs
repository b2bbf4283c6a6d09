pub mod domain;
pub mod error;
pub mod marker;
pub mod ports;

pub use domain::*;
pub use error::{Error, FailureKind, Result};
