pub mod clock;
pub mod http;
pub mod local;
pub mod memory;
pub mod persistence;
pub mod telemetry;
