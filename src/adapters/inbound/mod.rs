//! Inbound adapters translate external stimuli (HTTP) into application commands.

pub mod server;
