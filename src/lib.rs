//! Library crate for blockprobe-rs: probe workers, verdict classification and
//! the passive capture sink.
pub mod classify;
pub mod config;
pub mod doh;
pub mod listener;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod recorder;
pub mod sink;
pub mod targets;
pub mod tcp_probe;
pub mod tls;
pub mod types;
