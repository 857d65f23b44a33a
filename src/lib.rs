//! Turbine nacelle telemetry: the edge acquisition loop and the relay that
//! serves its readings to live clients. See `main.rs` for how the roles are wired.

pub mod broker;
pub mod config;
pub mod edge;
pub mod error;
pub mod fanout;
pub mod hal;
pub mod insight;
pub mod link;
pub mod reading;
pub mod relay;
pub mod sensors;
pub mod store;
