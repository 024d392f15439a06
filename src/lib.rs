//! Single-broker MQTT relay
//!
//! Many users share one broker connection. Each user subscribes, publishes and
//! receives broker messages through text directives, with subscription sets kept
//! apart per user.

pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod mqtt;
pub mod registry;
pub mod relay;

pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::Relay;

#[cfg(test)]
mod testing;
