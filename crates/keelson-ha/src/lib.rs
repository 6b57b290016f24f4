// ABOUTME: High availability for keelson management nodes: election rule, manager, and node configuration.
// ABOUTME: The manager drives promotion and demotion through the rebind layer's Rebinder seam.

pub mod config;
pub mod election;
pub mod manager;

pub use config::{ConfigError, HaConfig};
pub use election::{Election, elect};
pub use manager::{
    DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_POLL_PERIOD, HaError, HighAvailabilityManager,
    PromotionListener, Rebinder,
};
