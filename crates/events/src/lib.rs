//! Event system for the autopilot execution core
//!
//! This crate provides the event bus and event types that carry run,
//! worker and escalation updates to dashboards and notification channels.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
