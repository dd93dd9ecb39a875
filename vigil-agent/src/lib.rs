//! Vigil - autonomous patrol monitoring agent
//!
//! Watches a video feed for intrusions and, on detection, commands the
//! platform back to base while alerting operators on every configured
//! channel. Every decision lands in an append-only audit log.

pub mod agent;
pub mod audit;
pub mod command;
pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod frame;
pub mod notify;
pub mod platform;
pub mod retry;
pub mod session;
pub mod state;

pub use agent::{Agent, ControlCommand, CycleOutcome};
pub use config::AgentConfig;
