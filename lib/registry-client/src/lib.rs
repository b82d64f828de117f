//! Registry client embedded in backend services
//!
//! - `RegistryClient` speaks the registry's HTTP API
//! - `RegistrationAgent` registers, heartbeats and deregisters one instance

pub mod agent;
pub mod client;
pub mod config;

pub use agent::{AgentHandle, AgentState, RegistrationAgent};
pub use client::RegistryClient;
pub use config::AgentConfig;
