//! Core service registry functionality
//!
//! This library provides:
//! - The lease data model advertised by backend instances
//! - An in-memory registry with lazy TTL expiry
//! - The `RegistryApi` contract shared by local and remote registries

pub mod api;
pub mod clock;
pub mod error;
pub mod lease;
pub mod registry;

pub use api::{RegistryApi, StatusUpdate, SERVICES_PATH};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use lease::{normalize_service_name, InstanceAddress, Lease, LeaseStatus, MAX_TTL_SECONDS};
pub use registry::{LeaseView, ServiceRegistry};
