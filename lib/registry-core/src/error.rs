use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Lease not found: {service}/{instance}")]
    LeaseNotFound { service: String, instance: String },

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Registry transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CoreError {
    pub fn lease_not_found(service: &str, instance: &str) -> Self {
        CoreError::LeaseNotFound {
            service: service.to_string(),
            instance: instance.to_string(),
        }
    }

    /// True when the caller should fall back to a full registration
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::LeaseNotFound { .. })
    }
}
