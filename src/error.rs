//! Error taxonomy of the allocation service.

use crate::lock::LockError;
use crate::models::AddressBlock;
use crate::registry::RegistryError;
use crate::request::ValidationError;
use crate::store::StoreError;
use std::time::Duration;

/// Result type for allocation operations
pub type Result<T> = std::result::Result<T, AllocationError>;

/// Every way an allocation request can fail.
///
/// `NoCapacity` and the two conflict kinds are the caller's to retry;
/// nothing here is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No root CIDR list found for region {0}")]
    RegionNotFound(String),

    #[error("Invalid cloud provider {cloud} for region {region}")]
    InvalidCloudProvider { region: String, cloud: String },

    #[error("No CIDR blocks of size /{0} available")]
    NoCapacity(u8),

    #[error("CIDR block {0} already exists")]
    AlreadyReserved(AddressBlock),

    #[error("CIDR {0} cannot be assigned")]
    InvalidTransition(AddressBlock),

    #[error("Failed to get CIDR table lock after waiting {0:?}")]
    LockTimeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(RegistryError),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AllocationError {
    /// HTTP-style status for transports that report one.
    pub fn status_code(&self) -> u16 {
        match self {
            AllocationError::Validation(_)
            | AllocationError::InvalidCloudProvider { .. }
            | AllocationError::AlreadyReserved(_)
            | AllocationError::InvalidTransition(_) => 400,
            AllocationError::RegionNotFound(_) | AllocationError::NoCapacity(_) => 404,
            AllocationError::LockTimeout(_)
            | AllocationError::Store(_)
            | AllocationError::Registry(_)
            | AllocationError::Unexpected(_) => 500,
        }
    }

    /// Process exit status for the CLI: 2 bad request, 3 not found, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.status_code() {
            400 => 2,
            404 => 3,
            _ => 1,
        }
    }
}

impl From<LockError> for AllocationError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { waited } => AllocationError::LockTimeout(waited),
            LockError::Store(e) => AllocationError::Store(e),
        }
    }
}

impl From<RegistryError> for AllocationError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::RegionNotFound(region) => AllocationError::RegionNotFound(region),
            other => AllocationError::Registry(other),
        }
    }
}
