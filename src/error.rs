use crate::domain::account::AccountId;
use crate::domain::booking::{BookingStatus, CarId};
use miette::Diagnostic;
use thiserror::Error;

/// Why a request collided with the current state of the system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// The car is not bookable for the requested window.
    #[error("car {car} is not available for the requested window")]
    CarUnavailable { car: CarId },
    /// The caller does not own the booking (or the car) it acts on.
    #[error("caller does not own this resource")]
    NotOwner,
    /// Customers cannot rent their own listing.
    #[error("an owner cannot book their own car")]
    OwnCar,
    /// The booking status does not allow the requested action.
    #[error("cannot {action} a booking in status {from}")]
    IllegalTransition {
        from: BookingStatus,
        action: &'static str,
    },
    /// The record changed between read and commit.
    #[error("record was modified concurrently")]
    StaleVersion,
    /// A request key was already used for another booking.
    #[error("request key already used")]
    DuplicateRequest,
    /// A top-up was already resolved by an earlier callback.
    #[error("top-up already resolved")]
    AlreadyResolved,
}

impl ConflictKind {
    pub fn code(&self) -> &'static str {
        match self {
            ConflictKind::CarUnavailable { .. } => "CONFLICT_CAR_UNAVAILABLE",
            ConflictKind::NotOwner => "CONFLICT_NOT_OWNER",
            ConflictKind::OwnCar => "CONFLICT_OWN_CAR",
            ConflictKind::IllegalTransition { .. } => "CONFLICT_ILLEGAL_TRANSITION",
            ConflictKind::StaleVersion => "CONFLICT_STALE_VERSION",
            ConflictKind::DuplicateRequest => "CONFLICT_DUPLICATE_REQUEST",
            ConflictKind::AlreadyResolved => "CONFLICT_ALREADY_RESOLVED",
        }
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum RentalError {
    #[error("Validation error: {0}")]
    #[diagnostic(code(rentflow::validation))]
    ValidationError(String),

    #[error("Profile of account {account} is incomplete, missing: {}", .missing.join(", "))]
    #[diagnostic(
        code(rentflow::profile_incomplete),
        help("complete the customer profile before booking")
    )]
    ProfileIncomplete {
        account: AccountId,
        missing: Vec<&'static str>,
    },

    #[error("Conflict: {0}")]
    #[diagnostic(code(rentflow::conflict))]
    Conflict(ConflictKind),

    #[error("Insufficient balance on wallet {account}: balance {balance}, required {required}")]
    #[diagnostic(code(rentflow::insufficient_balance))]
    InsufficientBalance {
        account: AccountId,
        balance: i64,
        required: i64,
    },

    #[error("{entity} {key} not found")]
    #[diagnostic(code(rentflow::not_found))]
    NotFound { entity: &'static str, key: String },

    #[error("Payment gateway error: {0}")]
    #[diagnostic(code(rentflow::gateway))]
    ExternalGatewayError(String),

    #[error("Storage error: {0}")]
    #[diagnostic(code(rentflow::storage))]
    StorageError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RentalError {
    /// Stable, machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            RentalError::ValidationError(_) => "VALIDATION_ERROR",
            RentalError::ProfileIncomplete { .. } => "PROFILE_INCOMPLETE",
            RentalError::Conflict(kind) => kind.code(),
            RentalError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            RentalError::NotFound { .. } => "NOT_FOUND",
            RentalError::ExternalGatewayError(_) => "EXTERNAL_GATEWAY_ERROR",
            RentalError::StorageError(_) => "STORAGE_ERROR",
        }
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        RentalError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        RentalError::StorageError(Box::new(std::io::Error::other(message.into())))
    }

    pub(crate) fn is_stale(&self) -> bool {
        matches!(self, RentalError::Conflict(ConflictKind::StaleVersion))
    }
}

impl From<std::io::Error> for RentalError {
    fn from(err: std::io::Error) -> Self {
        RentalError::StorageError(Box::new(err))
    }
}

impl From<csv::Error> for RentalError {
    fn from(err: csv::Error) -> Self {
        RentalError::StorageError(Box::new(err))
    }
}

impl From<serde_json::Error> for RentalError {
    fn from(err: serde_json::Error) -> Self {
        RentalError::StorageError(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for RentalError {
    fn from(err: rocksdb::Error) -> Self {
        RentalError::StorageError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, RentalError>;
