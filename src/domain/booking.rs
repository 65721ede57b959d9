use super::account::{AccountId, DriverInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CarId(pub u64);

impl fmt::Display for CarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingId(pub Uuid);

impl BookingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable booking reference, e.g. `BK20261014000042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookingNumber(pub String);

impl BookingNumber {
    /// Formats the creation date and a store-wide sequence into a number.
    pub fn generate(created_at: DateTime<Utc>, sequence: u64) -> Self {
        Self(format!("BK{}{:06}", created_at.format("%Y%m%d"), sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookingNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BookingNumber {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    PendingDeposit,
    WaitingConfirm,
    Confirmed,
    InProgress,
    PendingPayment,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// The single transition table of the booking lifecycle.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (PendingDeposit, WaitingConfirm)
                | (WaitingConfirm, Confirmed)
                | (Confirmed, InProgress)
                | (InProgress, PendingPayment)
                | (PendingPayment, Completed)
                | (PendingDeposit | WaitingConfirm | Confirmed, Cancelled)
        )
    }

    /// Edit and cancel are only open before the trip starts.
    pub fn is_modifiable(self) -> bool {
        self.can_transition_to(BookingStatus::Cancelled)
    }

    /// Statuses in which the house holds this booking's deposit (or has
    /// already settled it), i.e. the booking owns its time slot.
    pub fn holds_slot(self) -> bool {
        use BookingStatus::*;
        matches!(
            self,
            WaitingConfirm | Confirmed | InProgress | PendingPayment | Completed
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BookingStatus::PendingDeposit => "PENDING_DEPOSIT",
            BookingStatus::WaitingConfirm => "WAITING_CONFIRM",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::InProgress => "IN_PROGRESS",
            BookingStatus::PendingPayment => "PENDING_PAYMENT",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    #[default]
    Wallet,
    Cash,
    BankTransfer,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Cancelled by the customer.
    Customer,
    /// The deposit was not paid in time.
    Expired,
    /// Another booking for the same car and window was funded first.
    LostOverlap,
}

/// What the catalog knows about a car at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarListing {
    pub car: CarId,
    pub owner: AccountId,
    pub deposit: i64,
    pub base_price: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub number: BookingNumber,
    pub customer: AccountId,
    pub car: CarId,
    /// Owner of the car when the booking was made.
    pub car_owner: AccountId,
    pub pick_up: DateTime<Utc>,
    pub drop_off: DateTime<Utc>,
    /// Price per day snapshotted from the listing.
    pub base_price: i64,
    /// Deposit snapshotted from the listing.
    pub deposit: i64,
    pub payment_type: PaymentType,
    pub status: BookingStatus,
    pub driver: DriverInfo,
    pub cancellation: Option<CancellationReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every committed change.
    pub version: u64,
}

impl Booking {
    /// Whether the `[pick_up, drop_off)` windows intersect on the same car.
    pub fn overlaps(&self, other: &Booking) -> bool {
        self.car == other.car
            && self.id != other.id
            && self.pick_up < other.drop_off
            && other.pick_up < self.drop_off
    }

    pub fn overlaps_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.pick_up < to && from < self.drop_off
    }

    /// Returns the booking as it reads after moving to `status`.
    pub fn advanced(&self, status: BookingStatus, at: DateTime<Utc>) -> Booking {
        Booking {
            status,
            updated_at: at,
            version: self.version + 1,
            ..self.clone()
        }
    }
}
