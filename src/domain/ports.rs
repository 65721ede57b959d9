use super::account::{AccountId, Amount, CustomerProfile};
use super::booking::{Booking, BookingNumber, BookingStatus, CarId, CarListing};
use super::settlement::{LedgerPolicy, Settlement};
use super::transaction::{Transaction, TransactionId};
use super::wallet::Wallet;
use crate::error::{ConflictKind, RentalError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Idempotency key of a create request, scoped to the requesting account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub account: AccountId,
    pub key: String,
}

#[derive(Debug, Clone)]
pub enum BookingWrite {
    Insert(Booking),
    /// Replace a booking, provided it is still at `expected_version`.
    Update {
        booking: Booking,
        expected_version: u64,
        /// The booking moves into a slot-holding status with this write.
        claims_slot: bool,
    },
}

impl BookingWrite {
    pub fn update(previous: &Booking, next: Booking) -> Self {
        BookingWrite::Update {
            claims_slot: !previous.status.holds_slot() && next.status.holds_slot(),
            booking: next,
            expected_version: previous.version,
        }
    }

    fn claims_slot(&self) -> bool {
        match self {
            BookingWrite::Insert(booking) => booking.status.holds_slot(),
            BookingWrite::Update { claims_slot, .. } => *claims_slot,
        }
    }

    pub fn booking(&self) -> &Booking {
        match self {
            BookingWrite::Insert(booking) | BookingWrite::Update { booking, .. } => booking,
        }
    }
}

/// Everything one state change writes. Stores apply a commit atomically:
/// all booking writes, balance changes and ledger rows land together or
/// nothing does.
#[derive(Debug, Clone)]
pub struct Commit {
    pub bookings: Vec<BookingWrite>,
    pub settlement: Option<Settlement>,
    pub request_key: Option<RequestKey>,
    pub policy: LedgerPolicy,
}

impl Commit {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            bookings: Vec::new(),
            settlement: None,
            request_key: None,
            policy,
        }
    }

    pub fn with_booking(mut self, write: BookingWrite) -> Self {
        self.bookings.push(write);
        self
    }

    pub fn with_settlement(mut self, settlement: Settlement) -> Self {
        self.settlement = Some(settlement);
        self
    }

    pub fn with_request_key(mut self, key: Option<RequestKey>) -> Self {
        self.request_key = key;
        self
    }

    /// Checks the booking writes against the stored versions.
    ///
    /// `stored` returns the version currently persisted for a booking
    /// number, or `None` when no such booking exists.
    pub fn check_versions(&self, stored: impl Fn(&BookingNumber) -> Option<u64>) -> Result<()> {
        for write in &self.bookings {
            match write {
                BookingWrite::Insert(booking) => {
                    if stored(&booking.number).is_some() {
                        return Err(RentalError::Conflict(ConflictKind::StaleVersion));
                    }
                }
                BookingWrite::Update {
                    booking,
                    expected_version,
                    ..
                } => match stored(&booking.number) {
                    None => return Err(RentalError::not_found("booking", &booking.number)),
                    Some(version) if version != *expected_version => {
                        return Err(RentalError::Conflict(ConflictKind::StaleVersion));
                    }
                    Some(_) => {}
                },
            }
        }
        Ok(())
    }

    /// Rejects a write that claims a car's time slot while another stored
    /// booking of that car already holds an overlapping one.
    pub fn check_slots<'a>(&self, stored: impl IntoIterator<Item = &'a Booking>) -> Result<()> {
        let claims: Vec<&Booking> = self
            .bookings
            .iter()
            .filter(|write| write.claims_slot())
            .map(BookingWrite::booking)
            .collect();
        if claims.is_empty() {
            return Ok(());
        }
        for held in stored.into_iter().filter(|b| b.status.holds_slot()) {
            if let Some(claim) = claims.iter().find(|claim| claim.overlaps(held)) {
                return Err(RentalError::Conflict(ConflictKind::CarUnavailable {
                    car: claim.car,
                }));
            }
        }
        Ok(())
    }

    /// Booking number the request key should point to.
    pub fn inserted_number(&self) -> Option<&BookingNumber> {
        self.bookings.iter().find_map(|write| match write {
            BookingWrite::Insert(booking) => Some(&booking.number),
            BookingWrite::Update { .. } => None,
        })
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Creates the wallet if it does not exist yet and returns it.
    async fn open_wallet(&self, account: AccountId, at: DateTime<Utc>) -> Result<Wallet>;
    async fn wallet(&self, account: AccountId) -> Result<Option<Wallet>>;
    async fn all_wallets(&self) -> Result<Vec<Wallet>>;
    /// Ledger rows of a wallet, oldest first.
    async fn transactions(&self, account: AccountId) -> Result<Vec<Transaction>>;
    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;
    async fn booking(&self, number: &BookingNumber) -> Result<Option<Booking>>;
    async fn bookings_by_customer(&self, account: AccountId) -> Result<Vec<Booking>>;
    async fn bookings_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>>;
    async fn bookings_for_car(&self, car: CarId) -> Result<Vec<Booking>>;
    async fn booking_for_request(&self, key: &RequestKey) -> Result<Option<BookingNumber>>;
    /// Monotonic sequence used for booking numbers.
    async fn next_sequence(&self) -> Result<u64>;
    async fn commit(&self, commit: Commit) -> Result<()>;
}

pub type RepositoryBox = Box<dyn Repository>;

#[async_trait]
pub trait CarCatalog: Send + Sync {
    async fn get_car(&self, car: CarId) -> Result<Option<CarListing>>;
    async fn is_available(&self, car: CarId, from: DateTime<Utc>, to: DateTime<Utc>)
    -> Result<bool>;
}

pub type CarCatalogBox = Box<dyn CarCatalog>;

#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn get_profile(&self, account: AccountId) -> Result<Option<CustomerProfile>>;
}

pub type ProfileProviderBox = Box<dyn ProfileProvider>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    BookingCreated,
    DepositPaid,
    BookingUpdated,
    BookingConfirmed,
    BookingCancelled,
    BookingExpired,
    OverlapCancelled,
    TripStarted,
    CarReturned,
    BookingCompleted,
}

impl NotificationKind {
    pub fn template(&self) -> &'static str {
        match self {
            NotificationKind::BookingCreated => "booking_created",
            NotificationKind::DepositPaid => "deposit_paid",
            NotificationKind::BookingUpdated => "booking_updated",
            NotificationKind::BookingConfirmed => "booking_confirmed",
            NotificationKind::BookingCancelled => "booking_cancelled",
            NotificationKind::BookingExpired => "booking_expired",
            NotificationKind::OverlapCancelled => "overlap_cancelled",
            NotificationKind::TripStarted => "trip_started",
            NotificationKind::CarReturned => "car_returned",
            NotificationKind::BookingCompleted => "booking_completed",
        }
    }
}

pub type NotificationParams = BTreeMap<&'static str, String>;

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound notification channel. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        email: &str,
        kind: NotificationKind,
        params: &NotificationParams,
    ) -> std::result::Result<(), NotifyError>;
}

pub type NotifierBox = Box<dyn Notifier>;

/// Query parameters the gateway appends to its return URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayCallback {
    pub params: BTreeMap<String, String>,
}

impl GatewayCallback {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub transaction: TransactionId,
    /// Whether the gateway confirms the payment went through.
    pub verified: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway rejected the request: {0}")]
    Rejected(String),
    #[error("gateway unreachable: {0}")]
    Unavailable(String),
    #[error("malformed callback: {0}")]
    MalformedCallback(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Starts a top-up and returns the URL the customer is redirected to.
    async fn initiate_top_up(
        &self,
        account: AccountId,
        amount: Amount,
        reference: TransactionId,
    ) -> std::result::Result<String, GatewayError>;

    async fn verify_callback(
        &self,
        callback: &GatewayCallback,
    ) -> std::result::Result<CallbackOutcome, GatewayError>;
}

pub type PaymentGatewayBox = Box<dyn PaymentGateway>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type ClockBox = Box<dyn Clock>;
