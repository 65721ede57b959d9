//! Booking lifecycle operations.
//!
//! Every transition re-reads the booking, decides against its fresh status
//! and commits with the version it read. A concurrent writer makes the
//! commit fail with a stale version, in which case the whole decision is
//! replayed (at most [`MAX_ATTEMPTS`] times).

use super::engine::RentalEngine;
use crate::domain::account::{AccountId, DriverInfo};
use crate::domain::booking::{
    Booking, BookingId, BookingNumber, BookingStatus, CancellationReason, CarId, PaymentType,
};
use crate::domain::ports::{BookingWrite, Commit, NotificationKind, RequestKey};
use crate::domain::rental_window;
use crate::domain::settlement::Settlement;
use crate::error::{ConflictKind, RentalError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::{Future, ready};
use tracing::{debug, info, warn};

pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIntent {
    pub car: CarId,
    pub pick_up: DateTime<Utc>,
    pub drop_off: DateTime<Utc>,
    #[serde(default)]
    pub payment_type: PaymentType,
    /// Someone other than the customer drives. Defaults to the profile.
    #[serde(default)]
    pub driver: Option<DriverInfo>,
    /// Client-chosen key making the create safe to retry.
    #[serde(default)]
    pub request_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditIntent {
    #[serde(default)]
    pub driver: Option<DriverInfo>,
    #[serde(default)]
    pub payment_type: Option<PaymentType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum BookingIntent {
    Create(CreateIntent),
    Edit {
        number: BookingNumber,
        #[serde(flatten)]
        changes: EditIntent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Zero-based page index.
    pub index: usize,
    pub size: usize,
}

impl Page {
    pub fn new(index: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(RentalError::ValidationError(
                "page size must be positive".to_string(),
            ));
        }
        Ok(Self { index, size })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// What the reconciliation pass did with a pending booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The deposit was captured; overlapping pending bookings were cancelled.
    Promoted {
        booking: Booking,
        overlap_cancelled: Vec<BookingNumber>,
    },
    /// A deposit-holding booking already owns the slot; this one was cancelled.
    LostOverlap(Booking),
    /// Left pending (not funded, not paid by wallet, or no longer pending).
    NotEligible(Booking),
}

struct Planned {
    next: Booking,
    settlement: Settlement,
    notification: NotificationKind,
}

enum Step {
    Apply(Planned),
    Skip,
}

enum Applied {
    Committed(Booking),
    Skipped(Booking),
}

impl Applied {
    fn into_booking(self) -> Booking {
        match self {
            Applied::Committed(booking) | Applied::Skipped(booking) => booking,
        }
    }
}

fn ensure_transition(current: &Booking, next: BookingStatus, action: &'static str) -> Result<()> {
    if current.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(RentalError::Conflict(ConflictKind::IllegalTransition {
            from: current.status,
            action,
        }))
    }
}

fn ensure_customer(current: &Booking, account: AccountId) -> Result<()> {
    if current.customer == account {
        Ok(())
    } else {
        Err(RentalError::Conflict(ConflictKind::NotOwner))
    }
}

fn ensure_complete(account: AccountId, driver: &DriverInfo) -> Result<()> {
    let missing = driver.missing_fields();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RentalError::ProfileIncomplete { account, missing })
    }
}

fn plain(next: Booking, notification: NotificationKind) -> Result<Step> {
    Ok(Step::Apply(Planned {
        next,
        settlement: Settlement::default(),
        notification,
    }))
}

impl RentalEngine {
    /// Replays `step` against the freshest copy of the booking until its
    /// commit lands or fails for a reason other than a stale version.
    async fn transition<F, Fut>(&self, number: &BookingNumber, step: F) -> Result<Applied>
    where
        F: Fn(Booking) -> Fut,
        Fut: Future<Output = Result<Step>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load_booking(number).await?;
            let planned = match step(current.clone()).await? {
                Step::Apply(planned) => planned,
                Step::Skip => return Ok(Applied::Skipped(current)),
            };

            let Planned {
                next,
                settlement,
                notification,
            } = planned;
            let commit = Commit::new(self.policy())
                .with_booking(BookingWrite::update(&current, next.clone()))
                .with_settlement(settlement);

            match self.repository.commit(commit).await {
                Ok(()) => {
                    info!(
                        booking = %number,
                        from = %current.status,
                        to = %next.status,
                        version = next.version,
                        "Booking transitioned"
                    );
                    self.notify(&next, notification).await;
                    return Ok(Applied::Committed(next));
                }
                Err(e) if e.is_stale() && attempt < MAX_ATTEMPTS => {
                    debug!(booking = %number, attempt, "Stale booking version, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a booking for `account`.
    ///
    /// A wallet-paid booking whose customer can cover the deposit is
    /// captured immediately (`WAITING_CONFIRM`); otherwise it waits in
    /// `PENDING_DEPOSIT` for the reconciliation pass. Retrying with the same
    /// request key returns the booking created by the first call.
    pub async fn create_booking(&self, account: AccountId, intent: CreateIntent) -> Result<Booking> {
        let request_key = intent.request_key.clone().map(|key| RequestKey { account, key });
        if let Some(booking) = self.replay(request_key.as_ref()).await? {
            debug!(booking = %booking.number, "Replayed create request");
            return Ok(booking);
        }

        let now = self.now();
        rental_window::validate(&self.config().window, now, intent.pick_up, intent.drop_off)?;

        let profile = self
            .profiles
            .get_profile(account)
            .await?
            .ok_or_else(|| RentalError::not_found("account", account))?;
        if !profile.active {
            return Err(RentalError::ValidationError(format!(
                "account {account} is not active"
            )));
        }
        ensure_complete(account, &profile.driver)?;
        let driver = match intent.driver {
            Some(driver) => {
                ensure_complete(account, &driver)?;
                driver
            }
            None => profile.driver.clone(),
        };

        let car = self
            .catalog
            .get_car(intent.car)
            .await?
            .ok_or_else(|| RentalError::not_found("car", intent.car))?;
        if car.owner == account {
            return Err(RentalError::Conflict(ConflictKind::OwnCar));
        }
        let unavailable = RentalError::Conflict(ConflictKind::CarUnavailable { car: car.car });
        if !self
            .catalog
            .is_available(car.car, intent.pick_up, intent.drop_off)
            .await?
        {
            return Err(unavailable);
        }
        let taken = self
            .repository
            .bookings_for_car(car.car)
            .await?
            .iter()
            .any(|b| b.status.holds_slot() && b.overlaps_window(intent.pick_up, intent.drop_off));
        if taken {
            // A concurrent retry of this same request may be what holds the slot.
            return match self.replay(request_key.as_ref()).await? {
                Some(booking) => Ok(booking),
                None => Err(unavailable),
            };
        }

        let wallet = self.repository.open_wallet(account, now).await?;
        self.repository.open_wallet(car.owner, now).await?;

        let sequence = self.repository.next_sequence().await?;
        let pending = Booking {
            id: BookingId::new(),
            number: BookingNumber::generate(now, sequence),
            customer: account,
            car: car.car,
            car_owner: car.owner,
            pick_up: intent.pick_up,
            drop_off: intent.drop_off,
            base_price: car.base_price,
            deposit: car.deposit,
            payment_type: intent.payment_type,
            status: BookingStatus::PendingDeposit,
            driver,
            cancellation: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let mut outcome = None;
        if pending.payment_type == PaymentType::Wallet && wallet.can_cover(pending.deposit) {
            let captured = Booking {
                status: BookingStatus::WaitingConfirm,
                ..pending.clone()
            };
            let commit = Commit::new(self.policy())
                .with_booking(BookingWrite::Insert(captured.clone()))
                .with_settlement(self.settlement.capture_deposit(&captured, now))
                .with_request_key(request_key.clone());
            match self.repository.commit(commit).await {
                Ok(()) => outcome = Some(captured),
                // The balance moved since it was read; fall back to pending.
                Err(RentalError::InsufficientBalance { .. }) => {}
                Err(RentalError::Conflict(ConflictKind::DuplicateRequest)) => {
                    return self.replayed(request_key.as_ref()).await;
                }
                Err(e) => return Err(e),
            }
        }

        let booking = match outcome {
            Some(booking) => booking,
            None => {
                let commit = Commit::new(self.policy())
                    .with_booking(BookingWrite::Insert(pending.clone()))
                    .with_request_key(request_key.clone());
                match self.repository.commit(commit).await {
                    Ok(()) => pending,
                    Err(RentalError::Conflict(ConflictKind::DuplicateRequest)) => {
                        return self.replayed(request_key.as_ref()).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        info!(
            booking = %booking.number,
            customer = %account,
            car = %booking.car,
            status = %booking.status,
            deposit = booking.deposit,
            "Booking created"
        );
        let captured = booking.status == BookingStatus::WaitingConfirm;
        let kind = if captured {
            NotificationKind::DepositPaid
        } else {
            NotificationKind::BookingCreated
        };
        self.notify(&booking, kind).await;
        if captured {
            self.cancel_overlapping(&booking).await;
        }
        Ok(booking)
    }

    /// The booking an earlier call with the same request key created.
    async fn replay(&self, key: Option<&RequestKey>) -> Result<Option<Booking>> {
        let Some(key) = key else {
            return Ok(None);
        };
        match self.repository.booking_for_request(key).await? {
            Some(number) => self.load_booking(&number).await.map(Some),
            None => Ok(None),
        }
    }

    async fn replayed(&self, key: Option<&RequestKey>) -> Result<Booking> {
        self.replay(key)
            .await?
            .ok_or(RentalError::Conflict(ConflictKind::DuplicateRequest))
    }

    /// Changes the driver or payment type of a booking that has not started.
    ///
    /// Deposit and base price stay as they were snapshotted.
    pub async fn edit_booking(
        &self,
        account: AccountId,
        number: &BookingNumber,
        intent: EditIntent,
    ) -> Result<Booking> {
        if let Some(driver) = &intent.driver {
            ensure_complete(account, driver)?;
        }
        let now = self.now();
        let applied = self
            .transition(number, |current| {
                ready(Self::plan_edit(account, &intent, current, now))
            })
            .await?;
        Ok(applied.into_booking())
    }

    fn plan_edit(
        account: AccountId,
        intent: &EditIntent,
        current: Booking,
        now: DateTime<Utc>,
    ) -> Result<Step> {
        ensure_customer(&current, account)?;
        if !current.status.is_modifiable() {
            return Err(RentalError::Conflict(ConflictKind::IllegalTransition {
                from: current.status,
                action: "edit",
            }));
        }
        let mut next = current.advanced(current.status, now);
        if let Some(driver) = &intent.driver {
            next.driver = driver.clone();
        }
        if let Some(payment_type) = intent.payment_type {
            next.payment_type = payment_type;
        }
        plain(next, NotificationKind::BookingUpdated)
    }

    pub async fn submit(&self, account: AccountId, intent: BookingIntent) -> Result<Booking> {
        match intent {
            BookingIntent::Create(create) => self.create_booking(account, create).await,
            BookingIntent::Edit { number, changes } => {
                self.edit_booking(account, &number, changes).await
            }
        }
    }

    /// Cancels a booking on behalf of its customer and refunds the deposit
    /// according to how far the booking got.
    pub async fn cancel_booking(&self, account: AccountId, number: &BookingNumber) -> Result<Booking> {
        let now = self.now();
        let applied = self
            .transition(number, |current| {
                ready(self.plan_cancel(current, now, CancellationReason::Customer, |b| {
                    ensure_customer(b, account)
                }))
            })
            .await?;
        Ok(applied.into_booking())
    }

    fn plan_cancel(
        &self,
        current: Booking,
        now: DateTime<Utc>,
        reason: CancellationReason,
        authorize: impl Fn(&Booking) -> Result<()>,
    ) -> Result<Step> {
        authorize(&current)?;
        ensure_transition(&current, BookingStatus::Cancelled, "cancel")?;
        let settlement = self.settlement.cancellation(&current, now)?;
        let mut next = current.advanced(BookingStatus::Cancelled, now);
        next.cancellation = Some(reason);
        let notification = match reason {
            CancellationReason::Customer => NotificationKind::BookingCancelled,
            CancellationReason::Expired => NotificationKind::BookingExpired,
            CancellationReason::LostOverlap => NotificationKind::OverlapCancelled,
        };
        Ok(Step::Apply(Planned {
            next,
            settlement,
            notification,
        }))
    }

    /// The car owner accepts a booking whose deposit is held.
    pub async fn confirm_booking(&self, owner: AccountId, number: &BookingNumber) -> Result<Booking> {
        let now = self.now();
        let applied = self
            .transition(number, |current| ready(Self::plan_confirm(owner, current, now)))
            .await?;
        Ok(applied.into_booking())
    }

    fn plan_confirm(owner: AccountId, current: Booking, now: DateTime<Utc>) -> Result<Step> {
        if current.car_owner != owner {
            return Err(RentalError::Conflict(ConflictKind::NotOwner));
        }
        ensure_transition(&current, BookingStatus::Confirmed, "confirm")?;
        plain(
            current.advanced(BookingStatus::Confirmed, now),
            NotificationKind::BookingConfirmed,
        )
    }

    /// The customer picks the car up.
    pub async fn start_trip(&self, account: AccountId, number: &BookingNumber) -> Result<Booking> {
        self.customer_step(
            account,
            number,
            BookingStatus::InProgress,
            "start",
            NotificationKind::TripStarted,
        )
        .await
    }

    /// The customer brings the car back; the booking awaits final payment.
    pub async fn return_car(&self, account: AccountId, number: &BookingNumber) -> Result<Booking> {
        self.customer_step(
            account,
            number,
            BookingStatus::PendingPayment,
            "return",
            NotificationKind::CarReturned,
        )
        .await
    }

    async fn customer_step(
        &self,
        account: AccountId,
        number: &BookingNumber,
        to: BookingStatus,
        action: &'static str,
        notification: NotificationKind,
    ) -> Result<Booking> {
        let now = self.now();
        let applied = self
            .transition(number, |current| {
                ready(
                    ensure_customer(&current, account)
                        .and_then(|()| ensure_transition(&current, to, action))
                        .and_then(|()| plain(current.advanced(to, now), notification)),
                )
            })
            .await?;
        Ok(applied.into_booking())
    }

    /// Charges the rental and pays the owner. Fails with
    /// `InsufficientBalance` (status unchanged) when the customer cannot
    /// cover the amount owed beyond the deposit.
    pub async fn settle_booking(&self, account: AccountId, number: &BookingNumber) -> Result<Booking> {
        let now = self.now();
        let applied = self
            .transition(number, |current| ready(self.plan_settlement(account, current, now)))
            .await?;
        Ok(applied.into_booking())
    }

    fn plan_settlement(&self, account: AccountId, current: Booking, now: DateTime<Utc>) -> Result<Step> {
        ensure_customer(&current, account)?;
        ensure_transition(&current, BookingStatus::Completed, "settle")?;
        let (charge, settlement) = self.settlement.final_payment(&current, now)?;
        debug!(
            booking = %current.number,
            days = charge.days,
            total = charge.total,
            offset = charge.offset,
            "Final charge computed"
        );
        Ok(Step::Apply(Planned {
            next: current.advanced(BookingStatus::Completed, now),
            settlement,
            notification: NotificationKind::BookingCompleted,
        }))
    }

    /// Returns a booking to its customer or to the car owner.
    pub async fn get_booking(&self, account: AccountId, number: &BookingNumber) -> Result<Booking> {
        let booking = self.load_booking(number).await?;
        if booking.customer != account && booking.car_owner != account {
            return Err(RentalError::Conflict(ConflictKind::NotOwner));
        }
        Ok(booking)
    }

    /// The customer's bookings, newest first.
    pub async fn list_bookings(&self, account: AccountId, page: Page) -> Result<PageResult<Booking>> {
        let mut bookings = self.repository.bookings_by_customer(account).await?;
        bookings.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.number.cmp(&a.number))
        });
        let total = bookings.len();
        let items = bookings
            .into_iter()
            .skip(page.index.saturating_mul(page.size))
            .take(page.size)
            .collect();
        Ok(PageResult { items, total })
    }

    /// Cancels a `PENDING_DEPOSIT` booking whose deposit was not paid within
    /// the configured time. Returns `None` when the booking no longer
    /// qualifies.
    pub async fn expire_booking(&self, number: &BookingNumber) -> Result<Option<Booking>> {
        let now = self.now();
        let ttl = self.config().reconciliation.pending_deposit_ttl();
        let applied = self
            .transition(number, |current| {
                ready(
                    if current.status != BookingStatus::PendingDeposit
                        || current.created_at + ttl >= now
                    {
                        Ok(Step::Skip)
                    } else {
                        self.plan_cancel(current, now, CancellationReason::Expired, |_| Ok(()))
                    },
                )
            })
            .await?;
        Ok(match applied {
            Applied::Committed(booking) => Some(booking),
            Applied::Skipped(_) => None,
        })
    }

    /// Captures the deposit of a pending booking if its customer can now
    /// pay, then cancels the pending bookings it overlaps.
    pub async fn promote_booking(&self, number: &BookingNumber) -> Result<PromotionOutcome> {
        let now = self.now();
        let applied = self
            .transition(number, move |current| self.plan_promotion(current, now))
            .await?;
        match applied {
            Applied::Skipped(booking) => Ok(PromotionOutcome::NotEligible(booking)),
            Applied::Committed(booking) if booking.status == BookingStatus::Cancelled => {
                Ok(PromotionOutcome::LostOverlap(booking))
            }
            Applied::Committed(booking) => {
                let overlap_cancelled = self.cancel_overlapping(&booking).await;
                Ok(PromotionOutcome::Promoted {
                    booking,
                    overlap_cancelled,
                })
            }
        }
    }

    async fn plan_promotion(&self, current: Booking, now: DateTime<Utc>) -> Result<Step> {
        if current.status != BookingStatus::PendingDeposit
            || current.payment_type != PaymentType::Wallet
        {
            return Ok(Step::Skip);
        }
        let slot_taken = self
            .repository
            .bookings_for_car(current.car)
            .await?
            .iter()
            .any(|other| other.status.holds_slot() && other.overlaps(&current));
        if slot_taken {
            return self.plan_cancel(current, now, CancellationReason::LostOverlap, |_| Ok(()));
        }
        let funded = self
            .repository
            .wallet(current.customer)
            .await?
            .is_some_and(|w| w.can_cover(current.deposit));
        if !funded {
            return Ok(Step::Skip);
        }
        ensure_transition(&current, BookingStatus::WaitingConfirm, "capture")?;
        let settlement = self.settlement.capture_deposit(&current, now);
        Ok(Step::Apply(Planned {
            next: current.advanced(BookingStatus::WaitingConfirm, now),
            settlement,
            notification: NotificationKind::DepositPaid,
        }))
    }

    /// Cancels every pending booking of the same car that overlaps `winner`.
    /// Failures are logged; the winner stays captured either way.
    async fn cancel_overlapping(&self, winner: &Booking) -> Vec<BookingNumber> {
        let candidates = match self.repository.bookings_for_car(winner.car).await {
            Ok(bookings) => bookings,
            Err(e) => {
                warn!(booking = %winner.number, error = %e, "Could not load overlapping bookings");
                return Vec::new();
            }
        };

        let now = self.now();
        let mut cancelled = Vec::new();
        for loser in candidates
            .iter()
            .filter(|b| b.status == BookingStatus::PendingDeposit && b.overlaps(winner))
        {
            let result = self
                .transition(&loser.number, |current| {
                    ready(if current.status != BookingStatus::PendingDeposit {
                        Ok(Step::Skip)
                    } else {
                        self.plan_cancel(current, now, CancellationReason::LostOverlap, |_| Ok(()))
                    })
                })
                .await;
            match result {
                Ok(Applied::Committed(booking)) => cancelled.push(booking.number),
                Ok(Applied::Skipped(_)) => {}
                Err(e) => warn!(
                    booking = %loser.number,
                    winner = %winner.number,
                    error = %e,
                    "Failed to cancel overlapping booking"
                ),
            }
        }
        cancelled
    }
}
