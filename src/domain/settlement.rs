//! Settlement engine.
//!
//! Computes the ledger rows a booking transition (or a wallet operation)
//! produces. Nothing here touches storage: the resulting [`Settlement`] is
//! handed to the repository inside a commit, and the repository applies it
//! through [`Settlement::project_balances`]. A `Settlement` can only be
//! built by this module, so every balance change in the system is one of
//! the movements defined below.

use super::account::{AccountId, Amount};
use super::booking::{Booking, BookingStatus};
use super::transaction::{Transaction, TransactionId, TransactionStatus, TransactionType};
use crate::config::{HouseFloorPolicy, SettlementRules};
use crate::error::{ConflictKind, RentalError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;
use tracing::error;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Who the house account is and how far it may fall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub house: AccountId,
    pub house_floor: HouseFloorPolicy,
}

/// Moves a `Processing` top-up row to a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopUpResolution {
    transaction: TransactionId,
    wallet: AccountId,
    amount: i64,
    status: TransactionStatus,
}

impl TopUpResolution {
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn wallet(&self) -> AccountId {
        self.wallet
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    fn settled_amount(&self) -> i64 {
        match self.status {
            TransactionStatus::Successful => self.amount,
            TransactionStatus::Processing | TransactionStatus::Failed => 0,
        }
    }
}

/// A set of ledger rows to append plus top-up rows to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Settlement {
    entries: Vec<Transaction>,
    resolutions: Vec<TopUpResolution>,
    /// Set on escrow legs (refunds and final payments) only. Every other
    /// movement holds the house to the same floor as any wallet.
    house_floor_applies: bool,
}

fn overflow() -> RentalError {
    RentalError::ValidationError("amount overflows the wallet balance".to_string())
}

impl Settlement {
    pub fn entries(&self) -> &[Transaction] {
        &self.entries
    }

    pub fn resolutions(&self) -> &[TopUpResolution] {
        &self.resolutions
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.resolutions.is_empty()
    }

    /// Net balance change per wallet.
    pub fn deltas(&self) -> Result<BTreeMap<AccountId, i64>> {
        let moves = self
            .entries
            .iter()
            .map(|entry| (entry.wallet, entry.settled_amount()))
            .chain(
                self.resolutions
                    .iter()
                    .map(|resolution| (resolution.wallet, resolution.settled_amount())),
            );
        let mut deltas = BTreeMap::new();
        for (wallet, amount) in moves {
            let delta: &mut i64 = deltas.entry(wallet).or_insert(0);
            *delta = delta.checked_add(amount).ok_or_else(overflow)?;
        }
        deltas.retain(|_, delta| *delta != 0);
        Ok(deltas)
    }

    /// Computes the balances every touched wallet ends up with.
    ///
    /// `current` returns the live balance of a wallet, or `None` if the
    /// wallet does not exist. No wallet may go negative, except the house
    /// on an escrow leg, where `policy.house_floor` decides.
    pub fn project_balances(
        &self,
        current: impl Fn(AccountId) -> Option<i64>,
        policy: &LedgerPolicy,
    ) -> Result<Vec<(AccountId, i64)>> {
        let mut projected = Vec::new();
        for (account, delta) in self.deltas()? {
            let balance =
                current(account).ok_or_else(|| RentalError::not_found("wallet", account))?;
            let next = balance.checked_add(delta).ok_or_else(overflow)?;
            if next < 0 {
                let insufficient = RentalError::InsufficientBalance {
                    account,
                    balance,
                    required: delta.saturating_neg(),
                };
                if account != policy.house || !self.house_floor_applies {
                    return Err(insufficient);
                }
                match policy.house_floor {
                    HouseFloorPolicy::Block => return Err(insufficient),
                    HouseFloorPolicy::Alert => {
                        error!(
                            house = %account,
                            balance,
                            projected = next,
                            "House wallet drops below zero"
                        );
                    }
                }
            }
            projected.push((account, next));
        }
        Ok(projected)
    }
}

/// Shares of a deposit when a confirmed booking is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundSplit {
    pub customer: i64,
    pub owner: i64,
    pub house_retained: i64,
}

/// Amounts due when a trip is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalCharge {
    pub days: i64,
    pub total: i64,
    /// `total - deposit`; positive means the customer owes more.
    pub offset: i64,
    pub owner_payout: i64,
    pub commission: i64,
}

/// Number of charged days: every started 24 hour period counts, and the
/// drop-off instant itself opens a new one.
///
/// An exact multiple of 24 hours therefore also charges the drop-off day:
/// 09:00 to 09:00 the next morning is two days, 48 hours is three.
pub fn rental_days(pick_up: DateTime<Utc>, drop_off: DateTime<Utc>) -> i64 {
    let minutes = (drop_off - pick_up).num_minutes().max(0);
    minutes / MINUTES_PER_DAY + 1
}

fn share(amount: i64, rate: Decimal) -> i64 {
    // rate is within [0, 1], so the truncated product always fits.
    (Decimal::from(amount) * rate).trunc().to_i64().unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct SettlementEngine {
    rules: SettlementRules,
    house: AccountId,
}

impl SettlementEngine {
    pub fn new(rules: SettlementRules, house: AccountId) -> Self {
        Self { rules, house }
    }

    pub fn policy(&self) -> LedgerPolicy {
        LedgerPolicy {
            house: self.house,
            house_floor: self.rules.house_floor,
        }
    }

    fn booking_row(
        &self,
        booking: &Booking,
        wallet: AccountId,
        r#type: TransactionType,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Option<Transaction> {
        (amount != 0).then(|| Transaction {
            id: TransactionId::new(),
            wallet,
            r#type,
            amount,
            status: TransactionStatus::Successful,
            booking: Some(booking.number.clone()),
            car: Some(booking.car),
            created_at: at,
        })
    }

    fn from_rows(rows: impl IntoIterator<Item = Option<Transaction>>) -> Settlement {
        Settlement {
            entries: rows.into_iter().flatten().collect(),
            ..Settlement::default()
        }
    }

    /// Rows paying out of house escrow.
    fn escrow_rows(rows: impl IntoIterator<Item = Option<Transaction>>) -> Settlement {
        Settlement {
            house_floor_applies: true,
            ..Self::from_rows(rows)
        }
    }

    /// Customer pays the deposit into house escrow.
    pub fn capture_deposit(&self, booking: &Booking, at: DateTime<Utc>) -> Settlement {
        let deposit = booking.deposit;
        Self::from_rows([
            self.booking_row(booking, booking.customer, TransactionType::PayDeposit, -deposit, at),
            self.booking_row(booking, self.house, TransactionType::PayDeposit, deposit, at),
        ])
    }

    pub fn confirmed_refund_split(&self, deposit: i64) -> RefundSplit {
        let customer = share(deposit, self.rules.confirmed_customer_refund);
        let owner = share(deposit, self.rules.confirmed_owner_share);
        RefundSplit {
            customer,
            owner,
            house_retained: deposit - customer - owner,
        }
    }

    /// Money movement for cancelling `booking` from its current status.
    pub fn cancellation(&self, booking: &Booking, at: DateTime<Utc>) -> Result<Settlement> {
        let deposit = booking.deposit;
        match booking.status {
            BookingStatus::PendingDeposit => Ok(Settlement::default()),
            BookingStatus::WaitingConfirm => Ok(Self::escrow_rows([
                self.booking_row(booking, booking.customer, TransactionType::RefundDeposit, deposit, at),
                self.booking_row(booking, self.house, TransactionType::RefundDeposit, -deposit, at),
            ])),
            BookingStatus::Confirmed => {
                let split = self.confirmed_refund_split(deposit);
                Ok(Self::escrow_rows([
                    self.booking_row(
                        booking,
                        booking.customer,
                        TransactionType::RefundDeposit,
                        split.customer,
                        at,
                    ),
                    self.booking_row(
                        booking,
                        booking.car_owner,
                        TransactionType::RefundDeposit,
                        split.owner,
                        at,
                    ),
                    self.booking_row(
                        booking,
                        self.house,
                        TransactionType::RefundDeposit,
                        -(split.customer + split.owner),
                        at,
                    ),
                ]))
            }
            status => Err(RentalError::Conflict(ConflictKind::IllegalTransition {
                from: status,
                action: "cancel",
            })),
        }
    }

    pub fn final_charge(&self, booking: &Booking) -> Result<FinalCharge> {
        let days = rental_days(booking.pick_up, booking.drop_off);
        let total = booking.base_price.checked_mul(days).ok_or_else(overflow)?;
        let commission = share(total, self.rules.commission);
        Ok(FinalCharge {
            days,
            total,
            offset: total.checked_sub(booking.deposit).ok_or_else(overflow)?,
            owner_payout: total - commission,
            commission,
        })
    }

    /// Closes the books on a returned car.
    ///
    /// The customer settles the difference between the total charge and the
    /// held deposit (no customer row when they match), the owner is paid
    /// the total net of commission, and the house keeps the commission.
    pub fn final_payment(
        &self,
        booking: &Booking,
        at: DateTime<Utc>,
    ) -> Result<(FinalCharge, Settlement)> {
        let charge = self.final_charge(booking)?;
        let house = charge.offset.checked_sub(charge.owner_payout).ok_or_else(overflow)?;
        let settlement = Self::escrow_rows([
            self.booking_row(
                booking,
                booking.customer,
                TransactionType::OffsetFinalPayment,
                -charge.offset,
                at,
            ),
            self.booking_row(
                booking,
                booking.car_owner,
                TransactionType::OffsetFinalPayment,
                charge.owner_payout,
                at,
            ),
            self.booking_row(
                booking,
                self.house,
                TransactionType::OffsetFinalPayment,
                house,
                at,
            ),
        ]);
        Ok((charge, settlement))
    }

    pub fn withdraw(&self, account: AccountId, amount: Amount, at: DateTime<Utc>) -> Settlement {
        Settlement {
            entries: vec![Transaction {
                id: TransactionId::new(),
                wallet: account,
                r#type: TransactionType::Withdraw,
                amount: -amount.value(),
                status: TransactionStatus::Successful,
                booking: None,
                car: None,
                created_at: at,
            }],
            ..Settlement::default()
        }
    }

    /// Records a top-up request. The row is `Processing` when the gateway
    /// accepted it and `Failed` otherwise; neither moves money.
    pub fn top_up_requested(
        &self,
        reference: TransactionId,
        account: AccountId,
        amount: Amount,
        accepted: bool,
        at: DateTime<Utc>,
    ) -> Settlement {
        Settlement {
            entries: vec![Transaction {
                id: reference,
                wallet: account,
                r#type: TransactionType::TopUp,
                amount: amount.value(),
                status: if accepted {
                    TransactionStatus::Processing
                } else {
                    TransactionStatus::Failed
                },
                booking: None,
                car: None,
                created_at: at,
            }],
            ..Settlement::default()
        }
    }

    /// Resolves a processing top-up after the gateway callback.
    pub fn top_up_resolved(&self, row: &Transaction, verified: bool) -> Result<Settlement> {
        if row.r#type != TransactionType::TopUp {
            return Err(RentalError::ValidationError(format!(
                "transaction {} is not a top-up",
                row.id
            )));
        }
        if row.status.is_terminal() {
            return Err(RentalError::Conflict(ConflictKind::AlreadyResolved));
        }
        Ok(Settlement {
            resolutions: vec![TopUpResolution {
                transaction: row.id,
                wallet: row.wallet,
                amount: row.amount,
                status: if verified {
                    TransactionStatus::Successful
                } else {
                    TransactionStatus::Failed
                },
            }],
            ..Settlement::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::DriverInfo;
    use crate::domain::booking::{BookingId, BookingNumber, CarId, PaymentType};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    const CUSTOMER: AccountId = AccountId(1);
    const OWNER: AccountId = AccountId(2);
    const HOUSE: AccountId = AccountId(0);

    fn engine() -> SettlementEngine {
        SettlementEngine::new(SettlementRules::default(), HOUSE)
    }

    impl Settlement {
        fn delta_for(&self, account: AccountId) -> i64 {
            self.deltas().unwrap().get(&account).copied().unwrap_or(0)
        }
    }

    fn booking(status: BookingStatus, deposit: i64, base_price: i64, hours: i64) -> Booking {
        let at = Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap();
        Booking {
            id: BookingId::new(),
            number: BookingNumber::generate(at, 1),
            customer: CUSTOMER,
            car: CarId(5),
            car_owner: OWNER,
            pick_up: at,
            drop_off: at + Duration::hours(hours),
            base_price,
            deposit,
            payment_type: PaymentType::Wallet,
            status,
            driver: DriverInfo::default(),
            cancellation: None,
            created_at: at,
            updated_at: at,
            version: 0,
        }
    }

    #[test]
    fn test_capture_moves_deposit_to_house() {
        let b = booking(BookingStatus::PendingDeposit, 5_000, 2_000, 24);
        let s = engine().capture_deposit(&b, b.created_at);
        assert_eq!(s.delta_for(CUSTOMER), -5_000);
        assert_eq!(s.delta_for(HOUSE), 5_000);
        assert!(
            s.entries()
                .iter()
                .all(|t| t.r#type == TransactionType::PayDeposit)
        );
    }

    #[test]
    fn test_cancel_pending_moves_nothing() {
        let b = booking(BookingStatus::PendingDeposit, 5_000, 2_000, 24);
        assert!(engine().cancellation(&b, b.created_at).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_waiting_confirm_refunds_in_full() {
        let b = booking(BookingStatus::WaitingConfirm, 5_000, 2_000, 24);
        let s = engine().cancellation(&b, b.created_at).unwrap();
        assert_eq!(s.delta_for(CUSTOMER), 5_000);
        assert_eq!(s.delta_for(HOUSE), -5_000);
    }

    #[test]
    fn test_confirmed_split_conserves_deposit() {
        for deposit in [100_000, 99_999, 1, 7, 12_345] {
            let split = engine().confirmed_refund_split(deposit);
            assert_eq!(split.customer + split.owner + split.house_retained, deposit);
            let expected_house = deposit * 8 / 100;
            assert!((split.house_retained - expected_house).abs() <= 2);
        }
    }

    #[test]
    fn test_cancel_confirmed_pays_owner_compensation() {
        let b = booking(BookingStatus::Confirmed, 100_000, 2_000, 24);
        let s = engine().cancellation(&b, b.created_at).unwrap();
        assert_eq!(s.delta_for(CUSTOMER), 70_000);
        assert_eq!(s.delta_for(OWNER), 22_000);
        assert_eq!(s.delta_for(HOUSE), -92_000);
    }

    #[test]
    fn test_cancel_in_progress_is_illegal() {
        let b = booking(BookingStatus::InProgress, 100_000, 2_000, 24);
        assert!(matches!(
            engine().cancellation(&b, b.created_at),
            Err(RentalError::Conflict(_))
        ));
    }

    #[test]
    fn test_rental_days() {
        let start = Utc.with_ymd_and_hms(2026, 10, 15, 9, 0, 0).unwrap();
        assert_eq!(rental_days(start, start + Duration::hours(2)), 1);
        assert_eq!(rental_days(start, start + Duration::hours(23)), 1);
        assert_eq!(rental_days(start, start + Duration::hours(24)), 2);
        assert_eq!(rental_days(start, start + Duration::hours(30)), 2);
        assert_eq!(rental_days(start, start + Duration::hours(48)), 3);
    }

    #[test]
    fn test_final_payment_with_positive_offset() {
        let b = booking(BookingStatus::PendingPayment, 1_000, 2_000, 30);
        let (charge, s) = engine().final_payment(&b, b.created_at).unwrap();
        assert_eq!(charge.days, 2);
        assert_eq!(charge.offset, 3_000);
        assert_eq!(s.delta_for(CUSTOMER), -3_000);
        assert_eq!(s.delta_for(OWNER), 3_680);
        // The house held 1,000 and keeps the 320 commission.
        assert_eq!(s.delta_for(HOUSE), -680);
    }

    #[test]
    fn test_final_payment_refunds_excess_deposit() {
        let b = booking(BookingStatus::PendingPayment, 5_000, 2_000, 30);
        let (charge, s) = engine().final_payment(&b, b.created_at).unwrap();
        assert_eq!(charge.total, 4_000);
        assert_eq!(charge.offset, -1_000);
        assert_eq!(s.delta_for(CUSTOMER), 1_000);
        assert_eq!(s.delta_for(OWNER), 4_000 - 320);
        let net: i64 = s.deltas().unwrap().values().sum();
        assert_eq!(net, 0);
    }

    #[test]
    fn test_final_payment_without_offset_has_no_customer_row() {
        let b = booking(BookingStatus::PendingPayment, 2_000, 1_000, 30);
        let (charge, s) = engine().final_payment(&b, b.created_at).unwrap();
        assert_eq!(charge.offset, 0);
        assert!(s.entries().iter().all(|t| t.wallet != CUSTOMER));
    }

    #[test]
    fn test_project_balances_enforces_customer_floor() {
        let b = booking(BookingStatus::PendingDeposit, 5_000, 2_000, 24);
        let s = engine().capture_deposit(&b, b.created_at);
        let balances = HashMap::from([(CUSTOMER, 4_999), (HOUSE, 0)]);
        let err = s
            .project_balances(|a| balances.get(&a).copied(), &engine().policy())
            .unwrap_err();
        assert!(matches!(
            err,
            RentalError::InsufficientBalance {
                account: CUSTOMER,
                balance: 4_999,
                required: 5_000
            }
        ));
    }

    #[test]
    fn test_house_floor_policy() {
        let b = booking(BookingStatus::WaitingConfirm, 5_000, 2_000, 24);
        let s = engine().cancellation(&b, b.created_at).unwrap();
        let balances = HashMap::from([(CUSTOMER, 0), (HOUSE, 1_000)]);
        let lookup = |a: AccountId| balances.get(&a).copied();

        let alert = engine().policy();
        let projected = s.project_balances(lookup, &alert).unwrap();
        assert!(projected.contains(&(HOUSE, -4_000)));

        let block = LedgerPolicy {
            house_floor: HouseFloorPolicy::Block,
            ..alert
        };
        assert!(s.project_balances(lookup, &block).is_err());
    }

    #[test]
    fn test_house_withdrawal_keeps_the_floor() {
        let s = engine().withdraw(HOUSE, Amount::new(1_000_000).unwrap(), Utc::now());
        let balances = HashMap::from([(HOUSE, 5_000)]);
        let err = s
            .project_balances(|a| balances.get(&a).copied(), &engine().policy())
            .unwrap_err();
        assert!(matches!(
            err,
            RentalError::InsufficientBalance {
                account: HOUSE,
                balance: 5_000,
                required: 1_000_000
            }
        ));
    }

    #[test]
    fn test_balance_overflow_is_rejected() {
        let e = engine();
        let request = e.top_up_requested(
            TransactionId::new(),
            CUSTOMER,
            Amount::new(i64::MAX).unwrap(),
            true,
            Utc::now(),
        );
        let resolved = e.top_up_resolved(&request.entries()[0], true).unwrap();
        let balances = HashMap::from([(CUSTOMER, 1)]);
        let err = resolved
            .project_balances(|a| balances.get(&a).copied(), &e.policy())
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_final_charge_overflow_is_rejected() {
        let b = booking(BookingStatus::PendingPayment, 1_000, i64::MAX / 2 + 1, 30);
        assert!(engine().final_charge(&b).is_err());
        assert!(engine().final_payment(&b, b.created_at).is_err());
    }

    #[test]
    fn test_top_up_resolution_only_once() {
        let e = engine();
        let reference = TransactionId::new();
        let request = e.top_up_requested(
            reference,
            CUSTOMER,
            Amount::new(300).unwrap(),
            true,
            Utc::now(),
        );
        assert!(request.deltas().unwrap().is_empty());

        let mut row = request.entries()[0].clone();
        let resolved = e.top_up_resolved(&row, true).unwrap();
        assert_eq!(resolved.delta_for(CUSTOMER), 300);

        row.status = TransactionStatus::Successful;
        assert!(matches!(
            e.top_up_resolved(&row, true),
            Err(RentalError::Conflict(_))
        ));
    }
}
