use crate::domain::account::{AccountId, CustomerProfile};
use crate::domain::booking::{Booking, BookingNumber, BookingStatus, CarId, CarListing};
use crate::domain::ports::{CarCatalog, Commit, ProfileProvider, Repository, RequestKey};
use crate::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::domain::wallet::Wallet;
use crate::error::{ConflictKind, RentalError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct StoreState {
    wallets: HashMap<AccountId, Wallet>,
    ledger: HashMap<AccountId, Vec<Transaction>>,
    /// Transaction id -> (wallet, position in that wallet's ledger).
    tx_index: HashMap<TransactionId, (AccountId, usize)>,
    bookings: HashMap<BookingNumber, Booking>,
    requests: HashMap<RequestKey, BookingNumber>,
    sequence: u64,
}

impl StoreState {
    fn apply(&mut self, commit: Commit) -> Result<()> {
        commit.check_versions(|number| self.bookings.get(number).map(|b| b.version))?;
        if let Some(key) = &commit.request_key
            && self.requests.contains_key(key)
        {
            return Err(RentalError::Conflict(ConflictKind::DuplicateRequest));
        }
        commit.check_slots(self.bookings.values())?;

        let mut projected = Vec::new();
        if let Some(settlement) = &commit.settlement {
            for resolution in settlement.resolutions() {
                let row = self
                    .tx_index
                    .get(&resolution.transaction())
                    .and_then(|(wallet, pos)| self.ledger.get(wallet)?.get(*pos))
                    .ok_or_else(|| RentalError::not_found("transaction", resolution.transaction()))?;
                if row.status != TransactionStatus::Processing {
                    return Err(RentalError::Conflict(ConflictKind::AlreadyResolved));
                }
            }
            projected = settlement.project_balances(
                |account| self.wallets.get(&account).map(|w| w.balance),
                &commit.policy,
            )?;
        }

        // Everything is validated; from here on the commit cannot fail.
        if let (Some(key), Some(number)) = (&commit.request_key, commit.inserted_number()) {
            self.requests.insert(key.clone(), number.clone());
        }
        for (account, balance) in projected {
            if let Some(wallet) = self.wallets.get_mut(&account) {
                wallet.balance = balance;
            }
        }
        if let Some(settlement) = commit.settlement {
            for resolution in settlement.resolutions() {
                if let Some((wallet, pos)) = self.tx_index.get(&resolution.transaction())
                    && let Some(row) = self
                        .ledger
                        .get_mut(wallet)
                        .and_then(|rows| rows.get_mut(*pos))
                {
                    row.status = resolution.status();
                }
            }
            for entry in settlement.entries() {
                let rows = self.ledger.entry(entry.wallet).or_default();
                self.tx_index.insert(entry.id, (entry.wallet, rows.len()));
                rows.push(entry.clone());
            }
        }
        for write in commit.bookings {
            let booking = write.booking().clone();
            self.bookings.insert(booking.number.clone(), booking);
        }
        Ok(())
    }
}

/// A thread-safe in-memory repository.
///
/// One `RwLock` guards every collection, so a commit holding the write
/// guard sees and changes wallets, ledger rows and bookings as a unit.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut bookings: Vec<Booking>) -> Vec<Booking> {
    bookings.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.number.cmp(&b.number))
    });
    bookings
}

#[async_trait]
impl Repository for InMemoryStore {
    async fn open_wallet(&self, account: AccountId, at: DateTime<Utc>) -> Result<Wallet> {
        let mut state = self.state.write().await;
        Ok(state
            .wallets
            .entry(account)
            .or_insert_with(|| Wallet::new(account, at))
            .clone())
    }

    async fn wallet(&self, account: AccountId) -> Result<Option<Wallet>> {
        let state = self.state.read().await;
        Ok(state.wallets.get(&account).cloned())
    }

    async fn all_wallets(&self) -> Result<Vec<Wallet>> {
        let state = self.state.read().await;
        let mut wallets: Vec<Wallet> = state.wallets.values().cloned().collect();
        wallets.sort_by_key(|w| w.account);
        Ok(wallets)
    }

    async fn transactions(&self, account: AccountId) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state.ledger.get(&account).cloned().unwrap_or_default())
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .tx_index
            .get(&id)
            .and_then(|(wallet, pos)| state.ledger.get(wallet)?.get(*pos))
            .cloned())
    }

    async fn booking(&self, number: &BookingNumber) -> Result<Option<Booking>> {
        let state = self.state.read().await;
        Ok(state.bookings.get(number).cloned())
    }

    async fn bookings_by_customer(&self, account: AccountId) -> Result<Vec<Booking>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .bookings
                .values()
                .filter(|b| b.customer == account)
                .cloned()
                .collect(),
        ))
    }

    async fn bookings_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .bookings
                .values()
                .filter(|b| b.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn bookings_for_car(&self, car: CarId) -> Result<Vec<Booking>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .bookings
                .values()
                .filter(|b| b.car == car)
                .cloned()
                .collect(),
        ))
    }

    async fn booking_for_request(&self, key: &RequestKey) -> Result<Option<BookingNumber>> {
        let state = self.state.read().await;
        Ok(state.requests.get(key).cloned())
    }

    async fn next_sequence(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        state.sequence += 1;
        Ok(state.sequence)
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        let mut state = self.state.write().await;
        state.apply(commit)
    }
}

/// Car catalog seeded in memory (or from a CSV file, see
/// `interfaces::csv::car_reader`).
#[derive(Default, Clone)]
pub struct InMemoryCatalog {
    cars: Arc<RwLock<HashMap<CarId, CarListing>>>,
    /// Windows the owner has blocked on the car's calendar.
    blocked: Arc<RwLock<Vec<(CarId, DateTime<Utc>, DateTime<Utc>)>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, listing: CarListing) {
        self.cars.write().await.insert(listing.car, listing);
    }

    pub async fn block(&self, car: CarId, from: DateTime<Utc>, to: DateTime<Utc>) {
        self.blocked.write().await.push((car, from, to));
    }

    pub async fn len(&self) -> usize {
        self.cars.read().await.len()
    }
}

#[async_trait]
impl CarCatalog for InMemoryCatalog {
    async fn get_car(&self, car: CarId) -> Result<Option<CarListing>> {
        Ok(self.cars.read().await.get(&car).cloned())
    }

    async fn is_available(
        &self,
        car: CarId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.cars.read().await.contains_key(&car) {
            return Ok(false);
        }
        let blocked = self.blocked.read().await;
        Ok(!blocked
            .iter()
            .any(|(c, start, end)| *c == car && *start < to && from < *end))
    }
}

#[derive(Default, Clone)]
pub struct InMemoryProfiles {
    profiles: Arc<RwLock<HashMap<AccountId, CustomerProfile>>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, profile: CustomerProfile) {
        self.profiles.write().await.insert(profile.account, profile);
    }
}

#[async_trait]
impl ProfileProvider for InMemoryProfiles {
    async fn get_profile(&self, account: AccountId) -> Result<Option<CustomerProfile>> {
        Ok(self.profiles.read().await.get(&account).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementRules;
    use crate::domain::account::{Amount, DriverInfo};
    use crate::domain::booking::{BookingId, PaymentType};
    use crate::domain::ports::BookingWrite;
    use crate::domain::settlement::SettlementEngine;
    use chrono::Duration;

    const HOUSE: AccountId = AccountId(0);
    const CUSTOMER: AccountId = AccountId(1);

    fn engine() -> SettlementEngine {
        SettlementEngine::new(SettlementRules::default(), HOUSE)
    }

    fn pending_booking(number: &str) -> Booking {
        let now = Utc::now();
        Booking {
            id: BookingId::new(),
            number: BookingNumber::from(number),
            customer: CUSTOMER,
            car: CarId(3),
            car_owner: AccountId(2),
            pick_up: now + Duration::days(1),
            drop_off: now + Duration::days(2),
            base_price: 1_000,
            deposit: 400,
            payment_type: PaymentType::Wallet,
            status: BookingStatus::PendingDeposit,
            driver: DriverInfo::default(),
            cancellation: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    async fn funded_store(balance: i64) -> InMemoryStore {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.open_wallet(HOUSE, now).await.unwrap();
        store.open_wallet(CUSTOMER, now).await.unwrap();
        let reference = TransactionId::new();
        let e = engine();
        let request = e.top_up_requested(reference, CUSTOMER, Amount::new(balance).unwrap(), true, now);
        store
            .commit(Commit::new(e.policy()).with_settlement(request))
            .await
            .unwrap();
        let row = store.transaction(reference).await.unwrap().unwrap();
        store
            .commit(Commit::new(e.policy()).with_settlement(e.top_up_resolved(&row, true).unwrap()))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_open_wallet_is_idempotent() {
        let store = InMemoryStore::new();
        let first = store.open_wallet(CUSTOMER, Utc::now()).await.unwrap();
        let second = store.open_wallet(CUSTOMER, Utc::now()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.all_wallets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_applies_settlement_and_booking_together() {
        let store = funded_store(1_000).await;
        let booking = pending_booking("BK1");
        store
            .commit(Commit::new(engine().policy()).with_booking(BookingWrite::Insert(booking.clone())))
            .await
            .unwrap();

        let captured = booking.advanced(BookingStatus::WaitingConfirm, Utc::now());
        let settlement = engine().capture_deposit(&booking, Utc::now());
        store
            .commit(
                Commit::new(engine().policy())
                    .with_booking(BookingWrite::update(&booking, captured))
                    .with_settlement(settlement),
            )
            .await
            .unwrap();

        assert_eq!(store.wallet(CUSTOMER).await.unwrap().unwrap().balance, 600);
        assert_eq!(store.wallet(HOUSE).await.unwrap().unwrap().balance, 400);
        let stored = store.booking(&booking.number).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::WaitingConfirm);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_trace() {
        let store = funded_store(100).await;
        let booking = pending_booking("BK2");
        store
            .commit(Commit::new(engine().policy()).with_booking(BookingWrite::Insert(booking.clone())))
            .await
            .unwrap();

        let captured = booking.advanced(BookingStatus::WaitingConfirm, Utc::now());
        let result = store
            .commit(
                Commit::new(engine().policy())
                    .with_booking(BookingWrite::update(&booking, captured))
                    .with_settlement(engine().capture_deposit(&booking, Utc::now())),
            )
            .await;

        assert!(matches!(
            result,
            Err(RentalError::InsufficientBalance { .. })
        ));
        assert_eq!(store.wallet(CUSTOMER).await.unwrap().unwrap().balance, 100);
        assert_eq!(store.transactions(CUSTOMER).await.unwrap().len(), 1);
        assert_eq!(
            store.booking(&booking.number).await.unwrap().unwrap().status,
            BookingStatus::PendingDeposit
        );
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = InMemoryStore::new();
        let booking = pending_booking("BK3");
        store
            .commit(Commit::new(engine().policy()).with_booking(BookingWrite::Insert(booking.clone())))
            .await
            .unwrap();

        let first = booking.advanced(BookingStatus::Cancelled, Utc::now());
        store
            .commit(Commit::new(engine().policy()).with_booking(BookingWrite::update(&booking, first)))
            .await
            .unwrap();

        let second = booking.advanced(BookingStatus::WaitingConfirm, Utc::now());
        let err = store
            .commit(Commit::new(engine().policy()).with_booking(BookingWrite::update(&booking, second)))
            .await
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[tokio::test]
    async fn test_request_key_is_unique() {
        let store = InMemoryStore::new();
        let key = RequestKey {
            account: CUSTOMER,
            key: "req-1".to_string(),
        };
        store
            .commit(
                Commit::new(engine().policy())
                    .with_booking(BookingWrite::Insert(pending_booking("BK4")))
                    .with_request_key(Some(key.clone())),
            )
            .await
            .unwrap();
        assert_eq!(
            store.booking_for_request(&key).await.unwrap(),
            Some(BookingNumber::from("BK4"))
        );

        let err = store
            .commit(
                Commit::new(engine().policy())
                    .with_booking(BookingWrite::Insert(pending_booking("BK5")))
                    .with_request_key(Some(key)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT_DUPLICATE_REQUEST");
        assert!(store.booking(&BookingNumber::from("BK5")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catalog_availability() {
        let catalog = InMemoryCatalog::new();
        let now = Utc::now();
        catalog
            .insert(CarListing {
                car: CarId(1),
                owner: AccountId(2),
                deposit: 500,
                base_price: 1_000,
            })
            .await;
        catalog
            .block(CarId(1), now + Duration::days(3), now + Duration::days(4))
            .await;

        assert!(
            catalog
                .is_available(CarId(1), now + Duration::days(1), now + Duration::days(2))
                .await
                .unwrap()
        );
        assert!(
            !catalog
                .is_available(CarId(1), now + Duration::days(2), now + Duration::hours(80))
                .await
                .unwrap()
        );
        assert!(
            !catalog
                .is_available(CarId(9), now, now + Duration::days(1))
                .await
                .unwrap()
        );
    }
}
