use crate::domain::account::AccountId;
use crate::domain::booking::{Booking, BookingNumber, BookingStatus, CarId};
use crate::domain::ports::{Commit, Repository, RequestKey};
use crate::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::domain::wallet::Wallet;
use crate::error::{ConflictKind, RentalError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Wallet per account id.
pub const CF_WALLETS: &str = "wallets";
/// Ledger rows keyed by `account | ledger sequence`.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Transaction id to its key in `CF_TRANSACTIONS`.
pub const CF_TX_INDEX: &str = "tx_index";
pub const CF_BOOKINGS: &str = "bookings";
/// `account | request key` to booking number.
pub const CF_IDEMPOTENCY: &str = "idempotency";
pub const CF_META: &str = "meta";

const BOOKING_SEQUENCE: &[u8] = b"booking_sequence";
const LEDGER_SEQUENCE: &[u8] = b"ledger_sequence";

const COLUMN_FAMILIES: [&str; 6] = [
    CF_WALLETS,
    CF_TRANSACTIONS,
    CF_TX_INDEX,
    CF_BOOKINGS,
    CF_IDEMPOTENCY,
    CF_META,
];

/// A persistent repository on RocksDB.
///
/// Every commit is one `WriteBatch`, so a crash never leaves a booking
/// transition half applied. Read-check-write sequences run under
/// `commit_lock`; plain reads go straight to the database.
///
/// `Clone` shares the underlying `Arc<DB>` and lock.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RentalError::storage("corrupt counter value"))?;
    Ok(u64::from_be_bytes(raw))
}

fn ledger_prefix(account: AccountId) -> [u8; 8] {
    account.0.to_be_bytes()
}

fn ledger_key(account: AccountId, sequence: u64) -> Vec<u8> {
    let mut key = ledger_prefix(account).to_vec();
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn request_key(key: &RequestKey) -> Vec<u8> {
    let mut bytes = key.account.0.to_be_bytes().to_vec();
    bytes.extend_from_slice(key.key.as_bytes());
    bytes
}

impl RocksDBStore {
    /// Opens or creates a database at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RentalError::storage(format!("{name} column family not found")))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        match self.db.get_pinned_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn counter(&self, key: &[u8]) -> Result<u64> {
        match self.db.get_pinned_cf(self.cf(CF_META)?, key)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn bookings_where(&self, keep: impl Fn(&Booking) -> bool) -> Result<Vec<Booking>> {
        let mut bookings: Vec<Booking> = self
            .scan::<Booking>(CF_BOOKINGS, &[])?
            .into_iter()
            .filter(|b| keep(b))
            .collect();
        bookings.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.number.cmp(&b.number))
        });
        Ok(bookings)
    }

    fn ledger_row(&self, id: TransactionId) -> Result<Option<(Vec<u8>, Transaction)>> {
        let Some(key) = self.db.get_cf(self.cf(CF_TX_INDEX)?, id.0.as_bytes())? else {
            return Ok(None);
        };
        let row = self.get::<Transaction>(CF_TRANSACTIONS, &key)?;
        Ok(row.map(|row| (key, row)))
    }

    fn apply(&self, commit: Commit) -> Result<()> {
        let mut versions = HashMap::new();
        for write in &commit.bookings {
            let number = &write.booking().number;
            if let Some(stored) = self.get::<Booking>(CF_BOOKINGS, number.as_str())? {
                versions.insert(number.clone(), stored.version);
            }
        }
        commit.check_versions(|number| versions.get(number).copied())?;
        if let Some(key) = &commit.request_key
            && self
                .db
                .get_pinned_cf(self.cf(CF_IDEMPOTENCY)?, request_key(key))?
                .is_some()
        {
            return Err(RentalError::Conflict(ConflictKind::DuplicateRequest));
        }
        if commit.bookings.iter().any(|w| w.booking().status.holds_slot()) {
            commit.check_slots(&self.scan::<Booking>(CF_BOOKINGS, &[])?)?;
        }

        let mut batch = WriteBatch::default();

        if let Some(settlement) = &commit.settlement {
            for resolution in settlement.resolutions() {
                let (key, mut row) = self
                    .ledger_row(resolution.transaction())?
                    .ok_or_else(|| RentalError::not_found("transaction", resolution.transaction()))?;
                if row.status != TransactionStatus::Processing {
                    return Err(RentalError::Conflict(ConflictKind::AlreadyResolved));
                }
                row.status = resolution.status();
                batch.put_cf(self.cf(CF_TRANSACTIONS)?, key, encode(&row)?);
            }

            let mut wallets = HashMap::new();
            for account in settlement.deltas()?.keys() {
                if let Some(wallet) = self.get::<Wallet>(CF_WALLETS, account.0.to_be_bytes())? {
                    wallets.insert(*account, wallet);
                }
            }
            let projected = settlement.project_balances(
                |account| wallets.get(&account).map(|w| w.balance),
                &commit.policy,
            )?;
            for (account, balance) in projected {
                if let Some(wallet) = wallets.get_mut(&account) {
                    wallet.balance = balance;
                    batch.put_cf(self.cf(CF_WALLETS)?, account.0.to_be_bytes(), encode(wallet)?);
                }
            }

            let mut sequence = self.counter(LEDGER_SEQUENCE)?;
            for entry in settlement.entries() {
                sequence += 1;
                let key = ledger_key(entry.wallet, sequence);
                batch.put_cf(self.cf(CF_TX_INDEX)?, entry.id.0.as_bytes(), &key);
                batch.put_cf(self.cf(CF_TRANSACTIONS)?, key, encode(entry)?);
            }
            batch.put_cf(self.cf(CF_META)?, LEDGER_SEQUENCE, sequence.to_be_bytes());
        }

        if let (Some(key), Some(number)) = (&commit.request_key, commit.inserted_number()) {
            batch.put_cf(self.cf(CF_IDEMPOTENCY)?, request_key(key), number.as_str());
        }
        for write in &commit.bookings {
            let booking = write.booking();
            batch.put_cf(self.cf(CF_BOOKINGS)?, booking.number.as_str(), encode(booking)?);
        }

        self.db.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl Repository for RocksDBStore {
    async fn open_wallet(&self, account: AccountId, at: DateTime<Utc>) -> Result<Wallet> {
        let _guard = self.commit_lock.lock().await;
        if let Some(wallet) = self.get::<Wallet>(CF_WALLETS, account.0.to_be_bytes())? {
            return Ok(wallet);
        }
        let wallet = Wallet::new(account, at);
        self.db
            .put_cf(self.cf(CF_WALLETS)?, account.0.to_be_bytes(), encode(&wallet)?)?;
        Ok(wallet)
    }

    async fn wallet(&self, account: AccountId) -> Result<Option<Wallet>> {
        self.get(CF_WALLETS, account.0.to_be_bytes())
    }

    async fn all_wallets(&self) -> Result<Vec<Wallet>> {
        // Big-endian keys iterate in account order.
        self.scan(CF_WALLETS, &[])
    }

    async fn transactions(&self, account: AccountId) -> Result<Vec<Transaction>> {
        self.scan(CF_TRANSACTIONS, &ledger_prefix(account))
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.ledger_row(id)?.map(|(_, row)| row))
    }

    async fn booking(&self, number: &BookingNumber) -> Result<Option<Booking>> {
        self.get(CF_BOOKINGS, number.as_str())
    }

    async fn bookings_by_customer(&self, account: AccountId) -> Result<Vec<Booking>> {
        self.bookings_where(|b| b.customer == account)
    }

    async fn bookings_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>> {
        self.bookings_where(|b| b.status == status)
    }

    async fn bookings_for_car(&self, car: CarId) -> Result<Vec<Booking>> {
        self.bookings_where(|b| b.car == car)
    }

    async fn booking_for_request(&self, key: &RequestKey) -> Result<Option<BookingNumber>> {
        let value = self
            .db
            .get_cf(self.cf(CF_IDEMPOTENCY)?, request_key(key))?;
        value
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map(BookingNumber)
                    .map_err(|_| RentalError::storage("corrupt booking number"))
            })
            .transpose()
    }

    async fn next_sequence(&self) -> Result<u64> {
        let _guard = self.commit_lock.lock().await;
        let next = self.counter(BOOKING_SEQUENCE)? + 1;
        self.db
            .put_cf(self.cf(CF_META)?, BOOKING_SEQUENCE, next.to_be_bytes())?;
        Ok(next)
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        self.apply(commit)
    }
}
