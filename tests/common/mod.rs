#![allow(dead_code)]

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rentflow::application::bookings::CreateIntent;
use rentflow::application::engine::{Ports, RentalEngine};
use rentflow::config::RentalConfig;
use rentflow::domain::account::{AccountId, Address, CustomerProfile, DriverInfo};
use rentflow::domain::booking::{Booking, CarId, CarListing, PaymentType};
use rentflow::domain::ports::RepositoryBox;
use rentflow::domain::transaction::{Transaction, TransactionType};
use rentflow::infrastructure::clock::ManualClock;
use rentflow::infrastructure::gateway::{MockPaymentGateway, RESPONSE_APPROVED};
use rentflow::infrastructure::in_memory::{InMemoryCatalog, InMemoryProfiles, InMemoryStore};
use rentflow::infrastructure::notifier::RecordingNotifier;
use std::sync::Arc;

pub const HOUSE: AccountId = AccountId(0);
pub const OWNER: AccountId = AccountId(100);

/// 08:00 UTC, well inside service hours and before the late-booking cutoff.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 14, 8, 0, 0).unwrap()
}

pub fn complete_driver(name: &str) -> DriverInfo {
    DriverInfo {
        full_name: name.to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1992, 5, 17),
        national_id: format!("ID-{name}"),
        phone: "0912345678".to_string(),
        email: format!("{name}@example.com"),
        address: Address {
            city: "Hanoi".to_string(),
            district: "Cau Giay".to_string(),
            ward: "Dich Vong".to_string(),
            street: "144 Xuan Thuy".to_string(),
        },
        driving_license: Some(format!("licenses/{name}.png")),
    }
}

pub struct Harness {
    pub engine: Arc<RentalEngine>,
    pub clock: ManualClock,
    pub catalog: InMemoryCatalog,
    pub profiles: InMemoryProfiles,
    pub notifier: RecordingNotifier,
    pub gateway: MockPaymentGateway,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(RentalConfig::default()).await
    }

    pub async fn with_config(config: RentalConfig) -> Self {
        Self::with_repository(config, Box::new(InMemoryStore::new())).await
    }

    pub async fn with_repository(config: RentalConfig, repository: RepositoryBox) -> Self {
        let clock = ManualClock::new(start_time());
        let catalog = InMemoryCatalog::new();
        let profiles = InMemoryProfiles::new();
        let notifier = RecordingNotifier::new();
        let gateway = MockPaymentGateway::default();
        let engine = RentalEngine::new(
            config,
            Ports {
                repository,
                catalog: Box::new(catalog.clone()),
                profiles: Box::new(profiles.clone()),
                notifier: Box::new(notifier.clone()),
                gateway: Box::new(gateway.clone()),
                clock: Box::new(clock.clone()),
            },
        )
        .await
        .expect("engine starts");
        Self {
            engine: Arc::new(engine),
            clock,
            catalog,
            profiles,
            notifier,
            gateway,
        }
    }

    /// Lists a car owned by [`OWNER`].
    pub async fn add_car(&self, car: u64, deposit: i64, base_price: i64) -> CarId {
        self.catalog
            .insert(CarListing {
                car: CarId(car),
                owner: OWNER,
                deposit,
                base_price,
            })
            .await;
        CarId(car)
    }

    /// Registers a customer with a complete profile and an open wallet.
    pub async fn add_customer(&self, account: u64) -> AccountId {
        let id = AccountId(account);
        self.profiles
            .insert(CustomerProfile {
                account: id,
                email: format!("customer{account}@example.com"),
                active: true,
                driver: complete_driver(&format!("customer{account}")),
            })
            .await;
        self.engine.open_wallet(id).await.unwrap();
        id
    }

    /// Tops a wallet up through the sandbox gateway.
    pub async fn fund(&self, account: AccountId, amount: i64) {
        let ticket = self.engine.top_up(account, amount).await.unwrap();
        let callback = self.gateway.callback_for(ticket.transaction, RESPONSE_APPROVED);
        self.engine.handle_gateway_callback(&callback).await.unwrap();
    }

    /// A wallet-paid request for `car` starting `start_hours` from now.
    pub fn intent(&self, car: CarId, start_hours: i64, length_hours: i64) -> CreateIntent {
        let pick_up = self.clock_now() + Duration::hours(start_hours);
        CreateIntent {
            car,
            pick_up,
            drop_off: pick_up + Duration::hours(length_hours),
            payment_type: PaymentType::Wallet,
            driver: None,
            request_key: None,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.engine.now()
    }

    pub async fn balance(&self, account: AccountId) -> i64 {
        self.engine.get_wallet(account).await.unwrap().balance
    }

    pub async fn booking(&self, booking: &Booking) -> Booking {
        self.engine
            .get_booking(booking.customer, &booking.number)
            .await
            .unwrap()
    }

    pub async fn rows_of_type(&self, account: AccountId, r#type: TransactionType) -> Vec<Transaction> {
        self.engine
            .statement(account)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.r#type == r#type)
            .collect()
    }

    /// Every wallet balance equals the sum of its settled rows.
    pub async fn assert_ledger_closed(&self) {
        for audit in self.engine.audit_all().await.unwrap() {
            assert!(
                audit.reconciled,
                "wallet {} balance {} != ledger {}",
                audit.account, audit.balance, audit.ledger_sum
            );
        }
    }

    /// Advances the shared clock; the engine sees the new time immediately.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}
