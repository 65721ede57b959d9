use crate::config::RentalConfig;
use crate::domain::booking::{Booking, BookingNumber, BookingStatus};
use crate::domain::ports::{
    CarCatalogBox, ClockBox, NotificationKind, NotificationParams, NotifierBox,
    PaymentGatewayBox, ProfileProviderBox, RepositoryBox,
};
use crate::domain::settlement::{LedgerPolicy, SettlementEngine};
use crate::error::{RentalError, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// The collaborators the engine runs against.
pub struct Ports {
    pub repository: RepositoryBox,
    pub catalog: CarCatalogBox,
    pub profiles: ProfileProviderBox,
    pub notifier: NotifierBox,
    pub gateway: PaymentGatewayBox,
    pub clock: ClockBox,
}

/// The entry point for every booking and wallet operation.
///
/// `RentalEngine` owns the ports and the settlement rules. Operations take
/// the calling account explicitly. Every state change goes through one
/// atomic repository commit; notifications are sent after it succeeds.
/// Request handlers and the reconciliation scheduler share one engine
/// behind an `Arc`.
pub struct RentalEngine {
    pub(crate) repository: RepositoryBox,
    pub(crate) catalog: CarCatalogBox,
    pub(crate) profiles: ProfileProviderBox,
    notifier: NotifierBox,
    pub(crate) gateway: PaymentGatewayBox,
    clock: ClockBox,
    config: RentalConfig,
    pub(crate) settlement: SettlementEngine,
}

impl RentalEngine {
    /// Creates the engine and makes sure the house wallet exists.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an inconsistent configuration and
    /// `StorageError` if the house wallet cannot be opened.
    pub async fn new(config: RentalConfig, ports: Ports) -> Result<Self> {
        config.validate()?;
        let settlement = SettlementEngine::new(config.settlement.clone(), config.house_account);
        let engine = Self {
            repository: ports.repository,
            catalog: ports.catalog,
            profiles: ports.profiles,
            notifier: ports.notifier,
            gateway: ports.gateway,
            clock: ports.clock,
            config,
            settlement,
        };
        let now = engine.now();
        engine
            .repository
            .open_wallet(engine.config.house_account, now)
            .await?;
        Ok(engine)
    }

    pub fn config(&self) -> &RentalConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn policy(&self) -> LedgerPolicy {
        self.settlement.policy()
    }

    /// All bookings in `status`, oldest first (ties by booking number).
    pub async fn bookings_with_status(&self, status: BookingStatus) -> Result<Vec<Booking>> {
        self.repository.bookings_by_status(status).await
    }

    /// Sends `kind` to the booking's customer. Delivery failures are
    /// logged and swallowed.
    pub(crate) async fn notify(&self, booking: &Booking, kind: NotificationKind) {
        let email = match self.profiles.get_profile(booking.customer).await {
            Ok(Some(profile)) => profile.email,
            Ok(None) => {
                warn!(booking = %booking.number, customer = %booking.customer, "No profile to notify");
                return;
            }
            Err(e) => {
                warn!(booking = %booking.number, error = %e, "Profile lookup failed, notification dropped");
                return;
            }
        };

        let params = notification_params(booking);
        match self.notifier.notify(&email, kind, &params).await {
            Ok(()) => debug!(booking = %booking.number, template = kind.template(), "Notification sent"),
            Err(e) => warn!(
                booking = %booking.number,
                template = kind.template(),
                error = %e,
                "Notification failed"
            ),
        }
    }

    pub(crate) async fn load_booking(&self, number: &BookingNumber) -> Result<Booking> {
        self.repository
            .booking(number)
            .await?
            .ok_or_else(|| RentalError::not_found("booking", number))
    }
}

fn notification_params(booking: &Booking) -> NotificationParams {
    NotificationParams::from([
        ("booking", booking.number.to_string()),
        ("status", booking.status.to_string()),
        ("car", booking.car.to_string()),
        ("pick_up", booking.pick_up.to_rfc3339()),
        ("drop_off", booking.drop_off.to_rfc3339()),
        ("deposit", booking.deposit.to_string()),
    ])
}
