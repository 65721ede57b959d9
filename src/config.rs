//! Tunable business rules.
//!
//! Every field has a default matching the production policy, so a config
//! file only needs to list what it overrides.

use crate::domain::account::AccountId;
use crate::error::{RentalError, Result};
use chrono::{Duration, FixedOffset};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RentalConfig {
    /// Platform account acting as escrow for every deposit.
    pub house_account: AccountId,
    pub window: WindowRules,
    pub settlement: SettlementRules,
    pub reconciliation: ReconciliationConfig,
}

impl Default for RentalConfig {
    fn default() -> Self {
        Self {
            house_account: AccountId(0),
            window: WindowRules::default(),
            settlement: SettlementRules::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl RentalConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RentalConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.window;
        if w.service_open_hour >= w.service_close_hour || w.service_close_hour > 24 {
            return Err(RentalError::ValidationError(format!(
                "service window {}:00-{}:00 is empty",
                w.service_open_hour, w.service_close_hour
            )));
        }
        if w.min_rental_minutes <= 0 || w.max_rental_days <= 0 {
            return Err(RentalError::ValidationError(
                "rental duration bounds must be positive".to_string(),
            ));
        }
        let s = &self.settlement;
        let rates = [
            s.confirmed_customer_refund,
            s.confirmed_owner_share,
            s.commission,
        ];
        if rates.iter().any(|r| *r < Decimal::ZERO || *r > Decimal::ONE) {
            return Err(RentalError::ValidationError(
                "settlement rates must lie in [0, 1]".to_string(),
            ));
        }
        if s.confirmed_customer_refund + s.confirmed_owner_share > Decimal::ONE {
            return Err(RentalError::ValidationError(
                "confirmed-cancellation shares exceed the deposit".to_string(),
            ));
        }
        if self.reconciliation.interval_secs == 0 {
            return Err(RentalError::ValidationError(
                "reconciliation interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Constraints on the requested pick-up/drop-off window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowRules {
    pub min_pick_up_lead_minutes: i64,
    pub max_pick_up_advance_days: i64,
    pub min_drop_off_lead_minutes: i64,
    pub min_rental_minutes: i64,
    pub max_rental_days: i64,
    pub service_open_hour: u32,
    pub service_close_hour: u32,
    /// Bookings placed at or after this local hour cannot start the same day.
    pub late_booking_hour: u32,
    /// Offset of the service's local time from UTC.
    pub utc_offset_minutes: i32,
}

impl Default for WindowRules {
    fn default() -> Self {
        Self {
            min_pick_up_lead_minutes: 120,
            max_pick_up_advance_days: 60,
            min_drop_off_lead_minutes: 240,
            min_rental_minutes: 120,
            max_rental_days: 30,
            service_open_hour: 6,
            service_close_hour: 22,
            late_booking_hour: 20,
            utc_offset_minutes: 0,
        }
    }
}

impl WindowRules {
    pub fn local_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            RentalError::ValidationError(format!(
                "invalid utc offset {} minutes",
                self.utc_offset_minutes
            ))
        })
    }

    pub fn min_pick_up_lead(&self) -> Duration {
        Duration::minutes(self.min_pick_up_lead_minutes)
    }

    pub fn max_pick_up_advance(&self) -> Duration {
        Duration::days(self.max_pick_up_advance_days)
    }

    pub fn min_drop_off_lead(&self) -> Duration {
        Duration::minutes(self.min_drop_off_lead_minutes)
    }

    pub fn min_rental(&self) -> Duration {
        Duration::minutes(self.min_rental_minutes)
    }

    pub fn max_rental(&self) -> Duration {
        Duration::days(self.max_rental_days)
    }
}

/// What happens when a settlement would push the house wallet below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseFloorPolicy {
    /// Commit anyway and log an error event.
    #[default]
    Alert,
    /// Reject the settlement with `InsufficientBalance`.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementRules {
    /// Share of the deposit returned to the customer on a confirmed cancel.
    pub confirmed_customer_refund: Decimal,
    /// Share paid to the car owner on a confirmed cancel.
    pub confirmed_owner_share: Decimal,
    /// Platform commission withheld from the owner's rental payout.
    pub commission: Decimal,
    pub house_floor: HouseFloorPolicy,
}

impl Default for SettlementRules {
    fn default() -> Self {
        Self {
            confirmed_customer_refund: dec!(0.70),
            confirmed_owner_share: dec!(0.22),
            commission: dec!(0.08),
            house_floor: HouseFloorPolicy::Alert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionMode {
    /// Promote every funded candidate in one ordered pass.
    #[default]
    AllEligible,
    /// End the tick after the first promotion.
    FirstOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    pub pending_deposit_ttl_minutes: i64,
    pub promotion: PromotionMode,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            pending_deposit_ttl_minutes: 60,
            promotion: PromotionMode::AllEligible,
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn pending_deposit_ttl(&self) -> Duration {
        Duration::minutes(self.pending_deposit_ttl_minutes)
    }
}
