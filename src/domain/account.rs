use crate::error::RentalError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an account, handed to the core already authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A strictly positive amount in minor currency units.
///
/// Requests (top-up, withdraw) carry an `Amount`; balances and ledger rows
/// are plain signed `i64` because they can be debits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(i64);

impl Amount {
    pub fn new(value: i64) -> Result<Self, RentalError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(RentalError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = RentalError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub district: String,
    pub ward: String,
    pub street: String,
}

impl Address {
    pub fn is_complete(&self) -> bool {
        [&self.city, &self.district, &self.ward, &self.street]
            .iter()
            .all(|part| !part.trim().is_empty())
    }
}

/// Driver details frozen onto a booking.
///
/// Editing the customer's profile later does not touch bookings that were
/// already made; only an explicit booking edit replaces the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub full_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub national_id: String,
    pub phone: String,
    pub email: String,
    pub address: Address,
    /// Reference returned by the document store for the uploaded license.
    pub driving_license: Option<String>,
}

impl DriverInfo {
    /// Names of the fields that still need a value.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.full_name.trim().is_empty() {
            missing.push("full_name");
        }
        if self.date_of_birth.is_none() {
            missing.push("date_of_birth");
        }
        if self.national_id.trim().is_empty() {
            missing.push("national_id");
        }
        if self.phone.trim().is_empty() {
            missing.push("phone");
        }
        if !self.address.is_complete() {
            missing.push("address");
        }
        if self
            .driving_license
            .as_deref()
            .is_none_or(|r| r.trim().is_empty())
        {
            missing.push("driving_license");
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

/// Customer profile as served by the profile provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub account: AccountId,
    pub email: String,
    pub active: bool,
    pub driver: DriverInfo,
}

impl CustomerProfile {
    pub fn is_complete(&self) -> bool {
        self.driver.is_complete()
    }
}
