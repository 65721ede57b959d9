use super::account::AccountId;
use super::booking::{BookingNumber, CarId};
use crate::error::{RentalError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    TopUp,
    Withdraw,
    PayDeposit,
    RefundDeposit,
    OffsetFinalPayment,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionType::TopUp => "TOP_UP",
            TransactionType::Withdraw => "WITHDRAW",
            TransactionType::PayDeposit => "PAY_DEPOSIT",
            TransactionType::RefundDeposit => "REFUND_DEPOSIT",
            TransactionType::OffsetFinalPayment => "OFFSET_FINAL_PAYMENT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    #[default]
    Processing,
    Successful,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Processing)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Successful => "SUCCESSFUL",
            TransactionStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One row of a wallet's ledger.
///
/// `amount` is signed from the wallet's point of view: credits are positive,
/// debits negative. Only `Successful` rows contribute to the balance.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub wallet: AccountId,
    pub r#type: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    pub booking: Option<BookingNumber>,
    pub car: Option<CarId>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Contribution of this row to the wallet balance.
    pub fn settled_amount(&self) -> i64 {
        match self.status {
            TransactionStatus::Successful => self.amount,
            TransactionStatus::Processing | TransactionStatus::Failed => 0,
        }
    }
}

/// Sum of the settled amounts, i.e. the balance the rows imply.
pub fn ledger_sum<'a>(rows: impl IntoIterator<Item = &'a Transaction>) -> Result<i64> {
    rows.into_iter().try_fold(0i64, |sum, row| {
        sum.checked_add(row.settled_amount()).ok_or_else(|| {
            RentalError::ValidationError(format!("ledger sum overflows at row {}", row.id))
        })
    })
}
