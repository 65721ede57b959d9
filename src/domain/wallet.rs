use super::account::AccountId;
use super::transaction::{Transaction, ledger_sum};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Balance of one account in minor units.
///
/// The wallet id is the account id. The balance is only ever changed by
/// committing a settlement, which appends the matching ledger rows in the
/// same write.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Wallet {
    pub account: AccountId,
    pub balance: i64,
    pub opened_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(account: AccountId, opened_at: DateTime<Utc>) -> Self {
        Self {
            account,
            balance: 0,
            opened_at,
        }
    }

    pub fn can_cover(&self, amount: i64) -> bool {
        self.balance >= amount
    }
}

/// Result of recomputing a wallet balance from its ledger.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct WalletAudit {
    pub account: AccountId,
    pub balance: i64,
    pub ledger_sum: i64,
    pub reconciled: bool,
}

impl WalletAudit {
    pub fn of(wallet: &Wallet, rows: &[Transaction]) -> Result<Self> {
        let sum = ledger_sum(rows)?;
        Ok(Self {
            account: wallet.account,
            balance: wallet.balance,
            ledger_sum: sum,
            reconciled: sum == wallet.balance,
        })
    }
}
