use crate::domain::wallet::WalletAudit;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct AuditRecord {
    account: u64,
    balance: i64,
    ledger_sum: i64,
    reconciled: bool,
}

/// Writes wallet audits as `account,balance,ledger_sum,reconciled`.
pub struct WalletWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> WalletWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_audits(&mut self, audits: impl IntoIterator<Item = WalletAudit>) -> Result<()> {
        for audit in audits {
            self.writer.serialize(AuditRecord {
                account: audit.account.0,
                balance: audit.balance,
                ledger_sum: audit.ledger_sum,
                reconciled: audit.reconciled,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
