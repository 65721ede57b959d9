use crate::domain::transaction::Transaction;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct TransactionRecord {
    id: String,
    wallet: u64,
    r#type: String,
    amount: i64,
    status: String,
    booking: String,
    car: String,
    created_at: String,
}

impl From<&Transaction> for TransactionRecord {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id.to_string(),
            wallet: tx.wallet.0,
            r#type: tx.r#type.to_string(),
            amount: tx.amount,
            status: tx.status.to_string(),
            booking: tx.booking.as_ref().map(|b| b.to_string()).unwrap_or_default(),
            car: tx.car.map(|c| c.to_string()).unwrap_or_default(),
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// Writes a wallet statement, one ledger row per line.
pub struct TransactionWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> TransactionWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_transactions<'a>(
        &mut self,
        rows: impl IntoIterator<Item = &'a Transaction>,
    ) -> Result<()> {
        for row in rows {
            self.writer.serialize(TransactionRecord::from(row))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountId;
    use crate::domain::booking::{BookingNumber, CarId};
    use crate::domain::transaction::{TransactionId, TransactionStatus, TransactionType};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[test]
    fn test_writes_statement_rows() {
        let rows = vec![
            Transaction {
                id: TransactionId(Uuid::nil()),
                wallet: AccountId(1),
                r#type: TransactionType::PayDeposit,
                amount: -5_000,
                status: TransactionStatus::Successful,
                booking: Some(BookingNumber::from("BK20261014000001")),
                car: Some(CarId(3)),
                created_at: Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap(),
            },
            Transaction {
                id: TransactionId(Uuid::nil()),
                wallet: AccountId(1),
                r#type: TransactionType::TopUp,
                amount: 200,
                status: TransactionStatus::Processing,
                booking: None,
                car: None,
                created_at: Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0).unwrap(),
            },
        ];

        let mut out = Vec::new();
        TransactionWriter::new(&mut out)
            .write_transactions(&rows)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "id,wallet,type,amount,status,booking,car,created_at");
        assert_eq!(
            lines[1],
            "00000000-0000-0000-0000-000000000000,1,PAY_DEPOSIT,-5000,SUCCESSFUL,BK20261014000001,3,2026-10-14T09:00:00+00:00"
        );
        assert!(lines[2].contains(",TOP_UP,200,PROCESSING,,,"));
    }
}
