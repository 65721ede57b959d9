use crate::domain::account::AccountId;
use crate::domain::booking::{CarId, CarListing};
use crate::error::{RentalError, Result};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct CarRecord {
    car: u64,
    owner: u64,
    deposit: i64,
    base_price: i64,
}

impl TryFrom<CarRecord> for CarListing {
    type Error = RentalError;

    fn try_from(record: CarRecord) -> Result<Self> {
        if record.deposit < 0 {
            return Err(RentalError::ValidationError(format!(
                "car {}: deposit cannot be negative",
                record.car
            )));
        }
        if record.base_price <= 0 {
            return Err(RentalError::ValidationError(format!(
                "car {}: base price must be positive",
                record.car
            )));
        }
        Ok(CarListing {
            car: CarId(record.car),
            owner: AccountId(record.owner),
            deposit: record.deposit,
            base_price: record.base_price,
        })
    }
}

/// Reads car listings (`car, owner, deposit, base_price`) from a CSV source.
///
/// Whitespace around fields is trimmed. Each row yields its own result, so
/// one bad line does not hide the others.
pub struct CarReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CarReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes and validates the listings.
    pub fn cars(self) -> impl Iterator<Item = Result<CarListing>> {
        self.reader
            .into_deserialize::<CarRecord>()
            .map(|record| record.map_err(RentalError::from).and_then(CarListing::try_from))
    }
}
