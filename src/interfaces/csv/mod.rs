//! CSV adapters: the car catalog loader and the ledger report writers.

pub mod car_reader;
pub mod transaction_writer;
pub mod wallet_writer;
