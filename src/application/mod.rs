//! Application layer containing the booking and wallet orchestration.
//!
//! `RentalEngine` is the single entry point. Its operations are split by
//! concern: `bookings` holds the lifecycle, `wallets` the ledger surface,
//! and `scheduler` the periodic reconciliation driven through both.

pub mod bookings;
pub mod engine;
pub mod scheduler;
pub mod wallets;
