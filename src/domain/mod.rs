//! Domain model: entities, business rules and the ports the core talks to.

pub mod account;
pub mod booking;
pub mod ports;
pub mod rental_window;
pub mod settlement;
pub mod transaction;
pub mod wallet;
