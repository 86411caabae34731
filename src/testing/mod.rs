//! Testing utilities and mock implementations
//!
//! Lets the client core be exercised without a broker or wall-clock timers.

pub mod mocks;

pub use mocks::*;
