//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `durapub` engine.
//!
//! This module centralizes reusable components, such as the error types and
//! logging setup, to promote consistency and reduce duplication.

pub mod error;
pub mod logging;

pub use error::{BrokerError, DeliveryError, StorageError};

#[cfg(test)]
mod tests;
