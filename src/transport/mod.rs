//! The `transport` module hands message payloads to subscriber endpoints.
//!
//! [`Deliver`] is the seam between the delivery engine and the network:
//! [`HttpDeliverer`] POSTs the raw JSON payload to the subscription URL and
//! treats exactly HTTP 200 as success. Tests substitute scripted deliverers.

pub mod http;

pub use http::{Deliver, HttpDeliverer};

#[cfg(test)]
mod tests;
