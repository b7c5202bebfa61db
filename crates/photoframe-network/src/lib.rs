//! Network surfaces: the HTTP chunk protocol and the device registration socket.

pub mod http;
pub mod registration;

pub use http::{router, serve_chunks, ApiError};
pub use registration::{parse_registration, serve_registration};

#[cfg(test)]
pub(crate) mod testing;
