//! Shared building blocks for the HTTP API, such as the response envelope
//! and the mapping of service errors to HTTP responses.

pub mod common;
