//! Authentication module for login, logout and session validation.
//!
//! This module provides the HTTP surface and the orchestration service that
//! ties credential verification, installation token brokering and session
//! issuance together.

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod service;
