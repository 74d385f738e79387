//! Module for core business logic services.
//!
//! This module holds the three collaborators behind a login: credential
//! verification, installation token brokering and session bookkeeping.

pub mod credential_verifier;
pub mod github_app;
pub mod session_registry;
pub mod token_broker;
