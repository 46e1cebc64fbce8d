//! Federated TokenReview service library crate.
//!
//! # Purpose
//! Exposes the TokenReview API surface, per-cluster OIDC verification,
//! credential storage and renewal, and configuration for use by the binary
//! and integration tests.
//!
//! # Notes
//! Module boundaries mirror the request pipeline: `api` handles HTTP, `auth`
//! verifies token signatures, `credentials` keeps remote-cluster access alive.
pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod observability;
