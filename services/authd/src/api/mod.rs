//! HTTP API handlers.
//!
//! # Purpose
//! Exposes the TokenReview endpoint plus lightweight service metadata
//! endpoints, and centralizes the TokenReview-envelope error responses.
pub mod error;
pub mod system;
pub mod tokenreview;
