//! Token verification building blocks.
//!
//! # Purpose
//! Houses the per-cluster OIDC verifier manager and the claims model used by
//! cluster detection and caller authentication.
//!
//! # Key invariants
//! - At most one verifier is constructed per cluster between invalidations.
//! - Token signatures are validated against the issuer pinned in config, not
//!   whatever the discovery document advertises.
pub mod claims;
pub mod verifier;

pub use claims::Claims;
pub use verifier::{TokenVerifier, VerifierInvalidator, VerifierManager, VerifyError};
