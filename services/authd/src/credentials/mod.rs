//! Remote-cluster credential lifecycle.
//!
//! # Purpose
//! Holds the thread-safe credential store with Kubernetes Secret persistence
//! and the per-cluster renewal loops that keep bearer tokens fresh.
//!
//! # Key invariants
//! - If a store entry exists for a cluster, both `token` and `ca_cert` are
//!   non-empty.
//! - All credential mutation flows through [`store::CredentialStore::set`],
//!   which swaps under the write lock and persists after releasing it.
pub mod renewer;
pub mod store;

pub use renewer::{Renewer, TokenMinter};
pub use store::{CredentialStore, Credentials, StoreError};

/// Splits a PEM bundle into the DER certificates a `kube::Config` expects.
/// Undecodable blocks are skipped; TLS setup will fail loudly later if the
/// bundle was unusable.
pub fn ca_bundle_der(pem: &[u8]) -> Vec<Vec<u8>> {
    x509_parser::pem::Pem::iter_from_buffer(pem)
        .filter_map(|block| block.ok().map(|block| block.contents))
        .collect()
}
