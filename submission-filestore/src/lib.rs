//! Transports for delivering testing bundles into tester queues.

#![warn(missing_docs, non_ascii_idents, trivial_numeric_casts,
    noop_method_call, single_use_lifetimes, trivial_casts,
    unused_lifetimes, nonstandard_style)]
#![allow(clippy::needless_return)]

mod filestore;
pub mod errors;
#[allow(missing_docs)]
pub mod transport;

pub use filestore::FileStore;
pub use transport::sftp::{HostIdentity, SftpParameters};

#[cfg(test)]
mod tests;
