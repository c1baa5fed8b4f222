//! Intake of homework submissions: policy checks, durable storage of each
//! version and delivery of testing bundles to tester queues.

#![warn(non_ascii_idents, trivial_numeric_casts,
    noop_method_call, single_use_lifetimes, trivial_casts,
    unused_lifetimes, nonstandard_style)]
#![deny(keyword_idents)]
#![allow(clippy::needless_return)]

pub mod archive;
pub mod bundle;
pub mod config;
pub mod course;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod locks;
pub mod logging;
pub mod paths;
pub mod policy;
pub mod record;
pub mod store;
pub mod submit;
pub mod timestamp;

pub use error::{Error, ErrorKind, Result};
pub use submit::{Intake, Services, SubmitRequest};
