//! OpenParcel: multi-tenant parcel-tracking aggregation.
//!
//! `C1`-`C8` from the design live here as plain library modules; the two
//! binaries (`bin/server.rs`, `bin/opm.rs`) wire them into an HTTP service
//! and an operator CLI respectively.

pub mod auth;
pub mod cache;
pub mod carriers;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod pool;
pub mod proxy;
pub mod reqbundle;
pub mod request_id;
pub mod service;
pub mod store;

pub use error::{OpenParcelError, Result};
pub use service::Service;
