#![forbid(unsafe_code)]

//! Meteorological dataset acquisition.
//!
//! `indra` fetches datasets from two kinds of remote source and delivers them to object
//! storage:
//!
//! - the climate data store request/poll API ([`cds`]): submit a job, poll until it is
//!   ready, download the result;
//! - the forecast distribution file server ([`ecpds`]): deterministic URLs per run,
//!   forecast time and extension, downloaded in byte-range chunks and checked against the
//!   `.index` companion.
//!
//! Each invocation runs one dataset source as a job ([`job`]): resolve the date window,
//! build one request per region/variable or forecast time/extension, fetch on a bounded
//! worker pool, store and upload each artifact, then email a report.
//!
//! **Library use**
//! ```no_run
//! use std::sync::Arc;
//!
//! use indra::date::DateMode;
//! use indra::job::{Services, run_cds};
//! use indra::{CdsCredentials, HttpCdsApi, NotificationDispatcher, Params, SystemClock};
//!
//! let params = Params::load("params.yaml".as_ref())?;
//! let shared = &params.shared_params;
//! let services = Services {
//!     store: indra::storage::object_store_for(&shared.s3_bucket, shared.s3_region.as_deref())?,
//!     clock: Arc::new(SystemClock),
//!     notifier: NotificationDispatcher::from_env(shared.email_recipients.clone(), None),
//! };
//! let api = Arc::new(HttpCdsApi::new(&CdsCredentials::load()?)?);
//! let result = run_cds(&params, DateMode::CurrentMonth, api, &services)?;
//! println!("{}: {}", result.dataset, result.status());
//! # Ok::<(), indra::Error>(())
//! ```

pub mod cds;
pub mod cli;
pub mod config;
pub mod date;
pub mod ecpds;
mod error;
pub mod job;
pub mod logging;
pub mod notify;
pub mod request;
pub mod retry;
mod sources;
pub mod storage;
mod url_builder;

pub use crate::cds::{CdsFetcher, HttpCdsApi};
pub use crate::config::{CdsCredentials, Params};
pub use crate::ecpds::{EcpdsFetcher, HttpFileServer};
pub use crate::error::{Error, Result};
pub use crate::job::{JobResult, JobStatus};
pub use crate::notify::NotificationDispatcher;
pub use crate::retry::SystemClock;
