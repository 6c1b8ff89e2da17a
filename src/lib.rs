//! # rustharvest
//!
//! PubMed literature harvester with OpenAlex/iCite citation reconciliation.
//!
//! ## Modules
//!
//! - [`cursor`] - Paged, resumable search cursor and year histogram
//! - [`pubmed`] - NCBI E-utilities client (ESearch, ESummary, EFetch)
//! - [`metadata`] - Batched metadata fetching with DOI fallback
//! - [`citation`] - Citation source abstraction
//! - [`openalex`] - OpenAlex citation adapter
//! - [`icite`] - NIH iCite citation adapter
//! - [`reconcile`] - Citation reconciliation policies
//! - [`dataset`] - Dataset assembly, KPIs and persistence
//! - [`harvest`] - Pipeline driver
//! - [`config`] - Run configuration and provider defaults
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustharvest::config::{Credentials, Endpoints, HarvestConfig, HarvestRequest, Tuning};
//! use rustharvest::harvest::{CancelFlag, Harvester};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarvestConfig {
//!         request: HarvestRequest::new("corona"),
//!         credentials: Credentials {
//!             email: "me@example.org".to_string(),
//!             ncbi_api_key: None,
//!             openalex_mailto: None,
//!         },
//!         endpoints: Endpoints::default(),
//!         tuning: Tuning::default(),
//!         outfile: "results.json".into(),
//!         csv_out: None,
//!     };
//!     let run = Harvester::from_config(&config)?
//!         .run(&config.request, &CancelFlag::new())
//!         .await?;
//!     println!("Harvested {} records", run.records.len());
//!     Ok(())
//! }
//! ```

pub mod citation;
pub mod config;
pub mod cursor;
pub mod dataset;
pub mod error;
pub mod harvest;
pub mod http;
pub mod icite;
pub mod metadata;
pub mod openalex;
pub mod pubmed;
pub mod reconcile;
pub mod retry;

pub use error::{HarvestError, Result};
