//! Harvest configuration.
//!
//! Defaults mirror the limits documented by each provider: NCBI allows
//! 10 req/s with an API key and 3 req/s without, OpenAlex and iCite 10 req/s
//! for polite clients.

use crate::error::{HarvestError, Result};
use crate::reconcile::CitationPolicy;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// NCBI E-utilities base URL
pub const PUBMED_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
/// OpenAlex API base URL
pub const OPENALEX_BASE: &str = "https://api.openalex.org";
/// NIH iCite API base URL
pub const ICITE_BASE: &str = "https://icite.od.nih.gov";

pub const NCBI_RATE_WITH_KEY: u32 = 10;
pub const NCBI_RATE_WITHOUT_KEY: u32 = 3;
pub const OPENALEX_RATE: u32 = 10;
pub const ICITE_RATE: u32 = 10;

/// Identifiers per ESearch page
pub const DEFAULT_PAGE_SIZE: usize = 500;
/// Identifiers per metadata batch (ESummary)
pub const METADATA_BATCH_SIZE: usize = 200;
/// PMIDs per OpenAlex `ids.pmid` filter (OR-filter limit)
pub const OPENALEX_BATCH_SIZE: usize = 100;
/// PMIDs per iCite request
pub const ICITE_BATCH_SIZE: usize = 500;
/// Records per run unless overridden
pub const DEFAULT_MAX_RECORDS: usize = 10_000;
/// Concurrent requests within a stage
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Which citation providers to query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationsSource {
    OpenAlex,
    ICite,
    #[default]
    Both,
}

impl CitationsSource {
    pub fn uses_openalex(self) -> bool {
        matches!(self, CitationsSource::OpenAlex | CitationsSource::Both)
    }

    pub fn uses_icite(self) -> bool {
        matches!(self, CitationsSource::ICite | CitationsSource::Both)
    }
}

impl FromStr for CitationsSource {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openalex" => Ok(CitationsSource::OpenAlex),
            "icite" => Ok(CitationsSource::ICite),
            "both" => Ok(CitationsSource::Both),
            other => Err(HarvestError::Config(format!(
                "Unknown citations source '{}' (expected openalex, icite or both)",
                other
            ))),
        }
    }
}

impl fmt::Display for CitationsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CitationsSource::OpenAlex => "openalex",
            CitationsSource::ICite => "icite",
            CitationsSource::Both => "both",
        };
        f.write_str(name)
    }
}

/// What to harvest: the query and how to treat citations
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub query: String,
    /// Inclusive start year
    pub start_year: Option<i32>,
    /// Inclusive end year
    pub end_year: Option<i32>,
    pub citations_source: CitationsSource,
    pub citations_policy: CitationPolicy,
    /// Cap on records fetched in one run
    pub max_records: usize,
}

impl HarvestRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            start_year: None,
            end_year: None,
            citations_source: CitationsSource::default(),
            citations_policy: CitationPolicy::default(),
            max_records: DEFAULT_MAX_RECORDS,
        }
    }

    /// Check the request before any network call is made
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(HarvestError::Validation("query must not be empty".to_string()));
        }
        if let (Some(start), Some(end)) = (self.start_year, self.end_year) {
            if start > end {
                return Err(HarvestError::Validation(format!(
                    "start year {} is after end year {}",
                    start, end
                )));
            }
        }
        if self.max_records == 0 {
            return Err(HarvestError::Validation(
                "max records must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pipeline sizing shared by every stage
#[derive(Debug, Clone)]
pub struct Tuning {
    pub page_size: usize,
    pub metadata_batch_size: usize,
    pub openalex_batch_size: usize,
    pub icite_batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            metadata_batch_size: METADATA_BATCH_SIZE,
            openalex_batch_size: OPENALEX_BATCH_SIZE,
            icite_batch_size: ICITE_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

impl Tuning {
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("page size", self.page_size),
            ("metadata batch size", self.metadata_batch_size),
            ("OpenAlex batch size", self.openalex_batch_size),
            ("iCite batch size", self.icite_batch_size),
            ("concurrency", self.concurrency),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(HarvestError::Validation(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Provider endpoints, overridable for testing against local servers
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub pubmed: String,
    pub openalex: String,
    pub icite: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            pubmed: PUBMED_BASE.to_string(),
            openalex: OPENALEX_BASE.to_string(),
            icite: ICITE_BASE.to_string(),
        }
    }
}

/// Contact details some providers require under their usage policy
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Contact e-mail sent to NCBI (required)
    pub email: String,
    /// Optional NCBI API key (raises the rate limit)
    pub ncbi_api_key: Option<String>,
    /// Address for the OpenAlex polite pool, defaults to `email`
    pub openalex_mailto: Option<String>,
}

impl Credentials {
    pub fn openalex_mailto(&self) -> &str {
        self.openalex_mailto.as_deref().unwrap_or(&self.email)
    }

    pub fn ncbi_rate(&self) -> u32 {
        if self.ncbi_api_key.is_some() {
            NCBI_RATE_WITH_KEY
        } else {
            NCBI_RATE_WITHOUT_KEY
        }
    }
}

/// Everything one harvest invocation needs
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub request: HarvestRequest,
    pub credentials: Credentials,
    pub endpoints: Endpoints,
    pub tuning: Tuning,
    /// Destination of the persisted dataset
    pub outfile: PathBuf,
    /// Optional flat CSV export of the records
    pub csv_out: Option<PathBuf>,
}

impl HarvestConfig {
    pub fn validate(&self) -> Result<()> {
        let email = self.credentials.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(HarvestError::Config(
                "a contact e-mail is required (set ENTREZ_EMAIL or pass --email)".to_string(),
            ));
        }
        self.request.validate()?;
        self.tuning.validate()
    }
}
