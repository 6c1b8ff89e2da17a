//! PubMed E-utilities client
//!
//! Implements [`SearchBackend`] on ESearch (history server: `WebEnv` +
//! `query_key`) and [`MetadataBackend`] on ESummary (JSON) with EFetch (XML)
//! as the detailed-record fallback.
//!
//! API Details:
//! - 3 req/s without an API key, 10 req/s with one
//! - `email` and `tool` identify the caller per NCBI usage policy
//! - Each call here is a single attempt; callers add retries

use crate::config::NCBI_RATE_WITHOUT_KEY;
use crate::cursor::{SearchBackend, SearchHandle};
use crate::error::{HarvestError, OptionExt, Result};
use crate::http::{get_text, RateLimiter};
use crate::metadata::{ArticleMeta, DetailedRecord, MetadataBackend};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Tool name reported to NCBI
const TOOL: &str = "rustharvest";

// === ESearch ===

#[derive(Debug, Deserialize)]
struct ESearchEnvelope {
    esearchresult: Option<ESearchResult>,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    count: Option<String>,
    webenv: Option<String>,
    querykey: Option<String>,
    idlist: Option<Vec<String>>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

// === ESummary ===

#[derive(Debug, Deserialize)]
struct ESummaryEnvelope {
    result: Option<serde_json::Map<String, serde_json::Value>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryDoc {
    title: Option<String>,
    fulljournalname: Option<String>,
    source: Option<String>,
    pubdate: Option<String>,
    authors: Option<Vec<SummaryAuthor>>,
    articleids: Option<Vec<SummaryArticleId>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryAuthor {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryArticleId {
    idtype: Option<String>,
    value: Option<String>,
}

// === EFetch (XML) ===

#[derive(Debug, Deserialize)]
struct PubmedArticleSet {
    #[serde(rename = "PubmedArticle", default)]
    articles: Vec<PubmedArticle>,
}

#[derive(Debug, Deserialize)]
struct PubmedArticle {
    #[serde(rename = "MedlineCitation")]
    medline: Option<MedlineCitation>,
    #[serde(rename = "PubmedData")]
    pubmed_data: Option<PubmedData>,
}

#[derive(Debug, Deserialize)]
struct MedlineCitation {
    #[serde(rename = "PMID")]
    pmid: Option<TextNode>,
    #[serde(rename = "Article")]
    article: Option<XmlArticle>,
}

#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct XmlArticle {
    #[serde(rename = "ELocationID", default)]
    elocation_ids: Vec<TypedId>,
    #[serde(rename = "AuthorList")]
    author_list: Option<XmlAuthorList>,
}

/// `<ELocationID EIdType="doi">` / `<ArticleId IdType="doi">`
#[derive(Debug, Deserialize)]
struct TypedId {
    #[serde(rename = "@EIdType")]
    eid_type: Option<String>,
    #[serde(rename = "@IdType")]
    id_type: Option<String>,
    #[serde(rename = "$text", default)]
    value: String,
}

impl TypedId {
    fn is_doi(&self) -> bool {
        let kind = self.eid_type.as_deref().or(self.id_type.as_deref());
        kind.is_some_and(|k| k.eq_ignore_ascii_case("doi")) && !self.value.trim().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct XmlAuthorList {
    #[serde(rename = "Author", default)]
    authors: Vec<XmlAuthor>,
}

#[derive(Debug, Deserialize)]
struct XmlAuthor {
    #[serde(rename = "AffiliationInfo", default)]
    affiliations: Vec<AffiliationInfo>,
}

#[derive(Debug, Deserialize)]
struct AffiliationInfo {
    #[serde(rename = "Affiliation")]
    affiliation: Option<TextNode>,
}

#[derive(Debug, Deserialize)]
struct PubmedData {
    #[serde(rename = "ArticleIdList")]
    article_ids: Option<ArticleIdList>,
}

#[derive(Debug, Deserialize)]
struct ArticleIdList {
    #[serde(rename = "ArticleId", default)]
    ids: Vec<TypedId>,
}

/// NCBI E-utilities client
pub struct PubMedClient {
    client: Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
    email: String,
    api_key: Option<String>,
}

impl PubMedClient {
    /// Create a new PubMedClient
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `base_url` - E-utilities base, e.g. `https://eutils.ncbi.nlm.nih.gov/entrez/eutils`
    /// * `email` - Contact e-mail required by NCBI
    pub fn new(client: Client, base_url: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            client,
            limiter: Arc::new(RateLimiter::per_second(NCBI_RATE_WITHOUT_KEY)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            api_key: None,
        }
    }

    /// Use an API key; pass the matching (faster) limiter alongside
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("tool", TOOL.to_string()),
            ("email", self.email.clone()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    async fn esearch(&self, extra: Vec<(&'static str, String)>) -> Result<ESearchResult> {
        let mut params = self.base_params();
        params.push(("retmode", "json".to_string()));
        params.extend(extra);

        let body = get_text(&self.client, &self.limiter, &self.endpoint("esearch.fcgi"), &params).await?;
        parse_esearch(&body)
    }
}

#[async_trait]
impl SearchBackend for PubMedClient {
    async fn open(&self, term: &str) -> Result<SearchHandle> {
        debug!(term = term, "ESearch (history)");
        let result = self
            .esearch(vec![
                ("term", term.to_string()),
                ("usehistory", "y".to_string()),
                ("retmax", "0".to_string()),
                ("datetype", "pdat".to_string()),
            ])
            .await?;

        Ok(SearchHandle {
            count: parse_count(result.count.as_deref())?,
            web_env: result.webenv.ok_or_malformed("ESearch response has no webenv")?,
            query_key: result
                .querykey
                .ok_or_malformed("ESearch response has no querykey")?,
        })
    }

    async fn fetch_ids(&self, handle: &SearchHandle, offset: u64, limit: u64) -> Result<Vec<String>> {
        debug!(offset = offset, limit = limit, "ESearch page");
        let result = self
            .esearch(vec![
                ("term", format!("#{}", handle.query_key)),
                ("WebEnv", handle.web_env.clone()),
                ("usehistory", "y".to_string()),
                ("retstart", offset.to_string()),
                ("retmax", limit.to_string()),
            ])
            .await?;

        Ok(result.idlist.unwrap_or_default())
    }

    async fn count(&self, term: &str) -> Result<u64> {
        let result = self
            .esearch(vec![
                ("term", term.to_string()),
                ("retmax", "0".to_string()),
                ("datetype", "pdat".to_string()),
            ])
            .await?;
        parse_count(result.count.as_deref())
    }
}

#[async_trait]
impl MetadataBackend for PubMedClient {
    async fn summaries(&self, ids: &[String]) -> Result<Vec<ArticleMeta>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = self.base_params();
        params.push(("id", ids.join(",")));
        params.push(("retmode", "json".to_string()));

        let body = get_text(&self.client, &self.limiter, &self.endpoint("esummary.fcgi"), &params).await?;
        parse_esummary(&body)
    }

    async fn details(&self, ids: &[String]) -> Result<HashMap<String, DetailedRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut params = self.base_params();
        params.push(("id", ids.join(",")));
        params.push(("retmode", "xml".to_string()));

        let body = get_text(&self.client, &self.limiter, &self.endpoint("efetch.fcgi"), &params).await?;
        parse_efetch(&body)
    }
}

fn parse_count(count: Option<&str>) -> Result<u64> {
    count
        .ok_or_malformed("ESearch response has no count")?
        .trim()
        .parse::<u64>()
        .map_err(|e| HarvestError::MalformedResponse(format!("Invalid ESearch count: {}", e)))
}

/// Parse an ESearch JSON payload
fn parse_esearch(json_str: &str) -> Result<ESearchResult> {
    let envelope: ESearchEnvelope = serde_json::from_str(json_str).map_err(|e| {
        HarvestError::MalformedResponse(format!("Failed to parse ESearch response: {}", e))
    })?;

    let result = envelope
        .esearchresult
        .ok_or_malformed("ESearch response has no esearchresult")?;

    if let Some(error) = &result.error {
        return Err(HarvestError::Api {
            code: 400,
            message: format!("ESearch error: {}", error),
        });
    }
    Ok(result)
}

fn year_pattern() -> Result<Regex> {
    Regex::new(r"\b(?:19|20)\d{2}\b").map_err(|e| HarvestError::Parse(e.to_string()))
}

/// First 19xx/20xx token of a free-form publication date ("2020 Mar 5")
fn extract_year(year_regex: &Regex, pubdate: &str) -> Option<i32> {
    year_regex.find(pubdate)?.as_str().parse().ok()
}

/// Parse an ESummary JSON payload.
///
/// Documents the server reports as errors, or that do not match the
/// expected shape, are dropped; the caller counts them as skipped.
fn parse_esummary(json_str: &str) -> Result<Vec<ArticleMeta>> {
    let envelope: ESummaryEnvelope = serde_json::from_str(json_str).map_err(|e| {
        HarvestError::MalformedResponse(format!("Failed to parse ESummary response: {}", e))
    })?;

    let Some(result) = envelope.result else {
        return Err(HarvestError::MalformedResponse(format!(
            "ESummary response has no result: {}",
            envelope.error.unwrap_or_default()
        )));
    };

    let year_regex = year_pattern()?;

    let uids: Vec<String> = result
        .get("uids")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let mut records = Vec::with_capacity(uids.len());

    for uid in uids {
        let Some(raw) = result.get(&uid) else {
            continue;
        };
        let doc: SummaryDoc = match serde_json::from_value(raw.clone()) {
            Ok(doc) => doc,
            Err(e) => {
                debug!(uid = %uid, error = %e, "Skipping malformed summary");
                continue;
            }
        };
        if let Some(error) = &doc.error {
            debug!(uid = %uid, error = %error, "Summary reported an error");
            continue;
        }

        let authors = doc
            .authors
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.name)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();

        let doi = doc
            .articleids
            .unwrap_or_default()
            .into_iter()
            .find(|a| a.idtype.as_deref() == Some("doi"))
            .and_then(|a| a.value)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        records.push(ArticleMeta {
            title: doc.title.unwrap_or_default().trim().to_string(),
            journal: doc.fulljournalname.or(doc.source).unwrap_or_default(),
            year: doc.pubdate.as_deref().and_then(|d| extract_year(&year_regex, d)),
            doi,
            authors,
            institutions: Vec::new(),
            id: uid,
        });
    }

    Ok(records)
}

/// Parse an EFetch XML payload into DOI and affiliations per PMID
fn parse_efetch(xml: &str) -> Result<HashMap<String, DetailedRecord>> {
    let set: PubmedArticleSet = quick_xml::de::from_str(xml).map_err(|e| {
        HarvestError::MalformedResponse(format!("Failed to parse EFetch XML: {}", e))
    })?;

    let mut details = HashMap::new();

    for article in set.articles {
        let Some(medline) = article.medline else {
            continue;
        };
        let Some(pmid) = medline.pmid.map(|p| p.text.trim().to_string()) else {
            continue;
        };
        if pmid.is_empty() {
            continue;
        }

        let mut record = DetailedRecord::default();

        if let Some(xml_article) = medline.article {
            record.doi = xml_article
                .elocation_ids
                .iter()
                .find(|id| id.is_doi())
                .map(|id| id.value.trim().to_string());

            for author in xml_article.author_list.map(|l| l.authors).unwrap_or_default() {
                for info in author.affiliations {
                    if let Some(affiliation) = info.affiliation {
                        crate::citation::push_unique(&mut record.affiliations, &affiliation.text);
                    }
                }
            }
        }

        if record.doi.is_none() {
            record.doi = article
                .pubmed_data
                .and_then(|d| d.article_ids)
                .and_then(|list| list.ids.into_iter().find(|id| id.is_doi()))
                .map(|id| id.value.trim().to_string());
        }

        details.insert(pmid, record);
    }

    Ok(details)
}
