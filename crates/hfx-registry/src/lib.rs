//! Client for the FHRS public ratings registry.
//!
//! One method per upstream read the service depends on. The client never
//! retries: a failed page is the caller's problem (the pipeline skips it,
//! interactive callers surface it).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "hfx-registry";

const DEFAULT_BASE_URL: &str = "https://api.ratings.food.gov.uk";
const API_VERSION_HEADER: &str = "x-api-version";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("FSA_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_secs(
                std::env::var("HFX_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: std::env::var("HFX_USER_AGENT").ok(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry error: {status} for {url}")]
    Status { status: u16, url: String },
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Raw establishment record exactly as the registry returns it. Fields the
/// upstream omits stay `None`; nothing here is validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEstablishment {
    #[serde(rename = "FHRSID")]
    pub fhrsid: i64,
    #[serde(rename = "BusinessName", default)]
    pub business_name: String,
    #[serde(rename = "BusinessType", default)]
    pub business_type: Option<String>,
    #[serde(rename = "BusinessTypeID", default)]
    pub business_type_id: Option<i64>,
    #[serde(rename = "RatingValue", default)]
    pub rating_value: Option<String>,
    #[serde(rename = "RatingDate", default)]
    pub rating_date: Option<String>,
    #[serde(rename = "AddressLine1", default)]
    pub address_line1: Option<String>,
    #[serde(rename = "AddressLine2", default)]
    pub address_line2: Option<String>,
    #[serde(rename = "AddressLine3", default)]
    pub address_line3: Option<String>,
    #[serde(rename = "AddressLine4", default)]
    pub address_line4: Option<String>,
    #[serde(rename = "PostCode", default)]
    pub postcode: Option<String>,
    #[serde(rename = "LocalAuthorityName", default)]
    pub local_authority_name: Option<String>,
    #[serde(rename = "LocalAuthorityCode", default)]
    pub local_authority_code: Option<String>,
    #[serde(rename = "LocalAuthorityEmailAddress", default)]
    pub local_authority_email: Option<String>,
    #[serde(rename = "SchemeType", default)]
    pub scheme_type: Option<String>,
    #[serde(default)]
    pub geocode: RawGeocode,
    #[serde(default)]
    pub scores: RawScores,
}

/// Geocode arrives as strings; parsing to floats is the mapper's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawGeocode {
    #[serde(default)]
    pub longitude: Option<String>,
    #[serde(default)]
    pub latitude: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawScores {
    #[serde(rename = "Hygiene", default)]
    pub hygiene: Option<i32>,
    #[serde(rename = "Structural", default)]
    pub structural: Option<i32>,
    #[serde(rename = "ConfidenceInManagement", default)]
    pub confidence_in_management: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageMeta {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct EstablishmentsResponse {
    #[serde(default)]
    establishments: Vec<RawEstablishment>,
    #[serde(default)]
    meta: PageMeta,
}

/// One page of low-rated establishments plus the upstream pagination totals.
#[derive(Debug, Clone, Default)]
pub struct RegistryPage {
    pub establishments: Vec<RawEstablishment>,
    pub total_pages: u32,
    pub total_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingOperator {
    Equal,
    GreaterThanOrEqual,
    LessThanOrEqual,
}

impl RatingOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatingOperator::Equal => "Equal",
            RatingOperator::GreaterThanOrEqual => "GreaterThanOrEqual",
            RatingOperator::LessThanOrEqual => "LessThanOrEqual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Postcode,
    Name,
}

#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub query: String,
    pub kind: SearchKind,
    pub business_type_id: Option<i64>,
    pub local_authority_id: Option<i64>,
    pub rating_key: Option<u8>,
    pub rating_operator: Option<RatingOperator>,
    pub page_number: u32,
    pub page_size: u32,
}

impl SearchFilters {
    pub fn new(query: impl Into<String>, kind: SearchKind) -> Self {
        Self {
            query: query.into(),
            kind,
            business_type_id: None,
            local_authority_id: None,
            rating_key: None,
            rating_operator: None,
            page_number: 1,
            page_size: 20,
        }
    }
}

/// UK postcodes are matched with the space in; callers often omit it.
/// Uppercase, strip whitespace, re-insert the space before the final three
/// characters when there is room for one.
pub fn normalize_postcode(raw: &str) -> String {
    let clean: String = raw
        .to_ascii_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if clean.len() > 3 {
        format!("{} {}", &clean[..clean.len() - 3], &clean[clean.len() - 3..])
    } else {
        clean
    }
}

/// Query parameters for one low-rated page. Split out of the fetch so the
/// outgoing filter can be asserted without a network.
pub fn low_rated_page_query(page: u32, page_size: u32, max_rating: u8) -> Vec<(String, String)> {
    vec![
        ("ratingKey".into(), max_rating.to_string()),
        ("ratingOperatorKey".into(), RatingOperator::LessThanOrEqual.as_str().into()),
        ("pageNumber".into(), page.to_string()),
        ("pageSize".into(), page_size.to_string()),
        ("sortOptionKey".into(), "rating".into()),
    ]
}

/// Query parameters for a search request.
pub fn search_query(filters: &SearchFilters) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = Vec::new();
    match filters.kind {
        SearchKind::Postcode => {
            params.push(("address".into(), normalize_postcode(&filters.query)));
        }
        SearchKind::Name => params.push(("name".into(), filters.query.clone())),
    }
    if let Some(id) = filters.business_type_id.filter(|id| *id > 0) {
        params.push(("businessTypeId".into(), id.to_string()));
    }
    if let Some(id) = filters.local_authority_id.filter(|id| *id > 0) {
        params.push(("localAuthorityId".into(), id.to_string()));
    }
    if let Some(key) = filters.rating_key {
        params.push(("ratingKey".into(), key.to_string()));
    }
    if let Some(op) = filters.rating_operator {
        params.push(("ratingOperatorKey".into(), op.as_str().into()));
    }
    params.push(("pageNumber".into(), filters.page_number.max(1).to_string()));
    params.push(("pageSize".into(), filters.page_size.to_string()));
    params.push(("sortOptionKey".into(), "rating".into()));
    params
}

/// Seam between the pipeline and the live registry; lets the orchestrator
/// run against a scripted source in tests.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn fetch_low_rated_page(
        &self,
        page: u32,
        page_size: u32,
        max_rating: u8,
    ) -> Result<RegistryPage, RegistryError>;
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static("2"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_establishments(
        &self,
        params: &[(String, String)],
    ) -> Result<EstablishmentsResponse, RegistryError> {
        let url = format!("{}/Establishments", self.base_url);
        let resp = self.client.get(&url).query(params).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    /// Free-text search over the registry (name or postcode), used by the
    /// public lookup surface.
    pub async fn search_establishments(
        &self,
        filters: &SearchFilters,
    ) -> Result<RegistryPage, RegistryError> {
        let body = self.get_establishments(&search_query(filters)).await?;
        Ok(RegistryPage {
            establishments: body.establishments,
            total_pages: body.meta.total_pages,
            total_count: body.meta.total_count,
        })
    }

    /// Single establishment by FHRSID; upstream 404 means "not listed".
    pub async fn get_establishment(
        &self,
        fhrsid: i64,
    ) -> Result<Option<RawEstablishment>, RegistryError> {
        let url = format!("{}/Establishments/{}", self.base_url, fhrsid);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RegistryError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(Some(resp.json().await?))
    }

    /// Total establishments per low rating tier (0–3). A tier whose count
    /// query fails is omitted rather than failing the whole map.
    pub async fn rating_counts(&self) -> Result<BTreeMap<String, u64>, RegistryError> {
        let mut counts = BTreeMap::new();
        for rating in 0u8..=3 {
            let params = vec![
                ("ratingKey".to_string(), rating.to_string()),
                ("ratingOperatorKey".to_string(), RatingOperator::Equal.as_str().to_string()),
                ("pageSize".to_string(), "1".to_string()),
                ("pageNumber".to_string(), "1".to_string()),
            ];
            match self.get_establishments(&params).await {
                Ok(body) => {
                    counts.insert(rating.to_string(), body.meta.total_count);
                }
                Err(err) => debug!(rating, %err, "skipping rating tier count"),
            }
        }
        Ok(counts)
    }

    /// Low-rated establishments within one local authority.
    pub async fn low_rated_by_authority(
        &self,
        authority_id: i64,
        max_rating: u8,
        page: u32,
        page_size: u32,
    ) -> Result<RegistryPage, RegistryError> {
        let mut params = low_rated_page_query(page, page_size, max_rating);
        params.insert(0, ("localAuthorityId".into(), authority_id.to_string()));
        let body = self.get_establishments(&params).await?;
        Ok(RegistryPage {
            establishments: body.establishments,
            total_pages: body.meta.total_pages,
            total_count: body.meta.total_count,
        })
    }
}

#[async_trait]
impl RegistrySource for RegistryClient {
    async fn fetch_low_rated_page(
        &self,
        page: u32,
        page_size: u32,
        max_rating: u8,
    ) -> Result<RegistryPage, RegistryError> {
        let body = self
            .get_establishments(&low_rated_page_query(page, page_size, max_rating))
            .await?;
        Ok(RegistryPage {
            establishments: body.establishments,
            total_pages: body.meta.total_pages,
            total_count: body.meta.total_count,
        })
    }
}
