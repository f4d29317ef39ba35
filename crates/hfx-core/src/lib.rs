//! Core domain model for the HygieneFix ratings service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hfx-core";

pub mod scores;

/// Sentinel rating stored when the registry publishes no usable rating value.
/// Distinct from the scheme's own non-numeric states ("Exempt",
/// "AwaitingInspection"), which pass through verbatim.
pub const RATING_UNKNOWN: &str = "Unknown";

/// Normalized establishment row as produced by the pipeline mapper.
///
/// This is the upsert payload: every field here is pipeline-owned and is
/// replaced wholesale on each sighting. Store-owned bookkeeping columns
/// (`first_seen_at`, outreach state) live on [`Establishment`] only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstablishmentRow {
    pub fhrsid: i64,
    pub business_name: String,
    pub business_type: Option<String>,
    pub business_type_id: Option<i64>,
    pub rating_value: String,
    pub rating_date: Option<NaiveDate>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub address_line3: Option<String>,
    pub postcode: Option<String>,
    pub local_authority_name: Option<String>,
    pub local_authority_code: Option<String>,
    pub local_authority_email: Option<String>,
    pub hygiene_score: Option<i32>,
    pub structural_score: Option<i32>,
    pub management_score: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Establishment as persisted, including columns the pipeline never writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Establishment {
    pub fhrsid: i64,
    pub business_name: String,
    pub business_type: Option<String>,
    pub business_type_id: Option<i64>,
    pub rating_value: String,
    pub rating_date: Option<NaiveDate>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub address_line3: Option<String>,
    pub postcode: Option<String>,
    pub local_authority_name: Option<String>,
    pub local_authority_code: Option<String>,
    pub local_authority_email: Option<String>,
    pub hygiene_score: Option<i32>,
    pub structural_score: Option<i32>,
    pub management_score: Option<i32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Outreach state owned by the broadcast component; carried here so
    /// readers can filter on it, never written by the pipeline.
    pub outreach_status: Option<String>,
    pub contact_email: Option<String>,
}

/// One detected rating transition, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingChange {
    pub fhrsid: i64,
    pub old_rating: String,
    pub new_rating: String,
    pub old_hygiene: Option<i32>,
    pub new_hygiene: Option<i32>,
    pub old_structural: Option<i32>,
    pub new_structural: Option<i32>,
    pub old_management: Option<i32>,
    pub new_management: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Daily,
    Full,
    Manual,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Daily => "daily",
            RunType::Full => "full",
            RunType::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
        }
    }
}

/// One execution of the ingestion pipeline as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub run_type: RunType,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_fetched: i64,
    pub new_establishments: i64,
    pub rating_changes_detected: i64,
    pub errors: i64,
    pub error_log: Option<String>,
}

/// Final statistics written onto a completed run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunTotals {
    pub total_fetched: i64,
    pub new_establishments: i64,
    pub rating_changes_detected: i64,
    pub errors: i64,
}

/// A broadcast/alert subscriber. Always persisted, never held in process
/// memory: the web tier may be restarted or scaled between requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub email: String,
    pub fhrsid: Option<i64>,
    pub business_name: Option<String>,
    pub source: String,
    pub status: String,
    pub subscribed_at: DateTime<Utc>,
}

/// Lowercase/trim an email the way the subscribers table expects it.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
