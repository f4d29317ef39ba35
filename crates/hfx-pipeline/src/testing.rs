//! In-memory doubles for the registry and the store, shared by the
//! pipeline's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hfx_core::{Establishment, EstablishmentRow, RatingChange, RunTotals, RunType};
use hfx_registry::{RawEstablishment, RegistryError, RegistryPage, RegistrySource};
use hfx_storage::{EstablishmentStore, StoreError};
use uuid::Uuid;

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).single().unwrap()
}

fn scripted_store_error() -> StoreError {
    StoreError::Database(sqlx::Error::RowNotFound)
}

/// Minimal raw registry record.
pub fn raw(fhrsid: i64, rating: &str) -> RawEstablishment {
    RawEstablishment {
        fhrsid,
        business_name: format!("Business {fhrsid}"),
        rating_value: Some(rating.to_string()),
        ..RawEstablishment::default()
    }
}

/// Minimal normalized row.
pub fn row(fhrsid: i64, rating: &str) -> EstablishmentRow {
    crate::map_establishment(&raw(fhrsid, rating))
}

/// Previously stored establishment with an optional hygiene score.
pub fn stored(fhrsid: i64, rating: &str, hygiene: Option<i32>) -> Establishment {
    Establishment {
        fhrsid,
        business_name: format!("Business {fhrsid}"),
        business_type: None,
        business_type_id: None,
        rating_value: rating.to_string(),
        rating_date: None,
        address_line1: None,
        address_line2: None,
        address_line3: None,
        postcode: None,
        local_authority_name: None,
        local_authority_code: None,
        local_authority_email: None,
        hygiene_score: hygiene,
        structural_score: None,
        management_score: None,
        latitude: None,
        longitude: None,
        first_seen_at: fixed_time(),
        last_updated_at: fixed_time(),
        outreach_status: Some("new".to_string()),
        contact_email: None,
    }
}

pub enum ScriptedPage {
    Rows(Vec<RawEstablishment>),
    Fail,
}

/// Registry double that serves pre-scripted pages and records every call.
pub struct ScriptedRegistry {
    pages: Vec<ScriptedPage>,
    total_pages: u32,
    total_count: u64,
    pub calls: Mutex<Vec<(u32, u32, u8)>>,
}

impl ScriptedRegistry {
    pub fn new(pages: Vec<ScriptedPage>, total_pages: u32) -> Self {
        let total_count = pages
            .iter()
            .map(|p| match p {
                ScriptedPage::Rows(rows) => rows.len() as u64,
                ScriptedPage::Fail => 0,
            })
            .sum();
        Self {
            pages,
            total_pages,
            total_count,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn single_page(rows: Vec<RawEstablishment>) -> Self {
        Self::new(vec![ScriptedPage::Rows(rows)], 1)
    }
}

#[async_trait]
impl RegistrySource for ScriptedRegistry {
    async fn fetch_low_rated_page(
        &self,
        page: u32,
        page_size: u32,
        max_rating: u8,
    ) -> Result<RegistryPage, RegistryError> {
        self.calls.lock().unwrap().push((page, page_size, max_rating));
        match self.pages.get((page - 1) as usize) {
            Some(ScriptedPage::Rows(rows)) => Ok(RegistryPage {
                establishments: rows.clone(),
                total_pages: self.total_pages,
                total_count: self.total_count,
            }),
            Some(ScriptedPage::Fail) => Err(RegistryError::Status {
                status: 500,
                url: format!("scripted://establishments?page={page}"),
            }),
            None => Ok(RegistryPage {
                establishments: Vec::new(),
                total_pages: self.total_pages,
                total_count: self.total_count,
            }),
        }
    }
}

/// Store double with switchable failure injection.
#[derive(Default)]
pub struct MockStore {
    rows: Mutex<HashMap<i64, Establishment>>,
    pub changes: Mutex<Vec<RatingChange>>,
    pub started_runs: Mutex<Vec<(Uuid, RunType)>>,
    pub completed_runs: Mutex<Vec<(Uuid, RunTotals, Option<String>)>>,
    pub upsert_sizes: Mutex<Vec<usize>>,
    pub bulk_reads: Mutex<usize>,
    pub fail_bulk_reads: AtomicBool,
    pub fail_start_run: AtomicBool,
    pub fail_complete_run: AtomicBool,
    fail_change_fhrsid: Mutex<Option<i64>>,
    fail_upsert_call: Mutex<Option<usize>>,
}

impl MockStore {
    pub fn seed(&self, establishment: Establishment) {
        self.rows
            .lock()
            .unwrap()
            .insert(establishment.fhrsid, establishment);
    }

    /// Fail `record_rating_change` for this FHRSID only.
    pub fn fail_change_for(&self, fhrsid: i64) {
        *self.fail_change_fhrsid.lock().unwrap() = Some(fhrsid);
    }

    /// Fail the nth upsert call (1-based).
    pub fn fail_upsert_call(&self, call: usize) {
        *self.fail_upsert_call.lock().unwrap() = Some(call);
    }

    pub fn snapshot(&self) -> HashMap<i64, Establishment> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl EstablishmentStore for MockStore {
    async fn get_by_fhrsids(&self, fhrsids: &[i64]) -> Result<Vec<Establishment>, StoreError> {
        *self.bulk_reads.lock().unwrap() += 1;
        if self.fail_bulk_reads.load(Ordering::SeqCst) {
            return Err(scripted_store_error());
        }
        let rows = self.rows.lock().unwrap();
        Ok(fhrsids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn upsert_establishments(&self, batch: &[EstablishmentRow]) -> Result<(), StoreError> {
        let call_no = {
            let mut sizes = self.upsert_sizes.lock().unwrap();
            sizes.push(batch.len());
            sizes.len()
        };
        if *self.fail_upsert_call.lock().unwrap() == Some(call_no) {
            return Err(scripted_store_error());
        }

        let mut rows = self.rows.lock().unwrap();
        for row in batch {
            let (first_seen_at, outreach_status, contact_email) = match rows.get(&row.fhrsid) {
                Some(existing) => (
                    existing.first_seen_at,
                    existing.outreach_status.clone(),
                    existing.contact_email.clone(),
                ),
                None => (fixed_time(), Some("new".to_string()), None),
            };
            rows.insert(
                row.fhrsid,
                Establishment {
                    fhrsid: row.fhrsid,
                    business_name: row.business_name.clone(),
                    business_type: row.business_type.clone(),
                    business_type_id: row.business_type_id,
                    rating_value: row.rating_value.clone(),
                    rating_date: row.rating_date,
                    address_line1: row.address_line1.clone(),
                    address_line2: row.address_line2.clone(),
                    address_line3: row.address_line3.clone(),
                    postcode: row.postcode.clone(),
                    local_authority_name: row.local_authority_name.clone(),
                    local_authority_code: row.local_authority_code.clone(),
                    local_authority_email: row.local_authority_email.clone(),
                    hygiene_score: row.hygiene_score,
                    structural_score: row.structural_score,
                    management_score: row.management_score,
                    latitude: row.latitude,
                    longitude: row.longitude,
                    first_seen_at,
                    last_updated_at: fixed_time(),
                    outreach_status,
                    contact_email,
                },
            );
        }
        Ok(())
    }

    async fn record_rating_change(&self, change: &RatingChange) -> Result<(), StoreError> {
        if *self.fail_change_fhrsid.lock().unwrap() == Some(change.fhrsid) {
            return Err(scripted_store_error());
        }
        self.changes.lock().unwrap().push(change.clone());
        Ok(())
    }

    async fn start_run(&self, run_type: RunType) -> Result<Uuid, StoreError> {
        if self.fail_start_run.load(Ordering::SeqCst) {
            return Err(scripted_store_error());
        }
        let id = Uuid::new_v4();
        self.started_runs.lock().unwrap().push((id, run_type));
        Ok(id)
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        totals: RunTotals,
        error_log: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.fail_complete_run.load(Ordering::SeqCst) {
            return Err(scripted_store_error());
        }
        self.completed_runs
            .lock()
            .unwrap()
            .push((run_id, totals, error_log.map(str::to_string)));
        Ok(())
    }
}
