//! Postgres persistence for establishments, rating changes, run records
//! and subscribers.
//!
//! The pipeline talks to storage through the [`EstablishmentStore`] trait;
//! [`PgStore`] is the production implementation. Everything else here is
//! the read surface the lookup and outreach components depend on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hfx_core::{Establishment, EstablishmentRow, RatingChange, RunTotals, RunType, Subscriber};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hfx-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Write/read operations the ingestion pipeline needs. Kept narrow so the
/// pipeline's behavior can be exercised against an in-memory double.
#[async_trait]
pub trait EstablishmentStore: Send + Sync {
    /// Bulk read of existing rows for a set of FHRSIDs. One call per page
    /// batch; callers must not loop this per row.
    async fn get_by_fhrsids(&self, fhrsids: &[i64]) -> Result<Vec<Establishment>, StoreError>;

    /// Insert-or-replace by FHRSID. Replaces all pipeline-owned columns and
    /// refreshes `last_updated_at`; outreach columns and `first_seen_at`
    /// are left untouched on conflict.
    async fn upsert_establishments(&self, rows: &[EstablishmentRow]) -> Result<(), StoreError>;

    /// Append one rating transition to the change log.
    async fn record_rating_change(&self, change: &RatingChange) -> Result<(), StoreError>;

    /// Create a run record in `running` status and return its id.
    async fn start_run(&self, run_type: RunType) -> Result<Uuid, StoreError>;

    /// Finalize a run record with aggregated totals and the flattened log.
    async fn complete_run(
        &self,
        run_id: Uuid,
        totals: RunTotals,
        error_log: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ---- read surface for the lookup/outreach components ----

    pub async fn get_by_fhrsid(&self, fhrsid: i64) -> Result<Option<Establishment>, StoreError> {
        let row = sqlx::query("SELECT * FROM establishments WHERE fhrsid = $1")
            .bind(fhrsid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| establishment_from_row(&r)).transpose()
    }

    /// Establishments at or below a rating tier. `rating_value` is text, so
    /// numeric tiers compare lexically (correct for single digits) and
    /// scheme states like "Exempt" sort above them and drop out.
    pub async fn get_by_rating(
        &self,
        max_rating: u8,
        limit: i64,
    ) -> Result<Vec<Establishment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM establishments \
             WHERE rating_value <= $1 \
             ORDER BY rating_value ASC \
             LIMIT $2",
        )
        .bind(max_rating.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(establishment_from_row).collect()
    }

    /// First-sighted since `since` and not yet contacted, newest first.
    pub async fn get_new_establishments(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Establishment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM establishments \
             WHERE first_seen_at >= $1 AND outreach_status = 'new' \
             ORDER BY first_seen_at DESC \
             LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(establishment_from_row).collect()
    }

    pub async fn search_by_name(
        &self,
        name_fragment: &str,
        limit: i64,
    ) -> Result<Vec<Establishment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM establishments \
             WHERE business_name ILIKE '%' || $1 || '%' \
             ORDER BY rating_value ASC, business_name ASC \
             LIMIT $2",
        )
        .bind(name_fragment)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(establishment_from_row).collect()
    }

    pub async fn get_by_authority(
        &self,
        authority_name: &str,
        limit: i64,
    ) -> Result<Vec<Establishment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM establishments \
             WHERE local_authority_name = $1 \
             ORDER BY rating_value ASC, business_name ASC \
             LIMIT $2",
        )
        .bind(authority_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(establishment_from_row).collect()
    }

    // ---- subscribers ----

    pub async fn add_subscriber(
        &self,
        email: &str,
        fhrsid: Option<i64>,
        business_name: Option<&str>,
        source: &str,
    ) -> Result<Subscriber, StoreError> {
        let row = sqlx::query(
            "INSERT INTO subscribers (email, fhrsid, business_name, source, status, subscribed_at) \
             VALUES ($1, $2, $3, $4, 'active', NOW()) \
             ON CONFLICT (email) DO UPDATE SET \
                 fhrsid = EXCLUDED.fhrsid, \
                 business_name = EXCLUDED.business_name, \
                 source = EXCLUDED.source, \
                 status = 'active', \
                 subscribed_at = NOW() \
             RETURNING *",
        )
        .bind(hfx_core::normalize_email(email))
        .bind(fhrsid)
        .bind(business_name)
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        subscriber_from_row(&row)
    }

    pub async fn unsubscribe(&self, email: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE subscribers SET status = 'unsubscribed' WHERE email = $1",
        )
        .bind(hfx_core::normalize_email(email))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn active_subscriber_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM subscribers WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl EstablishmentStore for PgStore {
    async fn get_by_fhrsids(&self, fhrsids: &[i64]) -> Result<Vec<Establishment>, StoreError> {
        if fhrsids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM establishments WHERE fhrsid = ANY($1)")
            .bind(fhrsids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(establishment_from_row).collect()
    }

    async fn upsert_establishments(&self, rows: &[EstablishmentRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO establishments (fhrsid, business_name, business_type, \
             business_type_id, rating_value, rating_date, address_line1, address_line2, \
             address_line3, postcode, local_authority_name, local_authority_code, \
             local_authority_email, hygiene_score, structural_score, management_score, \
             latitude, longitude, last_updated_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.fhrsid)
                .push_bind(&row.business_name)
                .push_bind(&row.business_type)
                .push_bind(row.business_type_id)
                .push_bind(&row.rating_value)
                .push_bind(row.rating_date)
                .push_bind(&row.address_line1)
                .push_bind(&row.address_line2)
                .push_bind(&row.address_line3)
                .push_bind(&row.postcode)
                .push_bind(&row.local_authority_name)
                .push_bind(&row.local_authority_code)
                .push_bind(&row.local_authority_email)
                .push_bind(row.hygiene_score)
                .push_bind(row.structural_score)
                .push_bind(row.management_score)
                .push_bind(row.latitude)
                .push_bind(row.longitude)
                .push_bind(now);
        });
        // Outreach columns and first_seen_at are deliberately absent from
        // the update list: the pipeline must never clobber them.
        builder.push(
            " ON CONFLICT (fhrsid) DO UPDATE SET \
             business_name = EXCLUDED.business_name, \
             business_type = EXCLUDED.business_type, \
             business_type_id = EXCLUDED.business_type_id, \
             rating_value = EXCLUDED.rating_value, \
             rating_date = EXCLUDED.rating_date, \
             address_line1 = EXCLUDED.address_line1, \
             address_line2 = EXCLUDED.address_line2, \
             address_line3 = EXCLUDED.address_line3, \
             postcode = EXCLUDED.postcode, \
             local_authority_name = EXCLUDED.local_authority_name, \
             local_authority_code = EXCLUDED.local_authority_code, \
             local_authority_email = EXCLUDED.local_authority_email, \
             hygiene_score = EXCLUDED.hygiene_score, \
             structural_score = EXCLUDED.structural_score, \
             management_score = EXCLUDED.management_score, \
             latitude = EXCLUDED.latitude, \
             longitude = EXCLUDED.longitude, \
             last_updated_at = EXCLUDED.last_updated_at",
        );
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn record_rating_change(&self, change: &RatingChange) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rating_changes (fhrsid, old_rating, new_rating, \
             old_hygiene, new_hygiene, old_structural, new_structural, \
             old_management, new_management) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(change.fhrsid)
        .bind(&change.old_rating)
        .bind(&change.new_rating)
        .bind(change.old_hygiene)
        .bind(change.new_hygiene)
        .bind(change.old_structural)
        .bind(change.new_structural)
        .bind(change.old_management)
        .bind(change.new_management)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn start_run(&self, run_type: RunType) -> Result<Uuid, StoreError> {
        let row = sqlx::query("INSERT INTO pipeline_runs (run_type) VALUES ($1) RETURNING id")
            .bind(run_type.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        totals: RunTotals,
        error_log: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pipeline_runs SET \
                 status = 'completed', \
                 completed_at = NOW(), \
                 total_fetched = $2, \
                 new_establishments = $3, \
                 rating_changes_detected = $4, \
                 errors = $5, \
                 error_log = $6 \
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(totals.total_fetched)
        .bind(totals.new_establishments)
        .bind(totals.rating_changes_detected)
        .bind(totals.errors)
        .bind(error_log)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn establishment_from_row(row: &PgRow) -> Result<Establishment, StoreError> {
    Ok(Establishment {
        fhrsid: row.try_get("fhrsid")?,
        business_name: row.try_get("business_name")?,
        business_type: row.try_get("business_type")?,
        business_type_id: row.try_get("business_type_id")?,
        rating_value: row.try_get("rating_value")?,
        rating_date: row.try_get("rating_date")?,
        address_line1: row.try_get("address_line1")?,
        address_line2: row.try_get("address_line2")?,
        address_line3: row.try_get("address_line3")?,
        postcode: row.try_get("postcode")?,
        local_authority_name: row.try_get("local_authority_name")?,
        local_authority_code: row.try_get("local_authority_code")?,
        local_authority_email: row.try_get("local_authority_email")?,
        hygiene_score: row.try_get("hygiene_score")?,
        structural_score: row.try_get("structural_score")?,
        management_score: row.try_get("management_score")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
        outreach_status: row.try_get("outreach_status")?,
        contact_email: row.try_get("contact_email")?,
    })
}

fn subscriber_from_row(row: &PgRow) -> Result<Subscriber, StoreError> {
    Ok(Subscriber {
        email: row.try_get("email")?,
        fhrsid: row.try_get("fhrsid")?,
        business_name: row.try_get("business_name")?,
        source: row.try_get("source")?,
        status: row.try_get("status")?,
        subscribed_at: row.try_get("subscribed_at")?,
    })
}
