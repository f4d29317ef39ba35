//! Normalization of raw registry records into the storage schema.

use chrono::NaiveDate;
use hfx_core::{EstablishmentRow, RATING_UNKNOWN};
use hfx_registry::RawEstablishment;

/// Pure mapping, no failure modes: absent numeric fields stay `None`,
/// absent strings become `None` rather than empty, and a missing rating
/// value falls back to the unknown sentinel. Malformed-but-present string
/// fields pass through verbatim; this is not a validation layer.
pub fn map_establishment(raw: &RawEstablishment) -> EstablishmentRow {
    EstablishmentRow {
        fhrsid: raw.fhrsid,
        business_name: raw.business_name.clone(),
        business_type: non_empty(&raw.business_type),
        business_type_id: raw.business_type_id,
        rating_value: non_empty(&raw.rating_value)
            .unwrap_or_else(|| RATING_UNKNOWN.to_string()),
        rating_date: parse_rating_date(raw.rating_date.as_deref()),
        address_line1: non_empty(&raw.address_line1),
        address_line2: non_empty(&raw.address_line2),
        address_line3: non_empty(&raw.address_line3),
        postcode: non_empty(&raw.postcode),
        local_authority_name: non_empty(&raw.local_authority_name),
        local_authority_code: non_empty(&raw.local_authority_code),
        local_authority_email: non_empty(&raw.local_authority_email),
        hygiene_score: raw.scores.hygiene,
        structural_score: raw.scores.structural,
        management_score: raw.scores.confidence_in_management,
        latitude: parse_coord(raw.geocode.latitude.as_deref()),
        longitude: parse_coord(raw.geocode.longitude.as_deref()),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

/// The registry serializes rating dates as `YYYY-MM-DDTHH:MM:SS`; only the
/// date part is meaningful.
fn parse_rating_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?;
    let date_part = raw.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

fn parse_coord(raw: Option<&str>) -> Option<f64> {
    raw?.trim().parse().ok()
}
