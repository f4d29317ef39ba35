//! Interpretation tables for FHRS ratings and inspection sub-scores.
//!
//! These back the improvement-plan and alert surfaces: given the stored
//! rating and sub-scores they produce the human-readable breakdown those
//! consumers render. Sub-scores are penalty points, so lower is better;
//! hygiene and structural run 0–25, confidence-in-management 0–30.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreArea {
    Hygiene,
    Structural,
    ConfidenceInManagement,
}

impl ScoreArea {
    /// Plain-English name used in generated prose.
    pub fn friendly_name(&self) -> &'static str {
        match self {
            ScoreArea::Hygiene => "food handling and hygiene",
            ScoreArea::Structural => "premises condition and cleanliness",
            ScoreArea::ConfidenceInManagement => "management systems and documentation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Urgent,
    Major,
    Improvement,
    Satisfactory,
    Good,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreInterpretation {
    pub area: ScoreArea,
    pub score: i32,
    pub max_score: i32,
    pub label: &'static str,
    pub severity: Severity,
    pub description: &'static str,
    pub short_advice: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingLabel {
    pub label: &'static str,
    pub description: &'static str,
}

/// Overall breakdown for one establishment: rating label plus per-area
/// interpretations sorted worst first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingBreakdown {
    pub rating: i32,
    pub overall: RatingLabel,
    pub scores: Vec<ScoreInterpretation>,
    pub worst_area: &'static str,
    pub primary_action: &'static str,
}

/// Label and description for an overall rating tier. Non-numeric tiers
/// ("Exempt", "AwaitingInspection", the unknown sentinel) have no label.
pub fn rating_label(rating_value: &str) -> Option<RatingLabel> {
    let (label, description) = match rating_value {
        "0" => (
            "Urgent Improvement Necessary",
            "The food hygiene standards at this business are critically below requirements. Immediate action is essential.",
        ),
        "1" => (
            "Major Improvement Necessary",
            "Significant improvements are required to meet food hygiene standards. The business must address serious issues promptly.",
        ),
        "2" => (
            "Improvement Necessary",
            "Some improvements are needed to bring food hygiene standards up to the required level.",
        ),
        "3" => (
            "Generally Satisfactory",
            "Food hygiene standards are broadly acceptable but there is room for improvement.",
        ),
        "4" => (
            "Good",
            "Food hygiene standards are good with only minor improvements needed.",
        ),
        "5" => (
            "Very Good",
            "Excellent food hygiene standards. The business is fully compliant.",
        ),
        _ => return None,
    };
    Some(RatingLabel { label, description })
}

/// Inspections award penalty points in fixed steps; anything off-grid is
/// clamped to the worst banding rather than rejected.
fn banded<'a>(
    bands: &'a [(i32, Severity, &'static str, &'static str)],
    score: i32,
) -> &'a (i32, Severity, &'static str, &'static str) {
    bands
        .iter()
        .find(|(s, _, _, _)| *s == score)
        .unwrap_or_else(|| bands.last().expect("bands are non-empty"))
}

pub fn interpret_hygiene(score: i32) -> ScoreInterpretation {
    const BANDS: &[(i32, Severity, &str, &str)] = &[
        (0, Severity::Good, "Very Good", "Food handling procedures are excellent. Keep up current practices."),
        (5, Severity::Satisfactory, "Good", "Minor issues with food handling. Review temperature monitoring and storage practices."),
        (10, Severity::Improvement, "Generally Satisfactory", "Improvements needed in food handling. Focus on cross-contamination controls, cooking temperatures, and date labelling."),
        (15, Severity::Major, "Improvement Necessary", "Significant issues with food handling. Urgently review separation of raw and ready-to-eat foods, temperature controls, and personal hygiene practices."),
        (20, Severity::Urgent, "Major Improvement Necessary", "Serious food handling failures. Immediate action required on temperature control, cross-contamination prevention, and food storage."),
        (25, Severity::Urgent, "Urgent Improvement Necessary", "Critical food safety hazards in handling. Risk of causing foodborne illness. Emergency corrective action needed."),
    ];
    let (_, severity, label, short_advice) = *banded(BANDS, score);
    ScoreInterpretation {
        area: ScoreArea::Hygiene,
        score,
        max_score: 25,
        label,
        severity,
        description: "How hygienically food is handled — preparation, cooking, reheating, cooling and storage.",
        short_advice,
    }
}

pub fn interpret_structural(score: i32) -> ScoreInterpretation {
    const BANDS: &[(i32, Severity, &str, &str)] = &[
        (0, Severity::Good, "Very Good", "Premises condition is excellent. Maintain current cleaning and maintenance schedules."),
        (5, Severity::Satisfactory, "Good", "Minor structural issues. Review cleaning schedule and check equipment condition."),
        (10, Severity::Improvement, "Generally Satisfactory", "Improvements needed to premises. Focus on cleaning schedules, pest control, and equipment maintenance."),
        (15, Severity::Major, "Improvement Necessary", "Significant premises issues. Address cleaning deficiencies, pest control gaps, and facility condition urgently."),
        (20, Severity::Urgent, "Major Improvement Necessary", "Serious structural deficiencies. Major repairs, deep cleaning, and pest control action needed immediately."),
        (25, Severity::Urgent, "Urgent Improvement Necessary", "Critical premises condition. May require closure for remedial work. Emergency cleaning and repairs essential."),
    ];
    let (_, severity, label, short_advice) = *banded(BANDS, score);
    ScoreInterpretation {
        area: ScoreArea::Structural,
        score,
        max_score: 25,
        label,
        severity,
        description: "The condition of the building — cleanliness, layout, lighting, ventilation, pest control and facilities.",
        short_advice,
    }
}

pub fn interpret_management(score: i32) -> ScoreInterpretation {
    const BANDS: &[(i32, Severity, &str, &str)] = &[
        (0, Severity::Good, "Very Good", "Excellent management systems in place. Documentation and training are exemplary."),
        (5, Severity::Satisfactory, "Good", "Good management. Minor improvements to documentation or training records may help."),
        (10, Severity::Improvement, "Generally Satisfactory", "Management systems need strengthening. Ensure SFBB/HACCP pack is complete and staff training is documented."),
        (20, Severity::Major, "Improvement Necessary", "Significant gaps in food safety management. Implement a proper SFBB system, train all staff, and keep written records."),
        (30, Severity::Urgent, "Urgent Improvement Necessary", "No effective food safety management system. Urgently implement SFBB, train all staff to Level 2, and establish documented procedures."),
    ];
    let (_, severity, label, short_advice) = *banded(BANDS, score);
    ScoreInterpretation {
        area: ScoreArea::ConfidenceInManagement,
        score,
        max_score: 30,
        label,
        severity,
        description: "How the business manages food safety — processes, staff training, documentation and record keeping.",
        short_advice,
    }
}

fn primary_action(area: ScoreArea) -> &'static str {
    match area {
        ScoreArea::Hygiene => "Review and improve your food handling procedures — temperature monitoring, cross-contamination controls, and storage practices.",
        ScoreArea::Structural => "Address premises condition — deep clean, fix maintenance issues, review pest control, and ensure adequate facilities.",
        ScoreArea::ConfidenceInManagement => "Implement a food safety management system (SFBB), train all food handlers to Level 2, and start keeping written records.",
    }
}

/// Build the full breakdown from a stored rating and its sub-scores.
/// Absent sub-scores (schemes without a numeric breakdown) are skipped.
pub fn interpret_rating(
    rating_value: &str,
    hygiene: Option<i32>,
    structural: Option<i32>,
    management: Option<i32>,
) -> RatingBreakdown {
    let rating = rating_value.parse::<i32>().unwrap_or(0);
    let overall = rating_label(rating_value).unwrap_or_else(|| {
        rating_label("0").expect("tier 0 is always labelled")
    });

    let mut scores = Vec::new();
    if let Some(s) = hygiene {
        scores.push(interpret_hygiene(s));
    }
    if let Some(s) = structural {
        scores.push(interpret_structural(s));
    }
    if let Some(s) = management {
        scores.push(interpret_management(s));
    }
    scores.sort_by_key(|s| s.severity);

    let (worst_area, primary) = match scores.first() {
        Some(worst) => (worst.area.friendly_name(), primary_action(worst.area)),
        None => ("overall compliance", ""),
    };

    RatingBreakdown {
        rating,
        overall,
        scores,
        worst_area,
        primary_action: primary,
    }
}
