//! Typed contracts for the annotation pipeline: `Finding`, `Annotation`,
//! `ClinicalSummary`, and the two persisted row shapes (`RequestRow`,
//! `AnnotationRow`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::utils::StringExt;

/// A single radiological finding extracted from an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Finding {
    #[validate(length(min = 1, max = 20, message = "label must be 1-20 chars after trim"))]
    pub label: String,
    #[validate(length(max = 100))]
    pub location: String,
    #[validate(length(max = 50))]
    pub severity: String,
}

impl Finding {
    /// Construct a `Finding`, trimming `label` first so the non-empty
    /// invariant is checked against the trimmed value.
    pub fn new(
        label: impl Into<String>,
        location: impl Into<String>,
        severity: impl Into<String>,
    ) -> Result<Self, validator::ValidationErrors> {
        let finding =
            Self { label: label.into().trimmed(), location: location.into(), severity: severity.into() };
        finding.validate()?;
        Ok(finding)
    }
}

/// `validation_status` ∈ {success, retry, fallback}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Success,
    Retry,
    Fallback,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "retry" => Some(Self::Retry),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Critical,
    Urgent,
    Routine,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Urgent => "urgent",
            Self::Routine => "routine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "urgent" => Some(Self::Urgent),
            "routine" => Some(Self::Routine),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClinicalSignificance {
    High,
    Medium,
    Low,
}

impl ClinicalSignificance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// The validated, typed output of the annotation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Annotation {
    pub patient_id: Option<String>,
    pub findings: Vec<Finding>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_score: f64,
    pub generated_by: String,
    pub additional_notes: Option<String>,
    pub gemini_enhanced: bool,
    pub gemini_report: Option<String>,
    pub urgency_level: Option<UrgencyLevel>,
    pub clinical_significance: Option<ClinicalSignificance>,
}

impl Annotation {
    /// Checks the cross-field invariant that unenhanced annotations
    /// carry no enhancement fields. `#[derive(Validate)]`
    /// only covers single-field constraints, so this is checked
    /// separately wherever an `Annotation` is accepted from an external
    /// source (LLM response, fallback parser).
    pub fn check_enhancement_invariant(&self) -> bool {
        if self.gemini_enhanced {
            true
        } else {
            self.gemini_report.is_none()
                && self.urgency_level.is_none()
                && self.clinical_significance.is_none()
        }
    }

    pub fn validate_full(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;
        for f in &self.findings {
            f.validate()?;
        }
        Ok(())
    }
}

/// The human-facing clinical write-up derived from an `Annotation`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClinicalSummary {
    #[validate(length(max = 100))]
    pub primary_diagnosis: String,
    #[validate(length(max = 3500))]
    pub summary: String,
    #[validate(length(max = 5))]
    pub key_findings: Vec<String>,
    #[validate(length(max = 500))]
    pub recommendations: Option<String>,
    #[validate(length(max = 200))]
    pub confidence_note: Option<String>,
}

/// Tier-1 staging record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RequestRow {
    pub id: i64,
    pub set_name: i64,
    pub path_url: String,
    pub vision_raw: String,
    pub structured_json: Option<String>,
    pub validation_attempts: i32,
    pub validation_status: String,
    pub pydantic_output: String,
    pub confidence_score: f64,
    pub enhanced: bool,
    pub report: Option<String>,
    pub urgency_level: Option<String>,
    pub clinical_significance: Option<String>,
    pub flagged: bool,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processing_error: Option<String>,
}

impl RequestRow {
    pub fn validation_status_enum(&self) -> Option<ValidationStatus> {
        ValidationStatus::parse(&self.validation_status)
    }

    /// Deserializes `pydantic_output` into a validated `Annotation`.
    /// Either it deserializes to a valid `Annotation` or
    /// `processing_error` is non-empty.
    pub fn typed_annotation(&self) -> Option<Annotation> {
        let annotation: Annotation = serde_json::from_str(&self.pydantic_output).ok()?;
        annotation.validate_full().ok()?;
        Some(annotation)
    }
}

/// Tier-2 production record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AnnotationRow {
    pub set_name: i64,
    pub path_url: String,
    pub label: String,
    pub patient_id: i64,
    pub desc: String,
    pub request_id: i64,
}

/// Result returned by `Repository::get_annotation_with_request`:
/// an `AnnotationRow` joined to the `RequestRow` that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationWithRequest {
    pub annotation: AnnotationRow,
    pub request: RequestRow,
}

/// Aggregate counters returned by `Repository::pipeline_stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total: i64,
    pub processed: i64,
    pub unprocessed: i64,
    pub by_status: StatusCounts,
    pub enhanced_count: i64,
    pub avg_confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: i64,
    pub retry: i64,
    pub fallback: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_trims_label() {
        let f = Finding::new("  pneumothorax  ", "right lung", "moderate").unwrap();
        assert_eq!(f.label, "pneumothorax");
    }

    #[test]
    fn finding_rejects_blank_label() {
        assert!(Finding::new("   ", "loc", "sev").is_err());
    }

    #[test]
    fn finding_rejects_overlong_label() {
        assert!(Finding::new("a".repeat(21), "loc", "sev").is_err());
    }

    #[test]
    fn annotation_enhancement_invariant() {
        let base = Annotation {
            patient_id: None,
            findings: vec![],
            confidence_score: 0.5,
            generated_by: "test".to_string(),
            additional_notes: None,
            gemini_enhanced: false,
            gemini_report: Some("should not be here".to_string()),
            urgency_level: None,
            clinical_significance: None,
        };
        assert!(!base.check_enhancement_invariant());
    }

    #[test]
    fn confidence_score_out_of_range_fails_validation() {
        let a = Annotation {
            patient_id: None,
            findings: vec![],
            confidence_score: 1.01,
            generated_by: "test".to_string(),
            additional_notes: None,
            gemini_enhanced: false,
            gemini_report: None,
            urgency_level: None,
            clinical_significance: None,
        };
        assert!(a.validate_full().is_err());
    }

    #[test]
    fn validation_status_round_trips() {
        for s in [ValidationStatus::Success, ValidationStatus::Retry, ValidationStatus::Fallback] {
            assert_eq!(ValidationStatus::parse(s.as_str()), Some(s));
        }
    }
}
