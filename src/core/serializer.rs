//! Renders a validated `Annotation`/`ClinicalSummary` pair into the
//! size-bounded `desc` string and short `label` persisted on
//! `AnnotationRow`.

use crate::core::schemas::{Annotation, ClinicalSummary, Finding};
use crate::utils::StringExt;

const MAX_DESC_LEN: usize = 4000;
const HARD_TRUNCATE_AT: usize = 3900;
const NOTE_TRUNCATE_AT: usize = 500;
const REPORT_TRUNCATE_AT: usize = 800;
const ELLIPSIS: &str = "...";

/// Pure rendering/parsing functions; no owned state.
pub struct Serializer;

impl Serializer {
    /// Render the production `desc` field, applying the truncation
    /// priority (notes, then report, then a hard cut) until the result
    /// is `<= 4000` chars. A truncation event is logged but never fails
    /// the call.
    pub fn to_desc(summary: &ClinicalSummary) -> String {
        let mut confidence_note = summary.confidence_note.clone();
        let mut recommendations = summary.recommendations.clone();

        let mut rendered = render(summary, &recommendations, &confidence_note);
        if rendered.chars().count() <= MAX_DESC_LEN {
            return rendered;
        }

        tracing::warn!(len = rendered.chars().count(), "desc exceeds budget, shortening notes");
        confidence_note = confidence_note.map(|n| truncate_chars(&n, NOTE_TRUNCATE_AT));
        rendered = render(summary, &recommendations, &confidence_note);
        if rendered.chars().count() <= MAX_DESC_LEN {
            return rendered;
        }

        tracing::warn!(len = rendered.chars().count(), "desc still over budget, shortening report");
        recommendations = recommendations.map(|r| truncate_chars(&r, REPORT_TRUNCATE_AT));
        rendered = render(summary, &recommendations, &confidence_note);
        if rendered.chars().count() <= MAX_DESC_LEN {
            return rendered;
        }

        tracing::warn!(len = rendered.chars().count(), "desc still over budget, hard truncating");
        hard_truncate(&rendered)
    }

    /// Derive the short `label` field: the clinical summary's primary
    /// diagnosis, trimmed and capped to 20 chars; falling back to the
    /// first finding's label, then `"No findings"`.
    pub fn primary_label(summary: &ClinicalSummary, annotation: &Annotation) -> String {
        let trimmed = summary.primary_diagnosis.trimmed();
        if !trimmed.is_empty() {
            return truncate_chars(&trimmed, 20);
        }
        match annotation.findings.first() {
            Some(Finding { label, .. }) => truncate_chars(&label.trimmed(), 20),
            None => "No findings".to_string(),
        }
    }

    /// Coerce `patient_id` to an integer: parses if possible, else `0`.
    pub fn coerce_patient_id(patient_id: Option<&str>) -> i64 {
        patient_id.and_then(|s| s.trim().parse::<i64>().ok()).unwrap_or(0)
    }

    /// Parse a previously-rendered `desc` back into its component parts.
    /// Only covers what `to_desc` actually emits; satisfies the
    /// round-trip law `to_desc(parse(desc)) == desc` for any `desc`
    /// this module produced (no further truncation is triggered
    /// because a round-tripped summary is never longer than the
    /// original).
    pub fn parse(desc: &str) -> ParsedDesc {
        let mut primary_diagnosis = String::new();
        let mut summary_lines: Vec<String> = Vec::new();
        let mut key_findings = Vec::new();
        let mut recommendations = None;
        let mut confidence_note = None;

        enum Section {
            None,
            Summary,
            Findings,
            Recommendations,
            Note,
        }
        let mut section = Section::None;

        for line in desc.lines() {
            if let Some(rest) = line.strip_prefix("PRIMARY DIAGNOSIS: ") {
                primary_diagnosis = rest.to_string();
                section = Section::None;
            } else if line == "SUMMARY:" {
                section = Section::Summary;
            } else if line == "KEY FINDINGS:" {
                section = Section::Findings;
            } else if let Some(rest) = line.strip_prefix("RECOMMENDATIONS: ") {
                recommendations = Some(rest.to_string());
                section = Section::Recommendations;
            } else if let Some(rest) = line.strip_prefix("NOTE: ") {
                confidence_note = Some(rest.to_string());
                section = Section::Note;
            } else {
                match section {
                    Section::Summary if !line.is_empty() => summary_lines.push(line.to_string()),
                    Section::Findings => {
                        if let Some(item) = line.strip_prefix("- ") {
                            key_findings.push(item.to_string());
                        }
                    },
                    Section::Recommendations if !line.is_empty() => {
                        let existing = recommendations.get_or_insert_with(String::new);
                        existing.push('\n');
                        existing.push_str(line);
                    },
                    Section::Note if !line.is_empty() => {
                        let existing = confidence_note.get_or_insert_with(String::new);
                        existing.push('\n');
                        existing.push_str(line);
                    },
                    _ => {},
                }
            }
        }

        ParsedDesc {
            primary_diagnosis,
            summary: summary_lines.join("\n"),
            key_findings,
            recommendations,
            confidence_note,
        }
    }
}

/// Fields recovered by `Serializer::parse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDesc {
    pub primary_diagnosis: String,
    pub summary: String,
    pub key_findings: Vec<String>,
    pub recommendations: Option<String>,
    pub confidence_note: Option<String>,
}

impl ParsedDesc {
    pub fn into_clinical_summary(self) -> ClinicalSummary {
        ClinicalSummary {
            primary_diagnosis: self.primary_diagnosis,
            summary: self.summary,
            key_findings: self.key_findings,
            recommendations: self.recommendations,
            confidence_note: self.confidence_note,
        }
    }
}

fn render(
    summary: &ClinicalSummary,
    recommendations: &Option<String>,
    confidence_note: &Option<String>,
) -> String {
    let mut out = String::new();
    out.push_str("PRIMARY DIAGNOSIS: ");
    out.push_str(&summary.primary_diagnosis);
    out.push_str("\n\n");
    out.push_str("SUMMARY:\n");
    out.push_str(&summary.summary);

    if !summary.key_findings.is_empty() {
        out.push_str("\n\nKEY FINDINGS:\n");
        for finding in &summary.key_findings {
            out.push_str("- ");
            out.push_str(finding);
            out.push('\n');
        }
        if out.ends_with('\n') {
            out.pop();
        }
    }

    if let Some(rec) = recommendations {
        out.push_str("\n\nRECOMMENDATIONS: ");
        out.push_str(rec);
    }

    if let Some(note) = confidence_note {
        out.push_str("\n\nNOTE: ");
        out.push_str(note);
    }

    out
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

fn hard_truncate(s: &str) -> String {
    let budget = HARD_TRUNCATE_AT.saturating_sub(ELLIPSIS.chars().count());
    let mut truncated: String = s.chars().take(budget).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary() -> ClinicalSummary {
        ClinicalSummary {
            primary_diagnosis: "Right-sided pneumothorax".to_string(),
            summary: "Small apical pneumothorax without mediastinal shift.".to_string(),
            key_findings: vec!["pneumothorax - right apex".to_string()],
            recommendations: Some("Repeat imaging in 6 hours.".to_string()),
            confidence_note: Some("Confidence moderate given image quality.".to_string()),
        }
    }

    #[test]
    fn to_desc_starts_with_primary_diagnosis() {
        let desc = Serializer::to_desc(&sample_summary());
        assert!(desc.starts_with("PRIMARY DIAGNOSIS:"));
        assert!(desc.len() <= MAX_DESC_LEN);
    }

    #[test]
    fn to_desc_exactly_at_budget_is_unchanged() {
        let mut summary = sample_summary();
        let base = render(&summary, &summary.recommendations.clone(), &summary.confidence_note.clone());
        let padding = MAX_DESC_LEN - base.chars().count();
        summary.summary.push_str(&"x".repeat(padding));
        let desc = Serializer::to_desc(&summary);
        assert_eq!(desc.chars().count(), MAX_DESC_LEN);
    }

    #[test]
    fn to_desc_over_budget_is_truncated() {
        let mut summary = sample_summary();
        summary.summary.push_str(&"x".repeat(MAX_DESC_LEN));
        let desc = Serializer::to_desc(&summary);
        assert!(desc.chars().count() <= MAX_DESC_LEN);
        assert!(desc.ends_with(ELLIPSIS) || desc.len() < MAX_DESC_LEN);
    }

    #[test]
    fn round_trip_parse_to_desc() {
        let summary = sample_summary();
        let desc = Serializer::to_desc(&summary);
        let parsed = Serializer::parse(&desc).into_clinical_summary();
        let desc2 = Serializer::to_desc(&parsed);
        assert_eq!(desc, desc2);
    }

    #[test]
    fn primary_label_from_summary() {
        let summary = sample_summary();
        let annotation = Annotation {
            patient_id: None,
            findings: vec![],
            confidence_score: 0.8,
            generated_by: "test".to_string(),
            additional_notes: None,
            gemini_enhanced: false,
            gemini_report: None,
            urgency_level: None,
            clinical_significance: None,
        };
        let label = Serializer::primary_label(&summary, &annotation);
        assert!(label.chars().count() <= 20);
    }

    #[test]
    fn primary_label_falls_back_to_finding() {
        let summary = ClinicalSummary {
            primary_diagnosis: "   ".to_string(),
            summary: String::new(),
            key_findings: vec![],
            recommendations: None,
            confidence_note: None,
        };
        let annotation = Annotation {
            patient_id: None,
            findings: vec![Finding::new("fracture", "tibia", "mild").unwrap()],
            confidence_score: 0.4,
            generated_by: "test".to_string(),
            additional_notes: None,
            gemini_enhanced: false,
            gemini_report: None,
            urgency_level: None,
            clinical_significance: None,
        };
        assert_eq!(Serializer::primary_label(&summary, &annotation), "fracture");
    }

    #[test]
    fn primary_label_no_findings() {
        let summary = ClinicalSummary {
            primary_diagnosis: String::new(),
            summary: String::new(),
            key_findings: vec![],
            recommendations: None,
            confidence_note: None,
        };
        let annotation = Annotation {
            patient_id: None,
            findings: vec![],
            confidence_score: 0.0,
            generated_by: "test".to_string(),
            additional_notes: None,
            gemini_enhanced: false,
            gemini_report: None,
            urgency_level: None,
            clinical_significance: None,
        };
        assert_eq!(Serializer::primary_label(&summary, &annotation), "No findings");
    }

    #[test]
    fn coerce_patient_id_parses_or_defaults() {
        assert_eq!(Serializer::coerce_patient_id(Some("42")), 42);
        assert_eq!(Serializer::coerce_patient_id(Some("P-42")), 0);
        assert_eq!(Serializer::coerce_patient_id(None), 0);
    }
}
