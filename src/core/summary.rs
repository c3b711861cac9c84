//! Turns a validated `Annotation` into a `ClinicalSummary`.

use validator::Validate;

use crate::config::LlmConfig;
use crate::core::llm_client::{ChatCall, LlmClient};
use crate::core::schemas::{Annotation, ClinicalSummary};

const SYSTEM_PROMPT: &str = "You are writing a clinical summary for a radiology annotation. Respond \
with a JSON object: {\"primary_diagnosis\": string (<=100 chars), \"summary\": string (<=3500 chars), \
\"key_findings\": array of up to 5 strings, \"recommendations\": string|null (<=500 chars), \
\"confidence_note\": string|null (<=200 chars)}.";

pub struct SummaryGenerator {
    client: LlmClient,
    model: String,
}

impl SummaryGenerator {
    pub fn new(config: LlmConfig, llm_concurrency: usize) -> Self {
        let model = config.summary_model.clone();
        Self { client: LlmClient::new(config, llm_concurrency), model }
    }

    /// `summarize(annotation) -> ClinicalSummary`. Falls back to a
    /// deterministic minimal summary if the LLM is unavailable or its
    /// response fails `ClinicalSummary`'s field constraints.
    pub async fn summarize(&self, annotation: &Annotation) -> ClinicalSummary {
        if self.client.is_available() {
            let call = ChatCall {
                model: &self.model,
                system_prompt: SYSTEM_PROMPT,
                user_content: describe(annotation),
                json_mode: true,
                temperature: 0.2,
                max_tokens: None,
            };

            match self.client.chat::<ClinicalSummary>(call).await {
                Ok(summary) if summary.validate().is_ok() => return summary,
                Ok(_) => {
                    tracing::warn!("summary generator response failed field validation, using fallback");
                },
                Err(e) => {
                    tracing::warn!(error = %e, "summary generator call failed, using fallback");
                },
            }
        } else {
            tracing::debug!("summary generator skipped: no LLM api key configured");
        }

        deterministic_summary(annotation)
    }
}

fn describe(annotation: &Annotation) -> String {
    let findings: Vec<String> = annotation
        .findings
        .iter()
        .map(|f| format!("{} at {} ({})", f.label, f.location, f.severity))
        .collect();
    format!(
        "Findings: {}\nConfidence: {:.2}\nEnhanced: {}\nEnhancement report: {}",
        if findings.is_empty() { "none".to_string() } else { findings.join("; ") },
        annotation.confidence_score,
        annotation.gemini_enhanced,
        annotation.gemini_report.as_deref().unwrap_or("none")
    )
}

/// Deterministic minimal summary: `primary_diagnosis` from the first
/// finding's label, `summary` a formulaic concatenation of findings,
/// `key_findings` enumerating findings up to 5.
fn deterministic_summary(annotation: &Annotation) -> ClinicalSummary {
    let primary_diagnosis =
        annotation.findings.first().map(|f| f.label.clone()).unwrap_or_else(|| "No findings".to_string());

    let summary = if annotation.findings.is_empty() {
        "No findings were identified in this image.".to_string()
    } else {
        let parts: Vec<String> = annotation
            .findings
            .iter()
            .map(|f| format!("{} noted at {} ({} severity)", f.label, f.location, f.severity))
            .collect();
        parts.join(". ") + "."
    };

    let key_findings: Vec<String> =
        annotation.findings.iter().take(5).map(|f| f.label.clone()).collect();

    ClinicalSummary {
        primary_diagnosis,
        summary,
        key_findings,
        recommendations: None,
        confidence_note: Some(format!("Confidence score: {:.2}", annotation.confidence_score)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schemas::Finding;

    fn annotation_with_findings() -> Annotation {
        Annotation {
            patient_id: None,
            findings: vec![
                Finding::new("pneumothorax", "right apex", "moderate").unwrap(),
                Finding::new("fracture", "left rib 4", "mild").unwrap(),
            ],
            confidence_score: 0.72,
            generated_by: "test".to_string(),
            additional_notes: None,
            gemini_enhanced: false,
            gemini_report: None,
            urgency_level: None,
            clinical_significance: None,
        }
    }

    #[tokio::test]
    async fn no_api_key_uses_deterministic_summary() {
        let generator = SummaryGenerator::new(LlmConfig { api_key: None, ..Default::default() }, 4);
        let summary = generator.summarize(&annotation_with_findings()).await;
        assert_eq!(summary.primary_diagnosis, "pneumothorax");
        assert_eq!(summary.key_findings.len(), 2);
    }

    #[test]
    fn deterministic_summary_caps_key_findings_at_five() {
        let mut annotation = annotation_with_findings();
        for i in 0..10 {
            annotation.findings.push(Finding::new(format!("f{i}"), "loc", "mild").unwrap());
        }
        let summary = deterministic_summary(&annotation);
        assert_eq!(summary.key_findings.len(), 5);
    }

    #[test]
    fn deterministic_summary_handles_no_findings() {
        let mut annotation = annotation_with_findings();
        annotation.findings.clear();
        let summary = deterministic_summary(&annotation);
        assert_eq!(summary.primary_diagnosis, "No findings");
        assert!(summary.key_findings.is_empty());
    }
}
