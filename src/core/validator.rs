//! Converts a VisionTool's free-form text into an accepted `Annotation`.

use regex::Regex;
use std::sync::OnceLock;

use crate::core::llm_client::{ChatCall, LlmClient, LlmError};
use crate::core::schemas::{Annotation, Finding, ValidationStatus};
use crate::config::LlmConfig;
use crate::utils::StringExt;

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// Raised only when the structured-output service is unreachable on
    /// the first attempt *and* the fallback parser also cannot run
    /// because the vision text itself is empty.
    #[error("validator unavailable: {0}")]
    ValidatorUnavailable(String),
}

/// Outcome metadata returned alongside a validated `Annotation`.
#[derive(Debug, Clone)]
pub struct ValidationMeta {
    pub status: ValidationStatus,
    pub attempts: u32,
}

const SYSTEM_PROMPT: &str = "You are a radiology annotation assistant. Given a free-form description \
of findings in a medical image, extract a structured annotation. Respond only with a JSON object \
matching exactly these fields: {\"patient_id\": string|null, \"findings\": [{\"label\": string \
(<=20 chars), \"location\": string, \"severity\": string}], \"confidence_score\": number between 0 \
and 1, \"generated_by\": string, \"additional_notes\": string|null, \"gemini_enhanced\": false, \
\"gemini_report\": null, \"urgency_level\": null, \"clinical_significance\": null}. The last four \
fields are populated by a later enhancement step and must always be set exactly as shown above.";

/// The closed vocabulary recognized by the fallback parser.
const FALLBACK_VOCABULARY: &[&str] =
    &["pneumothorax", "fracture", "effusion", "consolidation", "opacity", "pneumonia", "normal"];

pub struct Validator {
    client: LlmClient,
    model: String,
}

impl Validator {
    pub fn new(config: LlmConfig, llm_concurrency: usize) -> Self {
        let model = config.structured_output_model.clone();
        Self { client: LlmClient::new(config, llm_concurrency), model }
    }

    /// Runs the retry protocol, falling back to the deterministic
    /// keyword parser after `max_attempts` failures.
    pub async fn validate(
        &self,
        vision_text: &str,
        patient_id: Option<&str>,
        max_attempts: u32,
    ) -> Result<(Annotation, Option<String>, ValidationMeta), ValidatorError> {
        let max_attempts = max_attempts.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            if !self.client.is_available() {
                if attempt == 1 && vision_text.trim().is_empty() {
                    return Err(ValidatorError::ValidatorUnavailable(
                        "structured-output service unreachable and vision text is empty".to_string(),
                    ));
                }
                last_error = Some("structured-output service unreachable".to_string());
                break;
            }

            let user_content = build_prompt(vision_text, patient_id, last_error.as_deref());
            let call = ChatCall {
                model: &self.model,
                system_prompt: SYSTEM_PROMPT,
                user_content,
                json_mode: true,
                temperature: 0.1,
                max_tokens: None,
            };

            match self.client.chat::<Annotation>(call).await {
                Ok(mut annotation) => {
                    annotation.additional_notes = annotation.additional_notes.clean();
                    match annotation.validate_full() {
                        Ok(()) if annotation.check_enhancement_invariant() => {
                            let raw = serde_json::to_string(&annotation).ok();
                            let status = if attempt == 1 {
                                ValidationStatus::Success
                            } else {
                                ValidationStatus::Retry
                            };
                            return Ok((annotation, raw, ValidationMeta { status, attempts: attempt }));
                        },
                        Ok(()) => {
                            last_error = Some("enhancement fields set before enhancement".to_string());
                        },
                        Err(e) => {
                            last_error = Some(e.to_string());
                        },
                    }
                },
                Err(e) => {
                    last_error = Some(format_llm_error(&e));
                    if !e.is_retryable() && !matches!(e, LlmError::ParseError(_)) {
                        break;
                    }
                },
            }
        }

        tracing::warn!(
            attempts = max_attempts,
            last_error = last_error.as_deref().unwrap_or(""),
            "validator exhausted attempts, using fallback parser"
        );
        let annotation = fallback_parse(vision_text);
        Ok((
            annotation,
            None,
            ValidationMeta { status: ValidationStatus::Fallback, attempts: max_attempts },
        ))
    }
}

fn format_llm_error(e: &LlmError) -> String {
    format!("{e}")
}

fn build_prompt(vision_text: &str, patient_id: Option<&str>, prior_failure: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(failure) = prior_failure {
        out.push_str("Your previous response failed validation: ");
        out.push_str(failure);
        out.push_str("\n\nRequired fields: patient_id (string or null), findings (array of objects \
with label <=20 chars, location, severity), confidence_score (number 0.0-1.0, e.g. 0.85), \
generated_by (string, e.g. \"llava-med-v1.5\"), additional_notes (string or null).\n\n");
    }
    out.push_str("Vision model output:\n");
    out.push_str(vision_text);
    out.push_str("\n\nPatient ID hint: ");
    out.push_str(patient_id.unwrap_or("unknown"));
    out
}

fn vocabulary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = FALLBACK_VOCABULARY.join("|");
        Regex::new(&format!(r"(?i)\b({pattern})\b")).expect("fallback vocabulary regex is valid")
    })
}

/// Keyword recognizer over the closed vocabulary.
fn fallback_parse(vision_text: &str) -> Annotation {
    let mut seen = std::collections::BTreeSet::new();
    for m in vocabulary_regex().find_iter(vision_text) {
        seen.insert(m.as_str().to_lowercase());
    }

    let findings: Vec<Finding> = if seen.is_empty() {
        vec![Finding::new("Analysis Incomplete", "Overall", "Unknown")
            .expect("literal fallback finding is valid")]
    } else {
        seen.into_iter()
            .map(|term| {
                Finding::new(term, "Unspecified", "Unknown").expect("vocabulary term fits label bound")
            })
            .collect()
    };

    Annotation {
        patient_id: None,
        findings,
        confidence_score: 0.30,
        generated_by: "fallback-parser".to_string(),
        additional_notes: None,
        gemini_enhanced: false,
        gemini_report: None,
        urgency_level: None,
        clinical_significance: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_api_key_falls_back_to_keyword_parser() {
        let validator = Validator::new(LlmConfig { api_key: None, ..Default::default() }, 4);
        let (annotation, raw, meta) = validator
            .validate("Small right apical pneumothorax noted.", Some("42"), 2)
            .await
            .unwrap();
        assert_eq!(meta.status, crate::core::schemas::ValidationStatus::Fallback);
        assert!(raw.is_none());
        assert_eq!(annotation.generated_by, "fallback-parser");
        assert_eq!(annotation.findings.len(), 1);
        assert_eq!(annotation.findings[0].label, "pneumothorax");
    }

    #[tokio::test]
    async fn fallback_with_no_known_terms_emits_incomplete_finding() {
        let validator = Validator::new(LlmConfig { api_key: None, ..Default::default() }, 4);
        let (annotation, _, _) = validator.validate("Study quality poor.", None, 1).await.unwrap();
        assert_eq!(annotation.findings.len(), 1);
        assert_eq!(annotation.findings[0].label, "Analysis Incomplete");
    }

    #[tokio::test]
    async fn empty_vision_text_without_api_key_is_unavailable() {
        let validator = Validator::new(LlmConfig { api_key: None, ..Default::default() }, 4);
        let result = validator.validate("", None, 2).await;
        assert!(result.is_err());
    }

    #[test]
    fn fallback_recognizes_multiple_terms() {
        let annotation = fallback_parse("There is a fracture and an effusion visible.");
        let labels: Vec<_> = annotation.findings.iter().map(|f| f.label.as_str()).collect();
        assert!(labels.contains(&"fracture"));
        assert!(labels.contains(&"effusion"));
    }
}
