//! Optional enhancement pass: asks an LLM for urgency/significance
//! context on top of an already-validated `Annotation`.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::LlmConfig;
use crate::core::llm_client::{ChatCall, LlmClient};
use crate::core::schemas::{Annotation, ClinicalSignificance, UrgencyLevel};

const SYSTEM_PROMPT: &str = "You are a senior radiologist reviewing a draft annotation. Given the \
findings below, respond with a JSON object: {\"report\": string (a short narrative report), \
\"urgency_level\": one of \"critical\"|\"urgent\"|\"routine\", \"clinical_significance\": one of \
\"high\"|\"medium\"|\"low\"}.";

#[derive(Debug, Deserialize)]
struct EnhancementResponse {
    report: String,
    urgency_level: String,
    clinical_significance: String,
}

/// `enhance(annotation, image?) -> annotation`. Failures never propagate;
/// callers get the unmodified annotation back.
#[async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, annotation: Annotation) -> Annotation;
}

pub struct LlmEnhancer {
    client: LlmClient,
    model: String,
}

impl LlmEnhancer {
    pub fn new(config: LlmConfig, llm_concurrency: usize) -> Self {
        let model = config.summary_model.clone();
        Self { client: LlmClient::new(config, llm_concurrency), model }
    }

    fn describe(annotation: &Annotation) -> String {
        let findings: Vec<String> = annotation
            .findings
            .iter()
            .map(|f| format!("{} at {} ({})", f.label, f.location, f.severity))
            .collect();
        format!(
            "Findings: {}\nConfidence: {:.2}\nNotes: {}",
            if findings.is_empty() { "none".to_string() } else { findings.join("; ") },
            annotation.confidence_score,
            annotation.additional_notes.as_deref().unwrap_or("none")
        )
    }
}

#[async_trait]
impl Enhancer for LlmEnhancer {
    async fn enhance(&self, mut annotation: Annotation) -> Annotation {
        if !self.client.is_available() {
            tracing::debug!("enhancer skipped: no LLM api key configured");
            return annotation;
        }

        let call = ChatCall {
            model: &self.model,
            system_prompt: SYSTEM_PROMPT,
            user_content: Self::describe(&annotation),
            json_mode: true,
            temperature: 0.2,
            max_tokens: None,
        };

        match self.client.chat::<EnhancementResponse>(call).await {
            Ok(response) => {
                let urgency_level = UrgencyLevel::parse(&response.urgency_level);
                let clinical_significance = ClinicalSignificance::parse(&response.clinical_significance);
                match (urgency_level, clinical_significance) {
                    (Some(urgency), Some(significance)) => {
                        annotation.gemini_enhanced = true;
                        annotation.gemini_report = Some(response.report);
                        annotation.urgency_level = Some(urgency);
                        annotation.clinical_significance = Some(significance);
                    },
                    _ => {
                        tracing::warn!(
                            urgency_level = %response.urgency_level,
                            clinical_significance = %response.clinical_significance,
                            "enhancer returned unrecognized enum value, leaving annotation unmodified"
                        );
                    },
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "enhancer call failed, leaving annotation unmodified");
            },
        }

        annotation
    }
}

/// A no-op enhancer used in tests and when enhancement is disabled.
pub struct NoopEnhancer;

#[async_trait]
impl Enhancer for NoopEnhancer {
    async fn enhance(&self, annotation: Annotation) -> Annotation {
        annotation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_annotation() -> Annotation {
        Annotation {
            patient_id: None,
            findings: vec![],
            confidence_score: 0.5,
            generated_by: "test".to_string(),
            additional_notes: None,
            gemini_enhanced: false,
            gemini_report: None,
            urgency_level: None,
            clinical_significance: None,
        }
    }

    #[tokio::test]
    async fn noop_enhancer_passes_through() {
        let annotation = sample_annotation();
        let result = NoopEnhancer.enhance(annotation.clone()).await;
        assert!(!result.gemini_enhanced);
    }

    #[tokio::test]
    async fn unavailable_llm_leaves_annotation_unmodified() {
        let enhancer = LlmEnhancer::new(LlmConfig { api_key: None, ..Default::default() }, 4);
        let result = enhancer.enhance(sample_annotation()).await;
        assert!(!result.gemini_enhanced);
        assert!(result.gemini_report.is_none());
    }
}
