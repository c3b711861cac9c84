//! Orchestrates VisionTool → Validator → Enhancer → SummaryGenerator →
//! Serializer into one annotation pass.

use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::core::enhancer::Enhancer;
use crate::core::schemas::{Annotation, ValidationStatus};
use crate::core::serializer::Serializer;
use crate::core::summary::SummaryGenerator;
use crate::core::validator::Validator;
use crate::core::vision::{ImageInput, VisionTool, DEFAULT_PROMPT};

/// The staging payload a `Pipeline::annotate` call assembles for
/// `Repository::save_request`. Named distinctly from `RequestRow`
/// because it omits fields the repository assigns (`id`, `created_at`).
#[derive(Debug, Clone)]
pub struct RequestPayload {
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
    pub processing_error: Option<String>,
}

pub struct AnnotateOutcome {
    pub annotation: Annotation,
    pub request_payload: RequestPayload,
    pub desc_text: String,
    pub primary_label: String,
}

pub struct Pipeline {
    vision: Arc<dyn VisionTool>,
    validator: Arc<Validator>,
    enhancer: Arc<dyn Enhancer>,
    summary_generator: Arc<SummaryGenerator>,
    /// Bounds concurrent VisionTool inferences to the configured number
    /// of model replicas (default 1).
    vision_permits: Arc<Semaphore>,
    max_validation_attempts: u32,
}

impl Pipeline {
    pub fn new(
        vision: Arc<dyn VisionTool>,
        validator: Arc<Validator>,
        enhancer: Arc<dyn Enhancer>,
        summary_generator: Arc<SummaryGenerator>,
        vision_worker_pool_size: usize,
        max_validation_attempts: u32,
    ) -> Self {
        Self {
            vision,
            validator,
            enhancer,
            summary_generator,
            vision_permits: Arc::new(Semaphore::new(vision_worker_pool_size.max(1))),
            max_validation_attempts,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn annotate(
        &self,
        image: &ImageInput,
        set_name: i64,
        path_url: &str,
        prompt: Option<&str>,
        patient_id: Option<&str>,
        enable_enhancement: bool,
    ) -> AnnotateOutcome {
        let prompt = prompt.unwrap_or(DEFAULT_PROMPT);

        // Step 1: vision analysis, serialized to the configured replica count.
        let permit = self.vision_permits.acquire().await.expect("semaphore not closed");
        let vision_result = self.vision.analyze(image, prompt).await;
        drop(permit);

        let vision_raw = match vision_result {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, set_name, path_url, "vision analysis failed");
                let annotation = empty_annotation();
                let request_payload = RequestPayload {
                    set_name,
                    path_url: path_url.to_string(),
                    vision_raw: String::new(),
                    structured_json: None,
                    validation_attempts: 1,
                    validation_status: ValidationStatus::Fallback.as_str().to_string(),
                    pydantic_output: serde_json::to_string(&annotation).unwrap_or_default(),
                    confidence_score: 0.0,
                    enhanced: false,
                    report: None,
                    urgency_level: None,
                    clinical_significance: None,
                    processing_error: Some(e.to_string()),
                };
                let clinical_summary = self.summary_generator.summarize(&annotation).await;
                let desc_text = Serializer::to_desc(&clinical_summary);
                let primary_label = Serializer::primary_label(&clinical_summary, &annotation);
                return AnnotateOutcome { annotation, request_payload, desc_text, primary_label };
            },
        };

        // Step 2: validation.
        let (mut annotation, structured_json, meta) = match self
            .validator
            .validate(&vision_raw, patient_id, self.max_validation_attempts)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, set_name, path_url, "validator unavailable");
                let annotation = empty_annotation();
                let request_payload = RequestPayload {
                    set_name,
                    path_url: path_url.to_string(),
                    vision_raw,
                    structured_json: None,
                    validation_attempts: 1,
                    validation_status: ValidationStatus::Fallback.as_str().to_string(),
                    pydantic_output: serde_json::to_string(&annotation).unwrap_or_default(),
                    confidence_score: 0.0,
                    enhanced: false,
                    report: None,
                    urgency_level: None,
                    clinical_significance: None,
                    processing_error: Some(e.to_string()),
                };
                let clinical_summary = self.summary_generator.summarize(&annotation).await;
                let desc_text = Serializer::to_desc(&clinical_summary);
                let primary_label = Serializer::primary_label(&clinical_summary, &annotation);
                return AnnotateOutcome { annotation, request_payload, desc_text, primary_label };
            },
        };

        // Step 3: enhancement, conditional on the caller opting in and
        // validation not having fallen back to the keyword parser.
        if enable_enhancement && meta.status != ValidationStatus::Fallback {
            annotation = self.enhancer.enhance(annotation).await;
        }

        // Step 4: assemble the staging payload.
        let request_payload = RequestPayload {
            set_name,
            path_url: path_url.to_string(),
            vision_raw,
            structured_json,
            validation_attempts: meta.attempts as i32,
            validation_status: meta.status.as_str().to_string(),
            pydantic_output: serde_json::to_string(&annotation).unwrap_or_default(),
            confidence_score: annotation.confidence_score,
            enhanced: annotation.gemini_enhanced,
            report: annotation.gemini_report.clone(),
            urgency_level: annotation.urgency_level.map(|u| u.as_str().to_string()),
            clinical_significance: annotation.clinical_significance.map(|c| c.as_str().to_string()),
            processing_error: None,
        };

        // Step 5: summarize.
        let clinical_summary = self.summary_generator.summarize(&annotation).await;
        let desc_text = Serializer::to_desc(&clinical_summary);

        // Step 6: label.
        let primary_label = Serializer::primary_label(&clinical_summary, &annotation);

        AnnotateOutcome { annotation, request_payload, desc_text, primary_label }
    }
}

fn empty_annotation() -> Annotation {
    Annotation {
        patient_id: None,
        findings: vec![],
        confidence_score: 0.0,
        generated_by: "pipeline".to_string(),
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
    use crate::config::LlmConfig;
    use crate::core::enhancer::NoopEnhancer;
    use crate::core::vision::MockVisionTool;

    fn test_pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(MockVisionTool::new("Findings: small right apical pneumothorax.")),
            Arc::new(Validator::new(LlmConfig { api_key: None, ..Default::default() }, 4)),
            Arc::new(NoopEnhancer),
            Arc::new(SummaryGenerator::new(LlmConfig { api_key: None, ..Default::default() }, 4)),
            1,
            2,
        )
    }

    #[tokio::test]
    async fn annotate_produces_fallback_result_without_llm() {
        let pipeline = test_pipeline();
        let image = ImageInput::new(vec![1, 2, 3], "image/jpeg");
        let outcome = pipeline.annotate(&image, 1, "img-1.png", None, Some("7"), false).await;

        assert_eq!(outcome.request_payload.validation_status, "fallback");
        assert!(outcome.request_payload.processing_error.is_none());
        assert!(!outcome.desc_text.is_empty());
        assert!(outcome.primary_label.chars().count() <= 20);
    }

    #[tokio::test]
    async fn annotate_records_vision_failure_without_aborting() {
        struct FailingVision;
        #[async_trait::async_trait]
        impl VisionTool for FailingVision {
            async fn analyze(
                &self,
                _image: &ImageInput,
                _prompt: &str,
            ) -> Result<String, crate::core::vision::VisionError> {
                Err(crate::core::vision::VisionError::VisionUnavailable("down".to_string()))
            }
        }

        let pipeline = Pipeline::new(
            Arc::new(FailingVision),
            Arc::new(Validator::new(LlmConfig { api_key: None, ..Default::default() }, 4)),
            Arc::new(NoopEnhancer),
            Arc::new(SummaryGenerator::new(LlmConfig { api_key: None, ..Default::default() }, 4)),
            1,
            2,
        );
        let image = ImageInput::new(vec![1], "image/jpeg");
        let outcome = pipeline.annotate(&image, 1, "img-2.png", None, None, false).await;

        assert!(outcome.request_payload.processing_error.is_some());
        assert_eq!(outcome.request_payload.confidence_score, 0.0);
        assert!(outcome.annotation.findings.is_empty());
    }
}
