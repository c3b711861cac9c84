//! Answers questions about a dataset using a built context bundle and
//! an LLM that may invoke one declared tool.

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::core::llm_client::{ChatCall, LlmClient};
use crate::core::pipeline::Pipeline;
use crate::core::repository::{Repository, RepositoryError};
use crate::core::vision::ImageInput;

const SYSTEM_PROMPT: &str = "You are an assistant helping a radiologist review an annotated image \
dataset. Use the context provided to answer the question. If the user asks you to re-analyze \
flagged images, respond with exactly the line TOOL_CALL: analyze_flagged and nothing else; \
otherwise answer directly in plain text.";

const TOOL_CALL_MARKER: &str = "TOOL_CALL: analyze_flagged";
const MAX_FLAGGED_SUMMARIES: usize = 10;
const MAX_RECENT_VISION_OUTPUTS: usize = 5;
const RECENT_VISION_TRUNCATE_AT: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct ChatTool {
    client: LlmClient,
    model: String,
    repository: Arc<Repository>,
    pipeline: Arc<Pipeline>,
}

impl ChatTool {
    pub fn new(
        config: LlmConfig,
        repository: Arc<Repository>,
        pipeline: Arc<Pipeline>,
        llm_concurrency: usize,
    ) -> Self {
        let model = config.chat_model.clone();
        Self { client: LlmClient::new(config, llm_concurrency), model, repository, pipeline }
    }

    /// `chat(message, set_name, request_id?)`: focused mode iff
    /// `request_id` is provided.
    pub async fn chat(
        &self,
        message: &str,
        set_name: i64,
        request_id: Option<i64>,
    ) -> Result<String, ChatError> {
        if !self.client.is_available() {
            return Err(ChatError::ServiceUnavailable("LLM api key not configured".to_string()));
        }

        let context = match request_id {
            Some(id) => self.build_focused_context(id).await?,
            None => self.build_general_context(set_name).await?,
        };

        let user_content = format!("Context:\n{context}\n\nQuestion: {message}");
        let call = ChatCall {
            model: &self.model,
            system_prompt: SYSTEM_PROMPT,
            user_content,
            json_mode: false,
            temperature: 0.3,
            max_tokens: None,
        };

        let reply = self
            .client
            .chat_text(call)
            .await
            .map_err(|e| ChatError::ServiceUnavailable(e.to_string()))?;

        if reply.trim() == TOOL_CALL_MARKER {
            return Ok(self.analyze_flagged(set_name, None, None).await);
        }

        Ok(reply)
    }

    async fn build_focused_context(&self, request_id: i64) -> Result<String, RepositoryError> {
        let request = self.repository.get_request(request_id).await?;
        Ok(format!(
            "Focused request #{}: path={} status={} attempts={} confidence={:.2} flagged={} \
             processed={} vision_raw={}",
            request.id,
            request.path_url,
            request.validation_status,
            request.validation_attempts,
            request.confidence_score,
            request.flagged,
            request.processed,
            request.vision_raw,
        ))
    }

    async fn build_general_context(&self, set_name: i64) -> Result<String, RepositoryError> {
        let stats = self.repository.pipeline_stats(set_name).await?;
        let flagged = self.repository.get_flagged(set_name).await?;
        let recent = self.repository.get_unprocessed(set_name).await?;

        let mut out = format!(
            "Dataset {set_name}: total={} processed={} unprocessed={} success={} retry={} \
             fallback={} enhanced={}",
            stats.total,
            stats.processed,
            stats.unprocessed,
            stats.by_status.success,
            stats.by_status.retry,
            stats.by_status.fallback,
            stats.enhanced_count,
        );

        out.push_str(&format!("\nFlagged rows ({}):", flagged.len()));
        for row in flagged.iter().take(MAX_FLAGGED_SUMMARIES) {
            out.push_str(&format!("\n- {} (status={})", row.path_url, row.validation_status));
        }

        out.push_str("\nRecent vision outputs:");
        for row in recent.iter().take(MAX_RECENT_VISION_OUTPUTS) {
            let truncated: String = row.vision_raw.chars().take(RECENT_VISION_TRUNCATE_AT).collect();
            out.push_str(&format!("\n- {}: {}", row.path_url, truncated));
        }

        Ok(out)
    }

    /// `analyze_flagged(set_name, paths?, prompt?)`: runs the pipeline
    /// in-process over unprocessed flagged rows. A tool call must never
    /// recurse through an HTTP surface.
    pub async fn analyze_flagged(
        &self,
        set_name: i64,
        paths: Option<&[String]>,
        prompt: Option<&str>,
    ) -> String {
        let flagged = match self.repository.get_flagged(set_name).await {
            Ok(rows) => rows,
            Err(e) => return format!("failed to load flagged rows: {e}"),
        };

        let targets: Vec<_> = flagged
            .into_iter()
            .filter(|row| !row.processed)
            .filter(|row| paths.is_none_or(|p| p.contains(&row.path_url)))
            .collect();

        let mut processed = 0usize;
        let mut errors = Vec::new();
        for row in &targets {
            let image = ImageInput::new(Vec::new(), "application/octet-stream");
            let outcome = self
                .pipeline
                .annotate(&image, set_name, &row.path_url, prompt, None, false)
                .await;
            match self.repository.save_request(&outcome.request_payload).await {
                Ok(request_id) => {
                    match self
                        .repository
                        .process_request(request_id, &outcome.desc_text, &outcome.primary_label)
                        .await
                    {
                        Ok(()) => processed += 1,
                        Err(e) => errors.push(format!("{}: {e}", row.path_url)),
                    }
                },
                Err(e) => errors.push(format!("{}: {e}", row.path_url)),
            }
        }

        if errors.is_empty() {
            format!("Re-analyzed {processed} flagged image(s).")
        } else {
            format!("Re-analyzed {processed} flagged image(s); {} error(s): {}", errors.len(), errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enhancer::NoopEnhancer;
    use crate::core::summary::SummaryGenerator;
    use crate::core::validator::Validator;
    use crate::core::vision::MockVisionTool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_repository() -> Arc<Repository> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Arc::new(Repository::new(pool))
    }

    fn test_pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(MockVisionTool::default()),
            Arc::new(Validator::new(LlmConfig { api_key: None, ..Default::default() }, 4)),
            Arc::new(NoopEnhancer),
            Arc::new(SummaryGenerator::new(LlmConfig { api_key: None, ..Default::default() }, 4)),
            1,
            2,
        ))
    }

    #[tokio::test]
    async fn chat_without_api_key_is_unavailable() {
        let repository = test_repository().await;
        let tool =
            ChatTool::new(LlmConfig { api_key: None, ..Default::default() }, repository, test_pipeline(), 4);
        let result = tool.chat("how many rows?", 1, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn analyze_flagged_processes_only_unprocessed_flagged_rows() {
        let repository = test_repository().await;
        repository.flag(1, "a.png", true).await.unwrap();
        repository.flag(1, "b.png", true).await.unwrap();

        let tool = ChatTool::new(
            LlmConfig { api_key: None, ..Default::default() },
            repository.clone(),
            test_pipeline(),
            4,
        );
        let status = tool.analyze_flagged(1, None, None).await;
        assert!(status.contains("Re-analyzed 2"));

        let request = repository.get_request(1).await.unwrap();
        assert!(request.processed);
    }
}
