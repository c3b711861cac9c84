//! Two-tier persistence: staging `request_rows` and production
//! `annotation_rows`, keyed by `(set_name, path_url)`.

use sqlx::{Row, SqlitePool};

use crate::core::pipeline::RequestPayload;
use crate::core::schemas::{AnnotationRow, AnnotationWithRequest, PipelineStats, RequestRow, StatusCounts};

/// Matches `schemas::Finding::label`'s bound and `ParsedDesc`'s budget.
const MAX_LABEL_LEN: usize = 20;
const MAX_DESC_LEN: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request {0} not found")]
    RequestNotFound(i64),
    #[error("annotation for set {0} path {1} not found")]
    AnnotationNotFound(i64, String),
    #[error("{field} must be at most {max} chars, got {actual}")]
    TooLong { field: &'static str, max: usize, actual: usize },
}

pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert by `(set_name, path_url)`. An existing row's `flagged`
    /// value is preserved; `processed` is always reset to `false`
    /// because a re-save means re-processing.
    pub async fn save_request(&self, payload: &RequestPayload) -> Result<i64, RepositoryError> {
        let existing = sqlx::query("SELECT id, flagged FROM request_rows WHERE set_name = ? AND path_url = ?")
            .bind(payload.set_name)
            .bind(&payload.path_url)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = existing {
            let id: i64 = row.try_get("id")?;
            sqlx::query(
                r#"UPDATE request_rows SET
                    vision_raw = ?, structured_json = ?, validation_attempts = ?,
                    validation_status = ?, pydantic_output = ?, confidence_score = ?,
                    enhanced = ?, report = ?, urgency_level = ?, clinical_significance = ?,
                    processed = FALSE, processing_error = ?
                   WHERE id = ?"#,
            )
            .bind(&payload.vision_raw)
            .bind(&payload.structured_json)
            .bind(payload.validation_attempts)
            .bind(&payload.validation_status)
            .bind(&payload.pydantic_output)
            .bind(payload.confidence_score)
            .bind(payload.enhanced)
            .bind(&payload.report)
            .bind(&payload.urgency_level)
            .bind(&payload.clinical_significance)
            .bind(&payload.processing_error)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(id)
        } else {
            let result = sqlx::query(
                r#"INSERT INTO request_rows
                    (set_name, path_url, vision_raw, structured_json, validation_attempts,
                     validation_status, pydantic_output, confidence_score, enhanced, report,
                     urgency_level, clinical_significance, flagged, processed, processing_error)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE, FALSE, ?)"#,
            )
            .bind(payload.set_name)
            .bind(&payload.path_url)
            .bind(&payload.vision_raw)
            .bind(&payload.structured_json)
            .bind(payload.validation_attempts)
            .bind(&payload.validation_status)
            .bind(&payload.pydantic_output)
            .bind(payload.confidence_score)
            .bind(payload.enhanced)
            .bind(&payload.report)
            .bind(&payload.urgency_level)
            .bind(&payload.clinical_significance)
            .bind(&payload.processing_error)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        }
    }

    pub async fn get_unprocessed(&self, set_name: i64) -> Result<Vec<RequestRow>, RepositoryError> {
        sqlx::query_as::<_, RequestRow>(
            "SELECT * FROM request_rows WHERE set_name = ? AND processed = FALSE ORDER BY created_at ASC",
        )
        .bind(set_name)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)
    }

    /// All rows for a dataset, used by `analyze_dataset --force` to
    /// re-run already-processed rows as well as pending ones.
    pub async fn get_all_requests(&self, set_name: i64) -> Result<Vec<RequestRow>, RepositoryError> {
        sqlx::query_as::<_, RequestRow>(
            "SELECT * FROM request_rows WHERE set_name = ? ORDER BY created_at ASC",
        )
        .bind(set_name)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)
    }

    pub async fn get_request(&self, request_id: i64) -> Result<RequestRow, RepositoryError> {
        sqlx::query_as::<_, RequestRow>("SELECT * FROM request_rows WHERE id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::RequestNotFound(request_id))
    }

    /// Atomically (a) ensures the `Label` row exists, (b) upserts the
    /// `AnnotationRow`, (c) marks the `RequestRow` processed. All three
    /// writes commit together.
    pub async fn process_request(
        &self,
        request_id: i64,
        desc_text: &str,
        primary_label: &str,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let request = sqlx::query("SELECT set_name, path_url, pydantic_output FROM request_rows WHERE id = ?")
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(RepositoryError::RequestNotFound(request_id))?;
        let set_name: i64 = request.try_get("set_name")?;
        let path_url: String = request.try_get("path_url")?;
        let pydantic_output: String = request.try_get("pydantic_output")?;

        let patient_id = extract_patient_id(&pydantic_output);

        sqlx::query("INSERT OR IGNORE INTO labels (set_name, label) VALUES (?, ?)")
            .bind(set_name)
            .bind(primary_label)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"INSERT INTO annotation_rows (set_name, path_url, label, patient_id, desc, request_id)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(set_name, path_url) DO UPDATE SET
                 label = excluded.label, patient_id = excluded.patient_id,
                 desc = excluded.desc, request_id = excluded.request_id"#,
        )
        .bind(set_name)
        .bind(&path_url)
        .bind(primary_label)
        .bind(patient_id)
        .bind(desc_text)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE request_rows SET processed = TRUE WHERE id = ?")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_annotation_with_request(
        &self,
        set_name: i64,
        path_url: &str,
    ) -> Result<AnnotationWithRequest, RepositoryError> {
        let annotation = sqlx::query_as::<_, AnnotationRow>(
            "SELECT * FROM annotation_rows WHERE set_name = ? AND path_url = ?",
        )
        .bind(set_name)
        .bind(path_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::AnnotationNotFound(set_name, path_url.to_string()))?;

        let request = self.get_request(annotation.request_id).await?;
        Ok(AnnotationWithRequest { annotation, request })
    }

    /// Manual edit; does not touch the owning `RequestRow`. Rejects with
    /// `TooLong` rather than writing a row that breaks the length bounds
    /// `label <= 20 chars` / `desc <= 4000 chars`.
    pub async fn update_annotation(
        &self,
        set_name: i64,
        path_url: &str,
        label: Option<&str>,
        desc: Option<&str>,
    ) -> Result<AnnotationRow, RepositoryError> {
        if let Some(label) = label {
            let len = label.chars().count();
            if len > MAX_LABEL_LEN {
                return Err(RepositoryError::TooLong { field: "label", max: MAX_LABEL_LEN, actual: len });
            }
        }
        if let Some(desc) = desc {
            let len = desc.chars().count();
            if len > MAX_DESC_LEN {
                return Err(RepositoryError::TooLong { field: "desc", max: MAX_DESC_LEN, actual: len });
            }
        }

        if let Some(label) = label {
            sqlx::query("UPDATE annotation_rows SET label = ? WHERE set_name = ? AND path_url = ?")
                .bind(label)
                .bind(set_name)
                .bind(path_url)
                .execute(&self.pool)
                .await?;
        }
        if let Some(desc) = desc {
            sqlx::query("UPDATE annotation_rows SET desc = ? WHERE set_name = ? AND path_url = ?")
                .bind(desc)
                .bind(set_name)
                .bind(path_url)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query_as::<_, AnnotationRow>(
            "SELECT * FROM annotation_rows WHERE set_name = ? AND path_url = ?",
        )
        .bind(set_name)
        .bind(path_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::AnnotationNotFound(set_name, path_url.to_string()))
    }

    /// Removes only the `AnnotationRow`; the owning `RequestRow` is kept
    /// unless the caller explicitly performs a deep delete.
    pub async fn delete_annotation(&self, set_name: i64, path_url: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM annotation_rows WHERE set_name = ? AND path_url = ?")
            .bind(set_name)
            .bind(path_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Toggles `flagged`. If no `RequestRow` exists and `flagged = true`,
    /// a placeholder row is created; if `flagged = false` and no row
    /// exists, this is a no-op returning `false`.
    pub async fn flag(&self, set_name: i64, path_url: &str, flagged: bool) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE request_rows SET flagged = ? WHERE set_name = ? AND path_url = ?",
        )
        .bind(flagged)
        .bind(set_name)
        .bind(path_url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        if !flagged {
            return Ok(false);
        }

        sqlx::query(
            r#"INSERT INTO request_rows
                (set_name, path_url, vision_raw, structured_json, validation_attempts,
                 validation_status, pydantic_output, confidence_score, enhanced, flagged,
                 processed, processing_error)
               VALUES (?, ?, '', NULL, 1, 'pending', '', 0.0, FALSE, TRUE, FALSE, 'awaiting analysis')"#,
        )
        .bind(set_name)
        .bind(path_url)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    pub async fn get_annotations(&self, set_name: i64) -> Result<Vec<AnnotationRow>, RepositoryError> {
        sqlx::query_as::<_, AnnotationRow>(
            "SELECT * FROM annotation_rows WHERE set_name = ? ORDER BY path_url ASC",
        )
        .bind(set_name)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)
    }

    pub async fn get_flagged(&self, set_name: i64) -> Result<Vec<RequestRow>, RepositoryError> {
        sqlx::query_as::<_, RequestRow>(
            "SELECT * FROM request_rows WHERE set_name = ? AND flagged = TRUE ORDER BY created_at ASC",
        )
        .bind(set_name)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)
    }

    pub async fn pipeline_stats(&self, set_name: i64) -> Result<PipelineStats, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT
                 COUNT(*) AS total,
                 SUM(CASE WHEN processed THEN 1 ELSE 0 END) AS processed,
                 SUM(CASE WHEN NOT processed THEN 1 ELSE 0 END) AS unprocessed,
                 SUM(CASE WHEN validation_status = 'success' THEN 1 ELSE 0 END) AS success,
                 SUM(CASE WHEN validation_status = 'retry' THEN 1 ELSE 0 END) AS retry,
                 SUM(CASE WHEN validation_status = 'fallback' THEN 1 ELSE 0 END) AS fallback,
                 SUM(CASE WHEN enhanced THEN 1 ELSE 0 END) AS enhanced_count,
                 AVG(confidence_score) AS avg_confidence
               FROM request_rows WHERE set_name = ?"#,
        )
        .bind(set_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(PipelineStats {
            total: row.try_get::<i64, _>("total")?,
            processed: row.try_get::<Option<i64>, _>("processed")?.unwrap_or(0),
            unprocessed: row.try_get::<Option<i64>, _>("unprocessed")?.unwrap_or(0),
            by_status: StatusCounts {
                success: row.try_get::<Option<i64>, _>("success")?.unwrap_or(0),
                retry: row.try_get::<Option<i64>, _>("retry")?.unwrap_or(0),
                fallback: row.try_get::<Option<i64>, _>("fallback")?.unwrap_or(0),
            },
            enhanced_count: row.try_get::<Option<i64>, _>("enhanced_count")?.unwrap_or(0),
            avg_confidence: row.try_get("avg_confidence")?,
        })
    }
}

fn extract_patient_id(pydantic_output: &str) -> i64 {
    use crate::core::serializer::Serializer;
    serde_json::from_str::<serde_json::Value>(pydantic_output)
        .ok()
        .and_then(|v| v.get("patient_id").and_then(|p| p.as_str().map(|s| s.to_string())))
        .map(|s| Serializer::coerce_patient_id(Some(&s)))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite connection");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrations run");
        pool
    }

    fn sample_payload(set_name: i64, path_url: &str) -> RequestPayload {
        RequestPayload {
            set_name,
            path_url: path_url.to_string(),
            vision_raw: "Findings: pneumothorax.".to_string(),
            structured_json: None,
            validation_attempts: 1,
            validation_status: "success".to_string(),
            pydantic_output: r#"{"patient_id":"42","findings":[],"confidence_score":0.9,
                "generated_by":"test","additional_notes":null,"gemini_enhanced":false,
                "gemini_report":null,"urgency_level":null,"clinical_significance":null}"#
                .to_string(),
            confidence_score: 0.9,
            enhanced: false,
            report: None,
            urgency_level: None,
            clinical_significance: None,
            processing_error: None,
        }
    }

    #[tokio::test]
    async fn save_then_get_unprocessed() {
        let repo = Repository::new(test_pool().await);
        let id = repo.save_request(&sample_payload(1, "a.png")).await.unwrap();
        assert!(id > 0);
        let unprocessed = repo.get_unprocessed(1).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert!(!unprocessed[0].processed);
    }

    #[tokio::test]
    async fn process_request_is_atomic_and_sets_processed() {
        let repo = Repository::new(test_pool().await);
        let id = repo.save_request(&sample_payload(1, "a.png")).await.unwrap();
        repo.process_request(id, "PRIMARY DIAGNOSIS: pneumothorax", "pneumothorax").await.unwrap();

        let request = repo.get_request(id).await.unwrap();
        assert!(request.processed);

        let joined = repo.get_annotation_with_request(1, "a.png").await.unwrap();
        assert_eq!(joined.annotation.label, "pneumothorax");
        assert_eq!(joined.annotation.patient_id, 42);

        let annotations = repo.get_annotations(1).await.unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].path_url, "a.png");
    }

    #[tokio::test]
    async fn save_request_preserves_flagged_across_reprocess() {
        let repo = Repository::new(test_pool().await);
        let id = repo.save_request(&sample_payload(1, "a.png")).await.unwrap();
        repo.flag(1, "a.png", true).await.unwrap();

        repo.save_request(&sample_payload(1, "a.png")).await.unwrap();
        let flagged = repo.get_flagged(1).await.unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, id);
    }

    #[tokio::test]
    async fn flag_on_missing_row_creates_placeholder_only_when_true() {
        let repo = Repository::new(test_pool().await);
        assert!(!repo.flag(2, "missing.png", false).await.unwrap());
        assert!(repo.flag(2, "missing.png", true).await.unwrap());
        let flagged = repo.get_flagged(2).await.unwrap();
        assert_eq!(flagged.len(), 1);
    }

    #[tokio::test]
    async fn flag_placeholder_satisfies_output_or_error_invariant() {
        let repo = Repository::new(test_pool().await);
        repo.flag(3, "missing.png", true).await.unwrap();
        let row = repo.get_request(1).await.unwrap();
        assert!(row.typed_annotation().is_none());
        assert!(row.processing_error.as_deref().is_some_and(|e| !e.is_empty()));
        assert_eq!(row.validation_attempts, 1);
        assert_ne!(row.validation_status, "fallback");
    }

    #[tokio::test]
    async fn flag_placeholder_does_not_inflate_fallback_tally() {
        let repo = Repository::new(test_pool().await);
        repo.flag(4, "missing.png", true).await.unwrap();
        let stats = repo.pipeline_stats(4).await.unwrap();
        assert_eq!(stats.by_status.fallback, 0);
        assert_eq!(stats.unprocessed, 1);
    }

    #[tokio::test]
    async fn update_annotation_rejects_overlong_label_and_desc() {
        let repo = Repository::new(test_pool().await);
        let id = repo.save_request(&sample_payload(1, "a.png")).await.unwrap();
        repo.process_request(id, "desc", "label").await.unwrap();

        let err = repo.update_annotation(1, "a.png", Some(&"x".repeat(21)), None).await.unwrap_err();
        assert!(matches!(err, RepositoryError::TooLong { field: "label", .. }));

        let err = repo.update_annotation(1, "a.png", None, Some(&"y".repeat(4001))).await.unwrap_err();
        assert!(matches!(err, RepositoryError::TooLong { field: "desc", .. }));

        // rejected edits must not have been persisted
        let unchanged = repo.get_annotation_with_request(1, "a.png").await.unwrap();
        assert_eq!(unchanged.annotation.label, "label");
        assert_eq!(unchanged.annotation.desc, "desc");
    }

    #[tokio::test]
    async fn pipeline_stats_counts_by_status() {
        let repo = Repository::new(test_pool().await);
        repo.save_request(&sample_payload(1, "a.png")).await.unwrap();
        let mut fallback_payload = sample_payload(1, "b.png");
        fallback_payload.validation_status = "fallback".to_string();
        repo.save_request(&fallback_payload).await.unwrap();

        let stats = repo.pipeline_stats(1).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.success, 1);
        assert_eq!(stats.by_status.fallback, 1);
    }

    #[tokio::test]
    async fn delete_annotation_leaves_request_row_intact() {
        let repo = Repository::new(test_pool().await);
        let id = repo.save_request(&sample_payload(1, "a.png")).await.unwrap();
        repo.process_request(id, "desc", "label").await.unwrap();
        repo.delete_annotation(1, "a.png").await.unwrap();

        assert!(repo.get_annotation_with_request(1, "a.png").await.is_err());
        assert!(repo.get_request(id).await.is_ok());
    }
}
