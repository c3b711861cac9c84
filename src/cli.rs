//! Thin CLI front-end over the pipeline, repository, and chat tool.
//! This process is the boundary caller, not part of the annotation
//! core itself.

use clap::Subcommand;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Register a batch of image paths under a dataset for later analysis.
    LoadDataset {
        #[arg(long)]
        set_name: i64,
        /// Image file paths to register.
        paths: Vec<String>,
    },
    /// Run the annotation pipeline over a dataset's unprocessed images.
    AnalyzeDataset {
        #[arg(long)]
        set_name: i64,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        enable_enhancement: bool,
    },
    /// List annotations for a dataset.
    GetAnnotations {
        #[arg(long)]
        set_name: i64,
    },
    /// Export a dataset's annotations as JSON.
    Export {
        #[arg(long)]
        set_name: i64,
    },
    /// Manually edit an annotation's label and/or description.
    UpdateAnnotation {
        #[arg(long)]
        set_name: i64,
        #[arg(long)]
        path: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        desc: Option<String>,
    },
    /// Delete an annotation (keeps the staging request row).
    DeleteAnnotation {
        #[arg(long)]
        set_name: i64,
        #[arg(long)]
        path: String,
    },
    /// Toggle the flagged state of a request row.
    Flag {
        #[arg(long)]
        set_name: i64,
        #[arg(long)]
        path: String,
        #[arg(long)]
        flagged: bool,
    },
    /// Ask the chat tool a question about a dataset.
    Chat {
        #[arg(long)]
        set_name: i64,
        message: String,
        #[arg(long)]
        request_id: Option<i64>,
    },
    /// Report readiness of the vision tool, structured-output LLM, and store.
    Health,
}
