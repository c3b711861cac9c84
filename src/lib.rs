//! Radiotag core library.
//!
//! Components are constructed once at process start and bundled into a
//! `Context`; nothing here is a module-level singleton.

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

use config::{Config, VisionMode};
use core::chat::ChatTool;
use core::enhancer::{Enhancer, LlmEnhancer, NoopEnhancer};
use core::pipeline::Pipeline;
use core::repository::Repository;
use core::summary::SummaryGenerator;
use core::validator::Validator;
use core::vision::{LocalVisionTool, MockVisionTool, RemoteVisionTool, VisionTool};

pub struct Context {
    pub repository: Arc<Repository>,
    pub pipeline: Arc<Pipeline>,
    pub chat_tool: Arc<ChatTool>,
    pub vision: Arc<dyn VisionTool>,
    pub llm_available: bool,
}

impl Context {
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let connect_options =
            SqliteConnectOptions::from_str(&config.database.path)?.foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let repository = Arc::new(Repository::new(pool));

        let vision: Arc<dyn VisionTool> = match config.vision.mode {
            VisionMode::Local => Arc::new(LocalVisionTool::new(config.vision.clone())),
            VisionMode::Remote => Arc::new(RemoteVisionTool::new(config.vision.clone())),
            VisionMode::Mock => Arc::new(MockVisionTool::default()),
        };

        let llm_concurrency = config.concurrency.llm_concurrency;
        let validator = Arc::new(Validator::new(config.llm.clone(), llm_concurrency));
        let enhancer: Arc<dyn Enhancer> = if config.llm.api_key.is_some() {
            Arc::new(LlmEnhancer::new(config.llm.clone(), llm_concurrency))
        } else {
            Arc::new(NoopEnhancer)
        };
        let summary_generator = Arc::new(SummaryGenerator::new(config.llm.clone(), llm_concurrency));

        let pipeline = Arc::new(Pipeline::new(
            vision.clone(),
            validator,
            enhancer,
            summary_generator,
            config.concurrency.vision_worker_pool_size,
            config.validation.max_attempts,
        ));

        let chat_tool = Arc::new(ChatTool::new(
            config.llm.clone(),
            repository.clone(),
            pipeline.clone(),
            llm_concurrency,
        ));

        let llm_available = config.llm.api_key.is_some();

        Ok(Self { repository, pipeline, chat_tool, vision, llm_available })
    }
}
