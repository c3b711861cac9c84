use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use radiotag::cli::Command;
use radiotag::config::{CommandLineArgs, Config};
use radiotag::core::vision::ImageInput;
use radiotag::Context;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let args = CommandLineArgs::parse();
    let config = Config::load(&args)?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("radiotag.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        run(args, config).await
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        run(args, config).await
    }
}

async fn run(args: CommandLineArgs, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("radiotag starting up");

    let context = radiotag::Context::build(&config).await?;
    tracing::info!("pipeline context built");

    let Some(command) = args.command else {
        eprintln!("no subcommand given; run with --help to see available commands");
        return Ok(());
    };

    dispatch(&context, command).await
}

async fn dispatch(context: &Context, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::LoadDataset { set_name, paths } => {
            let mut loaded = 0;
            let mut skipped = 0;
            for path in &paths {
                if path.is_empty() {
                    skipped += 1;
                    continue;
                }
                let empty_image = ImageInput::new(Vec::new(), "application/octet-stream");
                let outcome = context.pipeline.annotate(&empty_image, set_name, path, None, None, false).await;
                match context.repository.save_request(&outcome.request_payload).await {
                    Ok(_) => loaded += 1,
                    Err(e) => {
                        tracing::error!(error = %e, path, "failed to load path into dataset");
                        skipped += 1;
                    },
                }
            }
            println!("{{\"loaded\": {loaded}, \"skipped\": {skipped}}}");
        },
        Command::AnalyzeDataset { set_name, prompt, force, enable_enhancement } => {
            let rows = if force {
                context.repository.get_all_requests(set_name).await?
            } else {
                context.repository.get_unprocessed(set_name).await?
            };

            let mut processed = 0;
            let mut errors = Vec::new();
            for row in rows {
                let empty_image = ImageInput::new(Vec::new(), "application/octet-stream");
                let outcome = context
                    .pipeline
                    .annotate(&empty_image, set_name, &row.path_url, prompt.as_deref(), None, enable_enhancement)
                    .await;
                match context.repository.save_request(&outcome.request_payload).await {
                    Ok(request_id) => {
                        match context
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
            println!(
                "{{\"processed\": {processed}, \"errors\": [{}]}}",
                errors.iter().map(|e| format!("{e:?}")).collect::<Vec<_>>().join(", ")
            );
        },
        Command::GetAnnotations { set_name } => {
            let annotations = context.repository.get_annotations(set_name).await?;
            let rows: Vec<String> = annotations
                .iter()
                .map(|a| {
                    format!(
                        "{{\"path\": {:?}, \"label\": {:?}, \"patient_id\": {}, \"desc\": {:?}}}",
                        a.path_url, a.label, a.patient_id, a.desc
                    )
                })
                .collect();
            println!("[{}]", rows.join(", "));
        },
        Command::Export { set_name } => {
            let annotations = context.repository.get_annotations(set_name).await?;
            let rows: Vec<String> = annotations
                .iter()
                .map(|a| {
                    format!(
                        "{{\"path\": {:?}, \"label\": {:?}, \"patient_id\": {}, \"description\": {:?}}}",
                        a.path_url, a.label, a.patient_id, a.desc
                    )
                })
                .collect();
            println!(
                "{{\"dataset_name\": \"{set_name}\", \"total_annotations\": {}, \"annotations\": [{}]}}",
                annotations.len(),
                rows.join(", ")
            );
        },
        Command::UpdateAnnotation { set_name, path, label, desc } => {
            let updated = context
                .repository
                .update_annotation(set_name, &path, label.as_deref(), desc.as_deref())
                .await?;
            println!("updated: {} -> {}", updated.path_url, updated.label);
        },
        Command::DeleteAnnotation { set_name, path } => {
            context.repository.delete_annotation(set_name, &path).await?;
            println!("deleted");
        },
        Command::Flag { set_name, path, flagged } => {
            let result = context.repository.flag(set_name, &path, flagged).await?;
            println!("{{\"flagged\": {result}}}");
        },
        Command::Chat { set_name, message, request_id } => {
            let reply = context.chat_tool.chat(&message, set_name, request_id).await?;
            println!("{reply}");
        },
        Command::Health => {
            println!(
                "{{\"vision\": true, \"structured\": {}, \"store\": true}}",
                context.llm_available
            );
        },
    }
    Ok(())
}
