use anyhow::Result;
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use callguard::core::audio::{self, CpalAudioSource};
use callguard::core::config::Config;
use callguard::core::database::{CallRecord, Database, SpamSideRecord};
use callguard::core::features::detected_categories;
use callguard::core::model::load_model;
use callguard::core::pipeline::{CallPipeline, CallResult, CallSource, PipelineSettings};
use callguard::core::preprocess::WavPreprocessor;
use callguard::core::quarantine::FileQuarantine;
use callguard::core::scoring::SpamScorer;
use callguard::core::transcription::Transcriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Screen an existing audio file
    #[arg(short, long)]
    process: Option<PathBuf>,

    /// Record a call from the microphone for N seconds and screen it
    #[arg(short, long)]
    record: Option<u64>,

    /// Show the N most recent calls
    #[arg(long)]
    recent: Option<u32>,

    /// Only include spam calls in --recent and --export
    #[arg(long)]
    spam_only: bool,

    /// Show a single stored call
    #[arg(long)]
    call: Option<i64>,

    /// Show call statistics
    #[arg(short, long)]
    stats: bool,

    /// Export stored calls to a CSV file (JSON with --json)
    #[arg(long)]
    export: Option<PathBuf>,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    write_config: bool,

    /// List available audio devices
    #[arg(short, long)]
    list_devices: bool,

    /// Use specific audio device by name
    #[arg(short, long)]
    device: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; the config file may still change the level
    let env_filter = EnvFilter::try_from_default_env();
    let rust_log_set = env_filter.is_ok();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|_| EnvFilter::new("callguard=info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if !rust_log_set {
        filter_handle.modify(|filter| *filter = EnvFilter::new(config.log_directive()))?;
    }

    info!("CallGuard starting...");

    if args.list_devices {
        audio::list_audio_devices()?;
        return Ok(());
    }

    if args.device.is_some() {
        config.audio.device = args.device.clone();
    }

    if args.write_config {
        let path = match args.config.clone().or_else(Config::default_path) {
            Some(path) => path,
            None => anyhow::bail!("No config directory available, pass --config"),
        };
        config.save(&path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    let source = match (&args.process, args.record) {
        (Some(path), _) => Some(CallSource::File(path.clone())),
        (None, Some(seconds)) => Some(CallSource::Record { seconds }),
        (None, None) => None,
    };

    let wants_store = source.is_some()
        || args.recent.is_some()
        || args.call.is_some()
        || args.stats
        || args.export.is_some();
    if !wants_store {
        warn!("No command specified. Use --help for options.");
        Args::command().print_help()?;
        return Ok(());
    }

    let db = Database::open(&config.storage.database_path).await?;

    if let Some(source) = source {
        let pipeline = build_pipeline(&config, db.clone())?;
        let result = pipeline.process_call(source).await;
        print_result(&result, args.json)?;
        if !result.is_success() {
            db.close().await;
            std::process::exit(1);
        }
    }

    if let Some(call_id) = args.call {
        match db.get_call(call_id).await? {
            Some(record) if args.json => println!("{}", serde_json::to_string_pretty(&record)?),
            Some(record) => {
                print_record(&record);
                if let Some(spam) = db.get_spam_record(call_id).await? {
                    print_spam_record(&spam);
                }
            }
            None => println!("No call with id {}", call_id),
        }
    }

    if let Some(limit) = args.recent {
        let records = db.list_calls(limit, args.spam_only).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else if records.is_empty() {
            println!("No calls recorded yet");
        } else {
            println!("\n=== Recent Calls ===");
            for record in &records {
                println!(
                    "#{:<5} {}  {:<12} {:>6.2}%  {}",
                    record.call_id,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.status.as_str(),
                    record.spam_score.confidence * 100.0,
                    preview(&record.transcript.text, 60)
                );
            }
            println!("====================\n");
        }
    }

    if args.stats {
        let stats = db.statistics().await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("\n=== Call Statistics ===");
            println!("Total calls:       {}", stats.total_calls);
            println!("Spam calls:        {}", stats.spam_calls);
            println!("Legitimate calls:  {}", stats.legitimate_calls);
            println!("Spam rate:         {:.1}%", stats.spam_rate);
            println!("Avg spam score:    {:.2}", stats.average_spam_confidence);
            println!("=======================\n");
        }
    }

    if let Some(path) = &args.export {
        let count = if args.json {
            db.export_json(path, args.spam_only).await?
        } else {
            db.export_csv(path, args.spam_only).await?
        };
        println!("Exported {} calls to {}", count, path.display());
    }

    db.close().await;
    Ok(())
}

fn build_pipeline(config: &Config, db: Arc<Database>) -> Result<CallPipeline> {
    config.ensure_directories()?;
    let storage = &config.storage;

    let model = load_model(&config.spam);

    Ok(CallPipeline::new(
        Arc::new(CpalAudioSource::new(&config.audio, &storage.audio_directory)),
        Arc::new(WavPreprocessor::new(config.audio.noise_reduction)),
        Arc::new(Transcriber::new(&config.whisper, &storage.transcripts_directory)?),
        Arc::new(SpamScorer::new(model, &config.spam)),
        db,
        Arc::new(FileQuarantine::new(&storage.quarantine_directory)),
        PipelineSettings::from_config(config),
    ))
}

fn print_result(result: &CallResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    match result {
        CallResult::Processed(call) => {
            println!("\n=== Call {} ===", call.call_id);
            println!("{}", call.transcript);
            println!("====================");
            println!(
                "Status: {}{}",
                call.status.as_str(),
                if call.scored { "" } else { " (unscored)" }
            );
            println!("Confidence: {:.2}%", call.confidence * 100.0);
            let indicators = detected_categories(&call.features);
            if !indicators.is_empty() {
                println!("Indicators: {}", indicators.join(", "));
            }
            println!("Audio: {}", call.audio_path.display());
            println!("Processing time: {:.2}s\n", call.processing_time);
        }
        CallResult::Failed(failed) => {
            println!("\nCall failed ({}): {}\n", failed.kind, failed.error);
        }
    }
    Ok(())
}

fn print_record(record: &CallRecord) {
    println!("\n=== Call {} ===", record.call_id);
    println!("Received: {}", record.created_at.to_rfc3339());
    println!("Status: {}", record.status.as_str());
    println!("Confidence: {:.2}%", record.spam_score.confidence * 100.0);
    println!("Language: {}", record.transcript.language);
    println!("Audio: {}", record.audio_path);
    println!("\n{}", record.transcript.text);
    println!("====================\n");
}

fn print_spam_record(spam: &SpamSideRecord) {
    println!("Blocked at: {}", spam.blocked_at.to_rfc3339());
    let indicators = detected_categories(&spam.spam_features);
    if !indicators.is_empty() {
        println!("Indicators: {}", indicators.join(", "));
    }
    println!();
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut preview: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        preview.push_str("...");
    }
    preview
}
