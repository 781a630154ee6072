use clap::Parser;
use taskqueue::{Engine, EngineConfig, PublishOptions};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Queue to publish to
    #[arg(short, long)]
    queue: String,

    /// Payload, published as a JSON string
    #[arg(short, long)]
    payload: String,

    /// Delay before the task becomes eligible, in seconds
    #[arg(long)]
    countdown: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load_from_path(args.config.as_deref())?;
    config.observability.init_logging();

    let engine = Engine::new(config.broker_kind(), config.task_defaults()).await?;

    let mut options = PublishOptions::new();
    if let Some(secs) = args.countdown {
        options = options.with_countdown(std::time::Duration::from_secs(secs));
    }

    let task = engine.publish(&args.queue, &args.payload, options).await?;
    info!(task_id = %task.id, queue = %args.queue, "task published");

    Ok(())
}
