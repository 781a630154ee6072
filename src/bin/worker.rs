use clap::Parser;
use std::sync::Arc;
use taskqueue::{EngineConfig, Engine, Request, SubscribeOptions};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Queue names to consume from; repeatable
    #[arg(short, long, required = true)]
    queue: Vec<String>,

    /// Workers dispatched concurrently per queue
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = EngineConfig::load_from_path(args.config.as_deref())?;
    config.observability.init_logging();

    let engine = Engine::new(config.broker_kind(), config.task_defaults()).await?;

    for name in &args.queue {
        let queue = engine.queue(name);
        queue.subscribe(
            taskqueue::FnHandler(|req: Request| async move {
                info!(task_id = %req.task.id, queue = %req.task.name, "handling task");
                Ok(req.task.payload)
            }),
            SubscribeOptions {
                concurrency: args.concurrency,
            },
        );
        info!(queue = %name, concurrency = args.concurrency, "registered queue");
    }

    let shutdown = CancellationToken::new();
    let engine = Arc::new(engine);

    let run_shutdown = shutdown.clone();
    let run_engine = Arc::clone(&engine);
    let run_handle = tokio::spawn(async move { run_engine.run(run_shutdown).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    run_handle.await??;
    Ok(())
}
