use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};

use llama_pretrain_bench::benchmark::BenchmarkRunner;
use llama_pretrain_bench::config::BenchmarkArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BenchmarkArgs::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("🚀 LLaMA Pretraining Benchmark Starting");
    info!("📋 plugin={} config={} batch_size={} num_steps={}", args.plugin, args.config, args.batch_size, args.num_steps);

    let output = args.output.clone();
    let mut runner = BenchmarkRunner::new(args)?;

    let result = match runner.run().await {
        Ok(result) => result,
        Err(e) => {
            error!("❌ Benchmark failed: {}", e);
            return Err(e);
        }
    };

    if !runner.is_master() {
        return Ok(());
    }

    println!("\n📊 Benchmark Results:");
    println!("{}", result.display_table());

    if let Some(path) = output {
        result.save_to_file(&path)?;
        info!("💾 Results saved to {}", path);
    }

    Ok(())
}
