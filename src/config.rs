use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::path::Path;

/// Command-line configuration of a single benchmark run.
///
/// Flag spellings follow the launcher scripts this harness is usually driven
/// from, hence the snake_case long names.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(author, version, about = "LLaMA pretraining throughput benchmark", long_about = None)]
pub struct BenchmarkArgs {
    /// Model configuration: preset tag (7b, 13b, 70b) or path to a JSON model config
    #[arg(short = 'c', long = "config", default_value = "7b")]
    pub config: String,

    /// Parallelism plugin: gemini, gemini_auto, fsdp, fsdp_cpu, 3d, 3d_cpu
    #[arg(short = 'p', long = "plugin", default_value = "gemini")]
    pub plugin: String,

    /// Per-rank batch size
    #[arg(short = 'b', long = "batch_size", default_value_t = 2)]
    pub batch_size: usize,

    /// Number of steps to run
    #[arg(short = 's', long = "num_steps", default_value_t = 5)]
    pub num_steps: usize,

    /// Number of leading steps excluded from the measurements
    #[arg(short = 'i', long = "ignore_steps", default_value_t = 2)]
    pub ignore_steps: usize,

    /// Use gradient checkpointing
    #[arg(short = 'g', long = "grad_checkpoint")]
    pub grad_checkpoint: bool,

    /// Max sequence length
    #[arg(short = 'l', long = "max_length", default_value_t = 4096)]
    pub max_length: usize,

    /// Warm up ratio of non-model data. Only for gemini_auto
    #[arg(short = 'w', long = "warmup_ratio", default_value_t = 0.8)]
    pub warmup_ratio: f64,

    /// Gemini memory limit in MB
    #[arg(short = 'm', long = "memory_limit")]
    pub memory_limit: Option<usize>,

    /// Use flash attention kernels
    #[arg(short = 'x', long = "xformers")]
    pub xformers: bool,

    /// Shard param fraction. Only for gemini
    #[arg(long = "shard_param_frac", default_value_t = 1.0)]
    pub shard_param_frac: f64,

    /// Offload optim fraction. Only for gemini
    #[arg(long = "offload_optim_frac", default_value_t = 0.0)]
    pub offload_optim_frac: f64,

    /// Offload param fraction. Only for gemini
    #[arg(long = "offload_param_frac", default_value_t = 0.0)]
    pub offload_param_frac: f64,

    /// Tensor parallel size
    #[arg(long = "tp", default_value_t = 1)]
    pub tp: usize,

    /// Extra data parallel size, used for gemini
    #[arg(long = "extra_dp", default_value_t = 1)]
    pub extra_dp: usize,

    /// Pipeline parallel size
    #[arg(long = "pp", default_value_t = 1)]
    pub pp: usize,

    /// Micro batch size of pipeline parallel
    #[arg(long = "mbs", default_value_t = 1)]
    pub mbs: usize,

    /// ZeRO stage when a hybrid plugin is enabled
    #[arg(long = "zero", default_value_t = 0)]
    pub zero: usize,

    /// Use the custom pipeline stage layout (hybrid plugin only)
    #[arg(long = "custom-ckpt", alias = "custom_ckpt")]
    pub custom_ckpt: bool,

    /// Record a Chrome trace of the run
    #[arg(long = "profile")]
    pub profile: bool,

    /// Execution device: cpu, cuda, metal
    #[arg(long = "device", default_value = "cpu")]
    pub device: String,

    /// Seed for the synthetic dataset and shuffling
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,

    /// Write the benchmark result as JSON
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Default for BenchmarkArgs {
    fn default() -> Self {
        Self::parse_from(["benchmark"])
    }
}

impl BenchmarkArgs {
    /// Short model tag used in result names and profiler directories.
    pub fn model_tag(&self) -> String {
        let path = Path::new(&self.config);
        if path.extension().is_some() {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.config.clone())
        } else {
            self.config.replace('/', "_")
        }
    }

    /// Steps whose measurements survive the warmup cut.
    pub fn measured_steps(&self) -> usize {
        self.num_steps.saturating_sub(self.ignore_steps)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("batch_size must be positive"));
        }
        if self.num_steps == 0 {
            return Err(anyhow::anyhow!("num_steps must be positive"));
        }
        if self.ignore_steps >= self.num_steps {
            return Err(anyhow::anyhow!(
                "ignore_steps ({}) must be smaller than num_steps ({}): no step would be measured",
                self.ignore_steps,
                self.num_steps
            ));
        }
        // next-token loss needs at least one (input, target) pair per row
        if self.max_length < 2 {
            return Err(anyhow::anyhow!(
                "max_length must be at least 2, got {}",
                self.max_length
            ));
        }
        for (name, value) in [("tp", self.tp), ("pp", self.pp), ("mbs", self.mbs), ("extra_dp", self.extra_dp)] {
            if value == 0 {
                return Err(anyhow::anyhow!("{} must be at least 1", name));
            }
        }
        Ok(())
    }
}
