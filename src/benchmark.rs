use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::backend::{DeviceManager, DistCoordinator};
use crate::booster::{Booster, BoostedModel, BoostedOptimizer};
use crate::config::BenchmarkArgs;
use crate::data::{DataLoader, RandomDataset};
use crate::metrics::{FlopModel, MemoryMonitor, PerformanceEvaluator, PerformanceSummary, SystemInfo, SystemMetrics};
use crate::models::{format_numel, LlamaConfig, ModelInit};
use crate::plugin::create_plugin;
use crate::profiler::ProfileContext;

pub struct BenchmarkRunner {
    args: BenchmarkArgs,
    coordinator: DistCoordinator,
    device_manager: DeviceManager,
    booster: Booster,
    dataloader: DataLoader,
    model: BoostedModel,
    optimizer: BoostedOptimizer,
    evaluator: PerformanceEvaluator,
    memory_monitor: MemoryMonitor,
    system_metrics: SystemMetrics,
    model_numel: usize,
    booster_init_memory_mb: f64,
}

impl BenchmarkRunner {
    pub fn new(args: BenchmarkArgs) -> Result<Self> {
        let coordinator = DistCoordinator::from_env()?;
        Self::with_coordinator(args, coordinator)
    }

    pub fn with_coordinator(args: BenchmarkArgs, coordinator: DistCoordinator) -> Result<Self> {
        info!("🔧 Initializing Benchmark Runner");

        args.validate()?;
        let world_size = coordinator.world_size();

        let device_manager = DeviceManager::new(&args.device, coordinator.local_rank())?;

        // An unknown plugin must fail before any dataset or model work
        let plugin = create_plugin(&args.plugin, &args, world_size, device_manager.is_cuda())?;
        for (key, value) in plugin.settings() {
            debug!("{} {} = {}", plugin.name(), key, value);
        }
        let dp_size = plugin.dp_size();
        let lazy_init = plugin.lazy_init();
        let dtype = device_manager.training_dtype(plugin.precision());
        let booster = Booster::new(plugin, coordinator.clone());

        let config = LlamaConfig::resolve(&args.config)?.with_positions_for(args.max_length);

        let dataset = RandomDataset::new(
            args.batch_size * args.num_steps * dp_size,
            args.max_length,
            config.vocab_size,
            args.seed,
        )?;
        let dataloader = booster.prepare_dataloader(
            dataset,
            args.batch_size,
            true,
            true,
            args.seed,
            device_manager.primary_device(),
        )?;

        let init = ModelInit::new(config, lazy_init, device_manager.primary_device(), dtype)?;
        let model_config = init.config().clone();
        let model_numel = model_config.num_parameters();
        coordinator.print_on_master(&format!("Model params: {}", format_numel(model_numel)));

        let evaluator = PerformanceEvaluator::new(
            FlopModel {
                model_numel,
                num_layers: model_config.num_hidden_layers,
                hidden_size: model_config.hidden_size,
                vocab_size: model_config.vocab_size,
                grad_checkpoint: args.grad_checkpoint,
            },
            args.ignore_steps,
            dp_size,
            world_size,
        )?;

        let (model, optimizer) = booster.boost(init, &device_manager)?;

        let mut memory_monitor = MemoryMonitor::new()?;
        let booster_init_memory_mb = memory_monitor.sample();
        coordinator.print_on_master(&format!(
            "Booster init max CPU memory: {:.2} MB",
            memory_monitor.peak_memory_mb()
        ));

        let system_metrics = SystemMetrics::new()?;

        Ok(Self {
            args,
            coordinator,
            device_manager,
            booster,
            dataloader,
            model,
            optimizer,
            evaluator,
            memory_monitor,
            system_metrics,
            model_numel,
            booster_init_memory_mb,
        })
    }

    pub fn is_master(&self) -> bool {
        self.coordinator.is_master()
    }

    pub fn num_steps(&self) -> usize {
        self.dataloader.len()
    }

    pub async fn run(&mut self) -> Result<BenchmarkResult> {
        info!(
            "🏋️ Running {} training steps with {}, measuring the last {}",
            self.dataloader.len(),
            self.booster.plugin().name(),
            self.args.measured_steps()
        );

        let total_steps = self.dataloader.len();
        let progress = if self.coordinator.is_master() {
            ProgressBar::new(total_steps as u64)
        } else {
            ProgressBar::hidden()
        };
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        let save_dir = ProfileContext::default_save_dir(self.booster.plugin().name(), &self.args.model_tag());
        let mut prof = ProfileContext::new(
            self.args.profile,
            1,
            total_steps.saturating_sub(1),
            save_dir,
            self.coordinator.rank(),
        );

        let device = self.device_manager.primary_device().clone();
        let mut last_loss = None;

        if self.booster.plugin().pipeline().is_some() {
            let mut data_iter = self.dataloader.iter();
            for step in 0..total_steps {
                self.evaluator.on_step_start(step);
                let loss = prof.phase("pipeline", || {
                    self.booster.execute_pipeline(&mut data_iter, &self.model, &mut self.optimizer)
                })?;
                prof.phase("optimizer", || {
                    self.optimizer.step()?;
                    self.optimizer.zero_grad();
                    Ok(())
                })?;
                device.synchronize()?;
                self.evaluator.on_step_end(self.args.batch_size, self.args.max_length)?;

                self.memory_monitor.sample();
                last_loss = Some(loss);
                progress.set_message(format!("loss {:.4}", loss));
                progress.inc(1);
                prof.step();
            }
        } else {
            for (step, batch) in self.dataloader.iter().enumerate() {
                let batch = batch?;
                self.evaluator.on_step_start(step);
                let loss = prof.phase("forward", || self.model.forward_loss(&batch))?;
                prof.phase("backward", || self.booster.backward(&loss, &mut self.optimizer))?;
                prof.phase("optimizer", || {
                    self.optimizer.step()?;
                    self.optimizer.zero_grad();
                    Ok(())
                })?;
                device.synchronize()?;
                self.evaluator.on_step_end(batch.batch_size(), batch.seq_len())?;

                self.memory_monitor.sample();
                let loss = loss.to_scalar::<f32>()?;
                last_loss = Some(loss);
                progress.set_message(format!("loss {:.4}", loss));
                progress.inc(1);
                prof.step();
            }
        }
        progress.finish_with_message("Training benchmark complete");

        let trace_path = prof.finish()?;
        let summary = self.evaluator.on_fit_end()?;
        for line in summary.report_lines() {
            self.coordinator.print_on_master(&line);
        }
        let peak_memory_mb = self.memory_monitor.peak_memory_mb();
        self.coordinator.print_on_master(&format!("Max CPU memory usage: {:.2} MB", peak_memory_mb));

        BenchmarkResult::new(self, summary, last_loss, peak_memory_mb, trace_path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResult {
    pub timestamp: DateTime<Utc>,
    pub config_hash: String,
    pub config_name: String,
    pub plugin: String,
    pub plugin_settings: Vec<(String, String)>,
    pub device: String,
    pub model_numel: usize,
    pub world_size: usize,
    pub stages: usize,
    pub summary: PerformanceSummary,
    pub final_loss: Option<f32>,
    pub booster_init_memory_mb: f64,
    pub peak_memory_mb: f64,
    pub trace_path: Option<PathBuf>,
    pub system_info: SystemInfo,
}

impl BenchmarkResult {
    fn new(
        runner: &BenchmarkRunner,
        summary: PerformanceSummary,
        final_loss: Option<f32>,
        peak_memory_mb: f64,
        trace_path: Option<PathBuf>,
    ) -> Result<Self> {
        let plugin = runner.booster.plugin();
        Ok(Self {
            timestamp: Utc::now(),
            config_hash: format!("{:x}", md5::compute(serde_json::to_string(&runner.args)?)),
            config_name: format!("{}-llama-{}", plugin.name(), runner.args.model_tag()),
            plugin: plugin.name().to_string(),
            plugin_settings: plugin
                .settings()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
            device: runner.device_manager.backend_type().as_str().to_string(),
            model_numel: runner.model_numel,
            world_size: runner.coordinator.world_size(),
            stages: runner.model.stages().len(),
            summary,
            final_loss,
            booster_init_memory_mb: runner.booster_init_memory_mb,
            peak_memory_mb,
            trace_path,
            system_info: runner.system_metrics.get_system_info(),
        })
    }

    pub fn display_table(&self) -> String {
        use tabled::{Table, Tabled};

        #[derive(Tabled)]
        struct ResultRow {
            metric: String,
            value: String,
        }

        let row = |metric: &str, value: String| ResultRow { metric: metric.to_string(), value };
        let mut rows = vec![
            row("Configuration", self.config_name.clone()),
            row("Plugin", self.plugin.clone()),
            row("Hardware", self.device.clone()),
            row("Model params", format_numel(self.model_numel)),
            row("World size", format!("{} (dp {})", self.world_size, self.summary.dp_world_size)),
            row(
                "Measured steps",
                format!("{} (from step {})", self.summary.retained_steps, self.summary.first_measured_step),
            ),
            row("Throughput (samples/s)", format!("{:.2}", self.summary.samples_per_second)),
            row("Throughput (tokens/s)", format!("{:.1}", self.summary.tokens_per_second)),
            row("Step Time (ms)", format!("{:.2} ± {:.2}", self.summary.mean_step_time_ms, self.summary.step_time_ms.std_dev)),
            row("TFLOPS per device", format!("{:.3}", self.summary.tflops_per_device)),
            row("TFLOPS per device (Megatron)", format!("{:.3}", self.summary.tflops_per_device_megatron)),
            row("Peak CPU Memory (MB)", format!("{:.1}", self.peak_memory_mb)),
        ];
        if let Some(loss) = self.final_loss {
            rows.push(row("Final loss", format!("{:.4}", loss)));
        }
        if let Some(path) = &self.trace_path {
            rows.push(row("Trace", path.display().to_string()));
        }

        Table::new(rows).to_string()
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let json_result = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json_result)?;
        Ok(())
    }
}
