use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Statistics {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl Statistics {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let sum: f64 = values.iter().sum();
        let mean = sum / values.len() as f64;

        let variance: f64 = values.iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>() / values.len() as f64;
        let std_dev = variance.sqrt();

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let median = if sorted.len() % 2 == 0 {
            (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
        } else {
            sorted[sorted.len() / 2]
        };

        Self {
            mean,
            std_dev,
            median,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        }
    }
}

/// Wall-clock interval timer.
#[derive(Debug, Default)]
pub struct Timer {
    start_time: Option<Instant>,
}

impl Timer {
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Stops the running interval and returns its length, `None` if the
    /// timer was not started.
    pub fn end(&mut self) -> Option<Duration> {
        Some(self.start_time.take()?.elapsed())
    }
}

/// One retained step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMeasurement {
    pub step: usize,
    pub elapsed: Duration,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl StepMeasurement {
    pub fn tokens(&self) -> usize {
        self.batch_size * self.seq_len
    }
}

/// Model shape the FLOP estimates are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlopModel {
    pub model_numel: usize,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub vocab_size: usize,
    pub grad_checkpoint: bool,
}

impl FlopModel {
    fn activation_factor(&self) -> f64 {
        // forward + 2x backward, plus one recompute with checkpointing
        3.0 + if self.grad_checkpoint { 1.0 } else { 0.0 }
    }

    /// `2 * numel` FLOPs per token per pass.
    pub fn step_flop(&self, batch_size: usize, seq_len: usize) -> f64 {
        batch_size as f64 * seq_len as f64 * self.model_numel as f64 * 2.0 * self.activation_factor()
    }

    /// Transformer FLOP estimate from the Megatron-LM paper.
    pub fn step_flop_megatron(&self, batch_size: usize, seq_len: usize) -> f64 {
        let hidden = self.hidden_size as f64;
        let layers = self.num_layers as f64;
        let seq = seq_len as f64;
        24.0 * self.activation_factor() * batch_size as f64 * seq * layers * hidden * hidden
            * (1.0 + seq / (6.0 * hidden) + self.vocab_size as f64 / (16.0 * layers * hidden))
    }
}

/// Warmup-excluded step timing accumulator.
///
/// Steps with index below `ignore_steps` are dropped; every later step is
/// appended as a [`StepMeasurement`] and contributes to the throughput
/// figures reported by [`PerformanceEvaluator::on_fit_end`].
pub struct PerformanceEvaluator {
    flop_model: FlopModel,
    ignore_steps: usize,
    dp_world_size: usize,
    world_size: usize,
    disabled: bool,
    current_step: Option<usize>,
    timer: Timer,
    measurements: Vec<StepMeasurement>,
    num_samples: usize,
    flop: f64,
    flop_megatron: f64,
}

impl PerformanceEvaluator {
    pub fn new(flop_model: FlopModel, ignore_steps: usize, dp_world_size: usize, world_size: usize) -> Result<Self> {
        if dp_world_size == 0 || world_size == 0 || world_size % dp_world_size != 0 {
            return Err(anyhow::anyhow!(
                "Data parallel size {} must divide world size {}",
                dp_world_size,
                world_size
            ));
        }
        Ok(Self {
            flop_model,
            ignore_steps,
            dp_world_size,
            world_size,
            disabled: false,
            current_step: None,
            timer: Timer::default(),
            measurements: Vec::new(),
            num_samples: 0,
            flop: 0.0,
            flop_megatron: 0.0,
        })
    }

    pub fn on_step_start(&mut self, step: usize) {
        self.disabled = step < self.ignore_steps;
        self.current_step = Some(step);
        if self.disabled {
            debug!("Step {} is a warmup step, not timed", step);
            return;
        }
        self.timer.start();
    }

    pub fn on_step_end(&mut self, batch_size: usize, seq_len: usize) -> Result<()> {
        let step = self.current_step.take().ok_or_else(|| {
            anyhow::anyhow!("on_step_end called without a matching on_step_start")
        })?;
        if self.disabled {
            return Ok(());
        }
        let elapsed = self.timer.end().ok_or_else(|| anyhow::anyhow!("Step {} timer was not running", step))?;
        self.push(StepMeasurement { step, elapsed, batch_size, seq_len });
        Ok(())
    }

    /// Records a step timed elsewhere. Returns whether it was retained.
    pub fn record_step(&mut self, step: usize, elapsed: Duration, batch_size: usize, seq_len: usize) -> bool {
        if step < self.ignore_steps {
            return false;
        }
        self.push(StepMeasurement { step, elapsed, batch_size, seq_len });
        true
    }

    fn push(&mut self, measurement: StepMeasurement) {
        self.num_samples += measurement.batch_size;
        self.flop += self.flop_model.step_flop(measurement.batch_size, measurement.seq_len);
        self.flop_megatron += self.flop_model.step_flop_megatron(measurement.batch_size, measurement.seq_len);
        debug!("Step {} took {:.2} ms", measurement.step, measurement.elapsed.as_secs_f64() * 1000.0);
        self.measurements.push(measurement);
    }

    pub fn measurements(&self) -> &[StepMeasurement] {
        &self.measurements
    }

    pub fn on_fit_end(&self) -> Result<PerformanceSummary> {
        if self.measurements.is_empty() {
            return Err(anyhow::anyhow!(
                "No step was measured: all steps fell inside the {} ignored warmup steps",
                self.ignore_steps
            ));
        }

        let total: Duration = self.measurements.iter().map(|m| m.elapsed).sum();
        // guards the division for sub-resolution timings
        let avg_duration = total.as_secs_f64() + 1e-12;
        let retained_steps = self.measurements.len();
        let tokens: usize = self.measurements.iter().map(StepMeasurement::tokens).sum();
        let mp_world_size = (self.world_size / self.dp_world_size).max(1) as f64;

        let step_times_ms: Vec<f64> = self.measurements
            .iter()
            .map(|m| m.elapsed.as_secs_f64() * 1000.0)
            .collect();

        Ok(PerformanceSummary {
            retained_steps,
            first_measured_step: self.measurements[0].step,
            num_samples: self.num_samples,
            num_tokens: tokens,
            dp_world_size: self.dp_world_size,
            avg_duration_s: avg_duration,
            mean_step_time_ms: avg_duration * 1000.0 / retained_steps as f64,
            step_time_ms: Statistics::from_values(&step_times_ms),
            samples_per_second: self.num_samples as f64 * self.dp_world_size as f64 / avg_duration,
            tokens_per_second: tokens as f64 * self.dp_world_size as f64 / avg_duration,
            flop: self.flop,
            flop_megatron: self.flop_megatron,
            tflops_per_device: self.flop / 1e12 / avg_duration / mp_world_size,
            tflops_per_device_megatron: self.flop_megatron / 1e12 / avg_duration / mp_world_size,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub retained_steps: usize,
    pub first_measured_step: usize,
    pub num_samples: usize,
    pub num_tokens: usize,
    pub dp_world_size: usize,
    pub avg_duration_s: f64,
    pub mean_step_time_ms: f64,
    pub step_time_ms: Statistics,
    pub samples_per_second: f64,
    pub tokens_per_second: f64,
    pub flop: f64,
    pub flop_megatron: f64,
    pub tflops_per_device: f64,
    pub tflops_per_device_megatron: f64,
}

impl PerformanceSummary {
    pub fn report_lines(&self) -> Vec<String> {
        vec![
            format!(
                "num_samples: {}, dp_world_size: {}, flop_megatron: {:.3e}, flop: {:.3e}, avg_duration: {:.4}s",
                self.num_samples, self.dp_world_size, self.flop_megatron, self.flop, self.avg_duration_s
            ),
            format!(
                "Throughput: {:.2} samples/sec, {:.1} tokens/sec, TFLOPS per GPU by Megatron: {:.2}, TFLOPS per GPU: {:.2}",
                self.samples_per_second,
                self.tokens_per_second,
                self.tflops_per_device_megatron,
                self.tflops_per_device
            ),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemInfo {
    pub os: String,
    pub cpu_brand: String,
    pub cpu_cores: usize,
    pub total_memory_gb: f64,
    pub hostname: String,
    pub rust_version: String,
    pub bench_version: String,
}

// System metrics collection
pub struct SystemMetrics {
    system: System,
}

impl SystemMetrics {
    pub fn new() -> Result<Self> {
        let mut system = System::new_all();
        system.refresh_all();
        Ok(Self { system })
    }

    pub fn get_system_info(&self) -> SystemInfo {
        SystemInfo {
            os: format!("{} {}",
                       System::name().unwrap_or_else(|| "Unknown".to_string()),
                       System::os_version().unwrap_or_else(|| "Unknown".to_string())),
            cpu_brand: self.system.cpus().first()
                .map(|cpu| cpu.brand().to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
            cpu_cores: self.system.cpus().len(),
            total_memory_gb: self.system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
            rust_version: rustc_version_runtime::version().to_string(),
            bench_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Tracks this process's resident memory and its peak across samples.
pub struct MemoryMonitor {
    system: System,
    process_id: Pid,
    peak_memory_mb: f64,
}

impl MemoryMonitor {
    pub fn new() -> Result<Self> {
        let process_id = sysinfo::get_current_pid()
            .map_err(|e| anyhow::anyhow!("Cannot determine current pid: {}", e))?;
        let mut monitor = Self {
            system: System::new(),
            process_id,
            peak_memory_mb: 0.0,
        };
        monitor.sample();
        Ok(monitor)
    }

    /// Current resident memory in MB; updates the peak.
    pub fn sample(&mut self) -> f64 {
        self.system.refresh_processes(ProcessesToUpdate::Some(&[self.process_id]), true);
        let memory_mb = self.system
            .process(self.process_id)
            .map(|process| process.memory() as f64 / 1024.0 / 1024.0)
            .unwrap_or(0.0);
        self.peak_memory_mb = self.peak_memory_mb.max(memory_mb);
        memory_mb
    }

    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flop_model() -> FlopModel {
        FlopModel {
            model_numel: 1_000,
            num_layers: 2,
            hidden_size: 8,
            vocab_size: 16,
            grad_checkpoint: false,
        }
    }

    #[test]
    fn warmup_steps_are_discarded() {
        let mut evaluator = PerformanceEvaluator::new(flop_model(), 2, 1, 1).unwrap();
        for step in 0..5 {
            let retained = evaluator.record_step(step, Duration::from_millis(100), 2, 16);
            assert_eq!(retained, step >= 2);
        }
        let steps: Vec<usize> = evaluator.measurements().iter().map(|m| m.step).collect();
        assert_eq!(steps, vec![2, 3, 4]);

        let summary = evaluator.on_fit_end().unwrap();
        assert_eq!(summary.retained_steps, 3);
        assert_eq!(summary.first_measured_step, 2);
        assert_eq!(summary.num_samples, 6);
        assert!((summary.mean_step_time_ms - 100.0).abs() < 1e-6);
    }

    #[test]
    fn throughput_scales_with_data_parallel_replicas() {
        let mut evaluator = PerformanceEvaluator::new(flop_model(), 0, 4, 8).unwrap();
        for step in 0..3 {
            evaluator.record_step(step, Duration::from_millis(500), 2, 10);
        }
        let summary = evaluator.on_fit_end().unwrap();
        // 3 steps x 2 x 10 tokens over 1.5 s, times 4 replicas
        assert!((summary.tokens_per_second - 160.0).abs() < 1e-6);
        assert!((summary.samples_per_second - 16.0).abs() < 1e-6);
        assert!(summary.tokens_per_second.is_finite() && summary.tokens_per_second > 0.0);
    }

    #[test]
    fn tflops_split_over_model_parallel_group() {
        let mut evaluator = PerformanceEvaluator::new(flop_model(), 0, 2, 8).unwrap();
        evaluator.record_step(0, Duration::from_secs(1), 1, 1);
        let summary = evaluator.on_fit_end().unwrap();
        // 1 token x 1000 params x 2 x 3 passes
        assert_eq!(summary.flop, 6_000.0);
        assert!((summary.tflops_per_device - 6_000.0 / 1e12 / 4.0).abs() < 1e-15);
    }

    #[test]
    fn gradient_checkpointing_adds_a_recompute_pass() {
        let plain = flop_model();
        let ckpt = FlopModel { grad_checkpoint: true, ..plain };
        assert_eq!(ckpt.step_flop(2, 4) / plain.step_flop(2, 4), 4.0 / 3.0);
        assert!(ckpt.step_flop_megatron(2, 4) > plain.step_flop_megatron(2, 4));
    }

    #[test]
    fn megatron_estimate_matches_formula() {
        let model = flop_model();
        let expected = 24.0 * 3.0 * 2.0 * 4.0 * 2.0 * 64.0 * (1.0 + 4.0 / 48.0 + 16.0 / 256.0);
        assert!((model.step_flop_megatron(2, 4) - expected).abs() < 1e-9);
    }

    #[test]
    fn fit_end_errors_without_measured_steps() {
        let mut evaluator = PerformanceEvaluator::new(flop_model(), 3, 1, 1).unwrap();
        for step in 0..3 {
            assert!(!evaluator.record_step(step, Duration::from_millis(10), 1, 4));
        }
        assert!(evaluator.on_fit_end().is_err());
    }

    #[test]
    fn timed_steps_go_through_the_timer() {
        let mut evaluator = PerformanceEvaluator::new(flop_model(), 1, 1, 1).unwrap();
        for step in 0..3 {
            evaluator.on_step_start(step);
            std::thread::sleep(Duration::from_millis(2));
            evaluator.on_step_end(1, 8).unwrap();
        }
        assert_eq!(evaluator.measurements().len(), 2);
        let summary = evaluator.on_fit_end().unwrap();
        assert!(summary.step_time_ms.min >= 2.0);
        assert!(summary.tokens_per_second.is_finite() && summary.tokens_per_second > 0.0);
    }

    #[test]
    fn step_end_requires_step_start() {
        let mut evaluator = PerformanceEvaluator::new(flop_model(), 0, 1, 1).unwrap();
        assert!(evaluator.on_step_end(1, 8).is_err());
    }

    #[test]
    fn rejects_data_parallel_size_not_dividing_world() {
        assert!(PerformanceEvaluator::new(flop_model(), 0, 3, 4).is_err());
    }

    #[test]
    fn statistics_over_step_times() {
        let stats = Statistics::from_values(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(Statistics::from_values(&[]), Statistics::default());
    }

    #[test]
    fn timer_measures_one_interval_per_start() {
        let mut timer = Timer::default();
        assert!(timer.end().is_none());
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.end().unwrap() >= Duration::from_millis(1));
        assert!(timer.end().is_none());
    }

    #[test]
    fn memory_monitor_tracks_peak() {
        let mut monitor = MemoryMonitor::new().unwrap();
        let current = monitor.sample();
        assert!(monitor.peak_memory_mb() >= current);
    }
}
