use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// One complete ("X") event in the Chrome trace format.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub cat: &'static str,
    pub ph: &'static str,
    /// Start, microseconds since the profiler was created.
    pub ts: f64,
    /// Duration in microseconds.
    pub dur: f64,
    pub pid: usize,
    pub tid: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceFile<'a> {
    trace_events: &'a [TraceEvent],
    display_time_unit: &'static str,
}

/// Step-scheduled profiler.
///
/// The first `warmup_steps` steps run untraced, the next `active_steps` are
/// recorded, later steps are ignored. A disabled context is a no-op.
pub struct ProfileContext {
    enabled: bool,
    warmup_steps: usize,
    active_steps: usize,
    save_dir: PathBuf,
    rank: usize,
    origin: Instant,
    step_start: Instant,
    step: usize,
    events: Vec<TraceEvent>,
}

impl ProfileContext {
    pub fn new(enabled: bool, warmup_steps: usize, active_steps: usize, save_dir: impl Into<PathBuf>, rank: usize) -> Self {
        let now = Instant::now();
        let save_dir = save_dir.into();
        if enabled {
            info!(
                "🔬 Profiling {} steps after {} warmup step(s), trace goes to {}",
                active_steps,
                warmup_steps,
                save_dir.display()
            );
        }
        Self {
            enabled,
            warmup_steps,
            active_steps,
            save_dir,
            rank,
            origin: now,
            step_start: now,
            step: 0,
            events: Vec::new(),
        }
    }

    /// `profile/<HH:MM>-<plugin>-llama-<model>`
    pub fn default_save_dir(plugin: &str, model_tag: &str) -> PathBuf {
        PathBuf::from("profile").join(format!("{}-{}-llama-{}", Local::now().format("%H:%M"), plugin, model_tag))
    }

    pub fn is_recording(&self) -> bool {
        self.enabled && self.step >= self.warmup_steps && self.step < self.warmup_steps + self.active_steps
    }

    /// Runs `f`, tracing it as a phase of the current step when recording.
    pub fn phase<T>(&mut self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.is_recording() {
            return f();
        }
        let start = Instant::now();
        let out = f()?;
        self.push(name.to_string(), "phase", start);
        Ok(out)
    }

    /// Marks the end of a training step.
    pub fn step(&mut self) {
        if self.is_recording() {
            self.push(format!("step {}", self.step), "step", self.step_start);
        }
        self.step += 1;
        self.step_start = Instant::now();
    }

    fn push(&mut self, name: String, cat: &'static str, start: Instant) {
        let ts = start.duration_since(self.origin).as_secs_f64() * 1e6;
        let dur = start.elapsed().as_secs_f64() * 1e6;
        self.events.push(TraceEvent {
            name,
            cat,
            ph: "X",
            ts,
            dur,
            pid: self.rank,
            tid: 0,
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Writes `trace.json` under the save directory. Returns the file path,
    /// `None` when profiling is disabled.
    pub fn finish(self) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        let path = write_trace(&self.save_dir, self.rank, &self.events)?;
        info!("🔬 Chrome trace with {} events written to {}", self.events.len(), path.display());
        Ok(Some(path))
    }
}

fn write_trace(dir: &Path, rank: usize, events: &[TraceEvent]) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let file_name = if rank == 0 { "trace.json".to_string() } else { format!("trace_rank{}.json", rank) };
    let path = dir.join(file_name);
    let json = serde_json::to_string_pretty(&TraceFile { trace_events: events, display_time_unit: "ms" })?;
    fs::write(&path, json)?;
    debug!("Trace file size: {} events", events.len());
    Ok(path)
}
