use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::backend::{DeviceManager, DistCoordinator};
use crate::data::{Batch, DataLoader, RandomDataset};
use crate::models::{CausalLm, ModelInit};
use crate::plugin::Plugin;

const LEARNING_RATE: f64 = 1e-3;

/// Model wrapped for training under a plugin, split into pipeline stages.
pub struct BoostedModel {
    model: CausalLm,
    var_map: VarMap,
    stages: Vec<Range<usize>>,
}

impl BoostedModel {
    pub fn stages(&self) -> &[Range<usize>] {
        &self.stages
    }

    pub fn num_parameters(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    pub fn forward_loss(&self, batch: &Batch) -> Result<Tensor> {
        self.model.forward_loss(batch)
    }

    /// Stage-by-stage forward pass; hidden states cross each stage boundary.
    pub fn forward_loss_staged(&self, batch: &Batch) -> Result<Tensor> {
        let mut hidden_states = self.model.embed(&batch.input_ids)?;
        for (stage, layers) in self.stages.iter().enumerate() {
            debug!("Stage {} runs layers {:?}", stage, layers);
            hidden_states = self.model.forward_layers(&hidden_states, &batch.attention_mask, layers.clone())?;
        }
        let logits = self.model.head(&hidden_states)?;
        self.model.loss(&logits, &batch.labels)
    }
}

/// AdamW over the boosted model's variables with gradient accumulation
/// across backward calls until the next `step`.
pub struct BoostedOptimizer {
    inner: AdamW,
    vars: Vec<Var>,
    pending: Option<GradStore>,
}

impl BoostedOptimizer {
    fn new(vars: Vec<Var>) -> Result<Self> {
        let params = ParamsAdamW {
            lr: LEARNING_RATE,
            weight_decay: 0.0,
            ..Default::default()
        };
        Ok(Self {
            inner: AdamW::new(vars.clone(), params)?,
            vars,
            pending: None,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    pub fn has_pending_grads(&self) -> bool {
        self.pending.is_some()
    }

    /// Adds `grads` to the gradients gathered since the last step.
    pub fn accumulate(&mut self, mut grads: GradStore) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            self.pending = Some(grads);
            return Ok(());
        };
        for var in &self.vars {
            let Some(grad) = grads.remove(var.as_tensor()) else {
                continue;
            };
            let merged = match pending.remove(var.as_tensor()) {
                Some(previous) => (previous + grad)?,
                None => grad,
            };
            pending.insert(var.as_tensor(), merged);
        }
        Ok(())
    }

    pub fn step(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(grads) => self.inner.step(&grads)?,
            None => warn!("⚠️ Optimizer step without gradients, skipping"),
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.pending = None;
    }
}

/// Applies a plugin's strategy to the data loader, model and optimizer.
pub struct Booster {
    plugin: Box<dyn Plugin>,
    coordinator: DistCoordinator,
}

impl Booster {
    pub fn new(plugin: Box<dyn Plugin>, coordinator: DistCoordinator) -> Self {
        Self { plugin, coordinator }
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    /// This rank's position among the data-parallel replicas. Ranks of one
    /// model-parallel group are contiguous.
    pub fn dp_rank(&self) -> usize {
        let group_size = (self.coordinator.world_size() / self.plugin.dp_size()).max(1);
        self.coordinator.rank() / group_size
    }

    pub fn prepare_dataloader(
        &self,
        dataset: RandomDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
        device: &Device,
    ) -> Result<DataLoader> {
        let dp_size = self.plugin.dp_size();
        let dp_rank = self.dp_rank();
        debug!("Sharding {} samples for dp rank {} of {}", dataset.len(), dp_rank, dp_size);
        DataLoader::new(dataset, batch_size, shuffle, drop_last, seed, dp_rank, dp_size, device)
    }

    pub fn boost(&self, init: ModelInit, device_manager: &DeviceManager) -> Result<(BoostedModel, BoostedOptimizer)> {
        let dtype = device_manager.training_dtype(self.plugin.precision());
        if init.is_lazy() {
            info!("🚀 Materializing lazily initialized model under {}", self.plugin.name());
        }
        let (model, var_map) = init.materialize(device_manager.primary_device(), dtype)?;

        let num_layers = model.num_layers();
        let stages = match self.plugin.pipeline() {
            Some(pipeline) => pipeline.stage_ranges(num_layers)?,
            None => vec![0..num_layers],
        };
        info!("📊 {} stage(s): {:?}", stages.len(), stages);

        let optimizer = BoostedOptimizer::new(var_map.all_vars())?;
        Ok((BoostedModel { model, var_map, stages }, optimizer))
    }

    pub fn backward(&self, loss: &Tensor, optimizer: &mut BoostedOptimizer) -> Result<()> {
        let grads = loss.backward()?;
        optimizer.accumulate(grads)
    }

    /// Pulls one batch from `data_iter` and runs it as micro-batches through
    /// the pipeline stages, accumulating gradients into `optimizer`. Returns
    /// the mean loss over micro-batches.
    pub fn execute_pipeline<I>(&self, data_iter: &mut I, model: &BoostedModel, optimizer: &mut BoostedOptimizer) -> Result<f32>
    where
        I: Iterator<Item = Result<Batch>>,
    {
        let pipeline = self.plugin.pipeline().ok_or_else(|| {
            anyhow::anyhow!("Plugin {} has no pipeline stages to execute", self.plugin.name())
        })?;
        let batch = data_iter
            .next()
            .ok_or_else(|| anyhow::anyhow!("Data iterator exhausted before the pipeline step"))??;

        let batch_size = batch.batch_size();
        let microbatch_size = pipeline.microbatch_size;
        if batch_size % microbatch_size != 0 {
            return Err(anyhow::anyhow!(
                "Batch of {} rows cannot be split into micro-batches of {}",
                batch_size,
                microbatch_size
            ));
        }
        let num_microbatches = pipeline.num_microbatches(batch_size);

        let mut total_loss = 0f32;
        for i in 0..num_microbatches {
            let micro = batch.narrow(i * microbatch_size, microbatch_size)?;
            let loss = (model.forward_loss_staged(&micro)? / num_microbatches as f64)?;
            self.backward(&loss, optimizer)?;
            total_loss += loss.to_scalar::<f32>()?;
        }
        Ok(total_loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchmarkArgs;
    use crate::models::tests::tiny_config;
    use crate::plugin::create_plugin;
    use candle_core::DType;
    use clap::Parser;

    fn booster(plugin: &str, extra: &[&str], rank: usize, world: usize) -> Booster {
        let mut argv = vec!["benchmark"];
        argv.extend_from_slice(extra);
        let args = BenchmarkArgs::parse_from(argv);
        let plugin = create_plugin(plugin, &args, world, false).unwrap();
        Booster::new(plugin, DistCoordinator::new(rank, rank, world).unwrap())
    }

    fn cpu() -> DeviceManager {
        DeviceManager::new("cpu", 0).unwrap()
    }

    #[test]
    fn dp_rank_follows_model_parallel_groups() {
        assert_eq!(booster("3d", &["--tp", "2"], 3, 4).dp_rank(), 1);
        assert_eq!(booster("fsdp", &[], 3, 4).dp_rank(), 3);
    }

    #[test]
    fn dataloader_is_sharded_by_data_parallel_size() {
        let booster = booster("3d", &["--tp", "2"], 2, 4);
        let dataset = RandomDataset::new(2 * 3 * 2, 8, 64, 0).unwrap();
        let loader = booster.prepare_dataloader(dataset, 2, true, true, 42, &Device::Cpu).unwrap();
        assert_eq!(loader.len(), 3);
    }

    #[test]
    fn lazy_model_is_materialized_by_boost() {
        let booster = booster("gemini", &[], 0, 1);
        let init = ModelInit::new(tiny_config(), booster.plugin().lazy_init(), &Device::Cpu, DType::F32).unwrap();
        assert!(init.is_lazy());
        let (model, optimizer) = booster.boost(init, &cpu()).unwrap();
        assert_eq!(model.num_parameters(), tiny_config().num_parameters());
        assert_eq!(model.stages(), &[0..2]);
        assert_eq!(optimizer.learning_rate(), LEARNING_RATE);
    }

    #[test]
    fn backward_and_step_update_parameters() {
        let booster = booster("fsdp", &[], 0, 1);
        let init = ModelInit::new(tiny_config(), booster.plugin().lazy_init(), &Device::Cpu, DType::F32).unwrap();
        let (model, mut optimizer) = booster.boost(init, &cpu()).unwrap();

        let dataset = RandomDataset::new(2, 8, 64, 1).unwrap();
        let loader = booster.prepare_dataloader(dataset, 2, false, true, 0, &Device::Cpu).unwrap();
        let batch = loader.iter().next().unwrap().unwrap();

        let before = model.forward_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        for _ in 0..5 {
            let loss = model.forward_loss(&batch).unwrap();
            booster.backward(&loss, &mut optimizer).unwrap();
            assert!(optimizer.has_pending_grads());
            optimizer.step().unwrap();
            optimizer.zero_grad();
        }
        let after = model.forward_loss(&batch).unwrap().to_scalar::<f32>().unwrap();
        assert!(after < before, "loss did not drop: {} -> {}", before, after);
    }

    #[test]
    fn pipeline_consumes_one_batch_in_microbatches() {
        let booster = booster("3d", &["--pp", "2", "-b", "4", "--mbs", "2"], 0, 2);
        let init = ModelInit::new(tiny_config(), booster.plugin().lazy_init(), &Device::Cpu, DType::F32).unwrap();
        let (model, mut optimizer) = booster.boost(init, &cpu()).unwrap();
        assert_eq!(model.stages(), &[0..1, 1..2]);

        let dataset = RandomDataset::new(8, 8, 64, 2).unwrap();
        let loader = booster.prepare_dataloader(dataset, 4, false, true, 0, &Device::Cpu).unwrap();
        let mut data_iter = loader.iter();

        let full = model.forward_loss(&loader.iter().next().unwrap().unwrap()).unwrap().to_scalar::<f32>().unwrap();
        let loss = booster.execute_pipeline(&mut data_iter, &model, &mut optimizer).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
        // mean of equal-size micro-batch losses equals the full-batch loss
        assert!((loss - full).abs() < 1e-4, "{} vs {}", loss, full);
        assert!(optimizer.has_pending_grads());

        optimizer.step().unwrap();
        assert!(!optimizer.has_pending_grads());
        booster.execute_pipeline(&mut data_iter, &model, &mut optimizer).unwrap();
        assert!(booster.execute_pipeline(&mut data_iter, &model, &mut optimizer).is_err());
    }

    #[test]
    fn pipeline_requires_pipeline_plugin() {
        let booster = booster("gemini", &[], 0, 1);
        let init = ModelInit::new(tiny_config(), true, &Device::Cpu, DType::F32).unwrap();
        let (model, mut optimizer) = booster.boost(init, &cpu()).unwrap();
        let mut empty = std::iter::empty::<Result<Batch>>();
        assert!(booster.execute_pipeline(&mut empty, &model, &mut optimizer).is_err());
    }
}
