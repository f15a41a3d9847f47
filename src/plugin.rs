use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::BenchmarkArgs;

/// Stage layout used by `--custom-ckpt`, tuned for LLaMA-70B on 4 stages.
pub const CUSTOM_LAYERS_PER_STAGE: [usize; 4] = [19, 20, 20, 21];
pub const CUSTOM_CKPT_LAYERS_PER_STAGE: [usize; 4] = [19, 19, 19, 13];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PluginKind {
    Gemini,
    GeminiAuto,
    Fsdp,
    FsdpCpu,
    ThreeD,
    ThreeDCpu,
}

impl PluginKind {
    pub const ALL: [PluginKind; 6] = [
        PluginKind::Gemini,
        PluginKind::GeminiAuto,
        PluginKind::Fsdp,
        PluginKind::FsdpCpu,
        PluginKind::ThreeD,
        PluginKind::ThreeDCpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Gemini => "gemini",
            PluginKind::GeminiAuto => "gemini_auto",
            PluginKind::Fsdp => "fsdp",
            PluginKind::FsdpCpu => "fsdp_cpu",
            PluginKind::ThreeD => "3d",
            PluginKind::ThreeDCpu => "3d_cpu",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        PluginKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = PluginKind::ALL.iter().map(|kind| kind.as_str()).collect();
                anyhow::anyhow!("Unknown plugin {} (expected one of: {})", s, names.join(", "))
            })
    }
}

/// Pipeline schedule parameters of a hybrid plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSettings {
    pub num_stages: usize,
    pub microbatch_size: usize,
    pub layers_per_stage: Option<Vec<usize>>,
    pub ckpt_layers_per_stage: Option<Vec<usize>>,
}

impl PipelineSettings {
    /// Layer ranges per stage for a model of `num_layers` layers.
    pub fn stage_ranges(&self, num_layers: usize) -> Result<Vec<Range<usize>>> {
        let layers_per_stage = match &self.layers_per_stage {
            Some(layout) => {
                if layout.len() != self.num_stages {
                    return Err(anyhow::anyhow!(
                        "Custom layout has {} stages but pp is {}",
                        layout.len(),
                        self.num_stages
                    ));
                }
                let total: usize = layout.iter().sum();
                if total != num_layers {
                    return Err(anyhow::anyhow!(
                        "Custom layout covers {} layers but the model has {}",
                        total,
                        num_layers
                    ));
                }
                if let Some(ckpt) = &self.ckpt_layers_per_stage {
                    if ckpt.len() != layout.len() || ckpt.iter().zip(layout).any(|(c, l)| c > l) {
                        return Err(anyhow::anyhow!(
                            "Checkpointed layers {:?} do not fit stage layout {:?}",
                            ckpt,
                            layout
                        ));
                    }
                }
                layout.clone()
            }
            None => distribute_layers(num_layers, self.num_stages)?,
        };

        let mut start = 0;
        Ok(layers_per_stage
            .into_iter()
            .map(|count| {
                let range = start..start + count;
                start += count;
                range
            })
            .collect())
    }

    pub fn num_microbatches(&self, batch_size: usize) -> usize {
        batch_size / self.microbatch_size
    }
}

/// Even split of layers over stages; the remainder goes to the middle stages.
pub fn distribute_layers(num_layers: usize, num_stages: usize) -> Result<Vec<usize>> {
    if num_stages == 0 || num_layers < num_stages {
        return Err(anyhow::anyhow!(
            "Cannot split {} layers over {} pipeline stages",
            num_layers,
            num_stages
        ));
    }
    let quotient = num_layers / num_stages;
    let remainder = num_layers % num_stages;
    let mut layers = vec![quotient; num_stages];
    let start = num_stages / 2 - remainder / 2;
    for count in layers.iter_mut().skip(start).take(remainder) {
        *count += 1;
    }
    Ok(layers)
}

/// A fully parameterized parallel execution configuration.
pub trait Plugin: Send + Sync {
    fn kind(&self) -> PluginKind;
    fn precision(&self) -> Precision;
    /// Number of data-parallel replicas the global batch is split over.
    fn dp_size(&self) -> usize;
    /// Whether parameters stay unmaterialized until boosting.
    fn lazy_init(&self) -> bool;
    fn pipeline(&self) -> Option<&PipelineSettings> {
        None
    }
    fn settings(&self) -> Vec<(&'static str, String)>;

    fn name(&self) -> &str {
        self.kind().as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlacementPolicy {
    Static,
    Auto,
}

/// Chunk-based ZeRO with heterogeneous memory placement.
#[derive(Debug, Clone, Serialize)]
pub struct GeminiPlugin {
    kind: PluginKind,
    placement_policy: PlacementPolicy,
    precision: Precision,
    shard_param_frac: f64,
    offload_optim_frac: f64,
    offload_param_frac: f64,
    warmup_non_model_data_ratio: Option<f64>,
    tp_size: usize,
    extra_dp_size: usize,
    memory_limit_mb: Option<usize>,
    enable_fused_normalization: bool,
    enable_flash_attention: bool,
    max_prefetch: usize,
    world_size: usize,
}

impl GeminiPlugin {
    pub fn new(kind: PluginKind, args: &BenchmarkArgs, world_size: usize, cuda: bool) -> Result<Self> {
        let auto = match kind {
            PluginKind::Gemini => false,
            PluginKind::GeminiAuto => true,
            other => return Err(anyhow::anyhow!("{} is not a gemini plugin", other)),
        };

        let model_parallel = args.tp * args.extra_dp;
        if world_size % model_parallel != 0 {
            return Err(anyhow::anyhow!(
                "World size {} is not divisible by tp ({}) x extra_dp ({})",
                world_size,
                args.tp,
                args.extra_dp
            ));
        }

        let plugin = if auto {
            Self {
                kind,
                placement_policy: PlacementPolicy::Auto,
                precision: Precision::Bf16,
                shard_param_frac: 1.0,
                offload_optim_frac: 0.0,
                offload_param_frac: 0.0,
                warmup_non_model_data_ratio: Some(args.warmup_ratio),
                tp_size: args.tp,
                extra_dp_size: args.extra_dp,
                memory_limit_mb: args.memory_limit,
                enable_fused_normalization: cuda,
                enable_flash_attention: args.xformers,
                max_prefetch: 0,
                world_size,
            }
        } else {
            Self {
                kind,
                placement_policy: PlacementPolicy::Static,
                precision: Precision::Bf16,
                shard_param_frac: args.shard_param_frac,
                offload_optim_frac: args.offload_optim_frac,
                offload_param_frac: args.offload_param_frac,
                warmup_non_model_data_ratio: None,
                tp_size: args.tp,
                extra_dp_size: args.extra_dp,
                memory_limit_mb: args.memory_limit,
                enable_fused_normalization: cuda,
                enable_flash_attention: args.xformers,
                max_prefetch: 10,
                world_size,
            }
        };
        plugin.validate()?;
        Ok(plugin)
    }

    fn validate(&self) -> Result<()> {
        let fractions = [
            ("shard_param_frac", Some(self.shard_param_frac)),
            ("offload_optim_frac", Some(self.offload_optim_frac)),
            ("offload_param_frac", Some(self.offload_param_frac)),
            ("warmup_ratio", self.warmup_non_model_data_ratio),
        ];
        for (name, value) in fractions {
            if let Some(value) = value {
                if !(0.0..=1.0).contains(&value) {
                    return Err(anyhow::anyhow!("{} must be within [0, 1], got {}", name, value));
                }
            }
        }
        Ok(())
    }

    pub fn placement_policy(&self) -> PlacementPolicy {
        self.placement_policy
    }
}

impl Plugin for GeminiPlugin {
    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn dp_size(&self) -> usize {
        self.world_size / self.tp_size
    }

    fn lazy_init(&self) -> bool {
        true
    }

    fn settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![
            ("placement_policy", format!("{:?}", self.placement_policy)),
            ("precision", format!("{:?}", self.precision)),
            ("tp_size", self.tp_size.to_string()),
            ("extra_dp_size", self.extra_dp_size.to_string()),
            ("zero_size", (self.world_size / (self.tp_size * self.extra_dp_size)).to_string()),
        ];
        match self.placement_policy {
            PlacementPolicy::Static => {
                settings.push(("shard_param_frac", self.shard_param_frac.to_string()));
                settings.push(("offload_optim_frac", self.offload_optim_frac.to_string()));
                settings.push(("offload_param_frac", self.offload_param_frac.to_string()));
                settings.push(("max_prefetch", self.max_prefetch.to_string()));
            }
            PlacementPolicy::Auto => {
                if let Some(ratio) = self.warmup_non_model_data_ratio {
                    settings.push(("warmup_non_model_data_ratio", ratio.to_string()));
                }
            }
        }
        if let Some(limit) = self.memory_limit_mb {
            settings.push(("memory_limit_mb", limit.to_string()));
        }
        settings.push(("fused_normalization", self.enable_fused_normalization.to_string()));
        settings.push(("flash_attention", self.enable_flash_attention.to_string()));
        settings
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MixedPrecision {
    pub param_dtype: Precision,
    pub reduce_dtype: Precision,
    pub buffer_dtype: Precision,
}

/// Fully sharded data parallel; every rank is a data-parallel replica.
#[derive(Debug, Clone, Serialize)]
pub struct FsdpPlugin {
    kind: PluginKind,
    mixed_precision: MixedPrecision,
    cpu_offload_params: bool,
    world_size: usize,
}

impl FsdpPlugin {
    pub fn new(kind: PluginKind, world_size: usize) -> Result<Self> {
        let cpu_offload_params = match kind {
            PluginKind::Fsdp => false,
            PluginKind::FsdpCpu => true,
            other => return Err(anyhow::anyhow!("{} is not an fsdp plugin", other)),
        };
        Ok(Self {
            kind,
            mixed_precision: MixedPrecision {
                param_dtype: Precision::Fp16,
                reduce_dtype: Precision::Fp16,
                buffer_dtype: Precision::Fp16,
            },
            cpu_offload_params,
            world_size,
        })
    }
}

impl Plugin for FsdpPlugin {
    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn precision(&self) -> Precision {
        self.mixed_precision.param_dtype
    }

    fn dp_size(&self) -> usize {
        self.world_size
    }

    fn lazy_init(&self) -> bool {
        false
    }

    fn settings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("param_dtype", format!("{:?}", self.mixed_precision.param_dtype)),
            ("reduce_dtype", format!("{:?}", self.mixed_precision.reduce_dtype)),
            ("buffer_dtype", format!("{:?}", self.mixed_precision.buffer_dtype)),
            ("cpu_offload_params", self.cpu_offload_params.to_string()),
        ]
    }
}

/// Tensor x pipeline x data parallel with optional ZeRO sharding.
#[derive(Debug, Clone, Serialize)]
pub struct HybridParallelPlugin {
    kind: PluginKind,
    tp_size: usize,
    pp_size: usize,
    zero_stage: usize,
    cpu_offload: bool,
    precision: Precision,
    initial_scale: f64,
    dp_outside: bool,
    enable_fused_normalization: bool,
    enable_flash_attention: bool,
    pipeline: PipelineSettings,
    world_size: usize,
}

impl HybridParallelPlugin {
    pub fn new(kind: PluginKind, args: &BenchmarkArgs, world_size: usize, cuda: bool) -> Result<Self> {
        let cpu_offload = match kind {
            PluginKind::ThreeD => false,
            PluginKind::ThreeDCpu => true,
            other => return Err(anyhow::anyhow!("{} is not a hybrid parallel plugin", other)),
        };

        if args.zero > 2 {
            return Err(anyhow::anyhow!("ZeRO stage must be 0, 1 or 2, got {}", args.zero));
        }
        if args.pp > 1 && args.zero > 1 {
            return Err(anyhow::anyhow!(
                "ZeRO stage {} cannot be combined with pipeline parallelism (pp={})",
                args.zero,
                args.pp
            ));
        }
        if cpu_offload && args.zero == 0 {
            debug!("CPU offload requested without ZeRO sharding");
        }
        let model_parallel = args.tp * args.pp;
        if world_size % model_parallel != 0 {
            return Err(anyhow::anyhow!(
                "World size {} is not divisible by tp ({}) x pp ({})",
                world_size,
                args.tp,
                args.pp
            ));
        }
        if args.pp > 1 && args.batch_size % args.mbs != 0 {
            return Err(anyhow::anyhow!(
                "Batch size {} is not divisible by micro batch size {}",
                args.batch_size,
                args.mbs
            ));
        }

        // the custom layout only applies to the plain 3d plugin
        let (layers_per_stage, ckpt_layers_per_stage) = if args.custom_ckpt && !cpu_offload {
            (
                Some(CUSTOM_LAYERS_PER_STAGE.to_vec()),
                Some(CUSTOM_CKPT_LAYERS_PER_STAGE.to_vec()),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            kind,
            tp_size: args.tp,
            pp_size: args.pp,
            zero_stage: args.zero,
            cpu_offload,
            precision: Precision::Bf16,
            initial_scale: if cpu_offload { 2f64.powi(8) } else { 2f64.powi(16) },
            dp_outside: cpu_offload,
            enable_fused_normalization: cuda,
            enable_flash_attention: args.xformers,
            pipeline: PipelineSettings {
                num_stages: args.pp,
                microbatch_size: args.mbs,
                layers_per_stage,
                ckpt_layers_per_stage,
            },
            world_size,
        })
    }

    pub fn zero_stage(&self) -> usize {
        self.zero_stage
    }
}

impl Plugin for HybridParallelPlugin {
    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn dp_size(&self) -> usize {
        self.world_size / (self.tp_size * self.pp_size)
    }

    fn lazy_init(&self) -> bool {
        true
    }

    fn pipeline(&self) -> Option<&PipelineSettings> {
        if self.pp_size > 1 {
            Some(&self.pipeline)
        } else {
            None
        }
    }

    fn settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![
            ("tp_size", self.tp_size.to_string()),
            ("pp_size", self.pp_size.to_string()),
            ("zero_stage", self.zero_stage.to_string()),
            ("precision", format!("{:?}", self.precision)),
            ("cpu_offload", self.cpu_offload.to_string()),
            ("initial_scale", self.initial_scale.to_string()),
            ("dp_outside", self.dp_outside.to_string()),
            ("microbatch_size", self.pipeline.microbatch_size.to_string()),
        ];
        if let Some(layout) = &self.pipeline.layers_per_stage {
            settings.push(("num_layers_per_stage", format!("{:?}", layout)));
        }
        if let Some(ckpt) = &self.pipeline.ckpt_layers_per_stage {
            settings.push(("num_ckpt_layers_per_stage", format!("{:?}", ckpt)));
        }
        settings.push(("fused_normalization", self.enable_fused_normalization.to_string()));
        settings.push(("flash_attention", self.enable_flash_attention.to_string()));
        settings
    }
}

// Factory function to create plugins by name
pub fn create_plugin(
    name: &str,
    args: &BenchmarkArgs,
    world_size: usize,
    cuda: bool,
) -> Result<Box<dyn Plugin>> {
    let kind: PluginKind = name.parse()?;
    let plugin: Box<dyn Plugin> = match kind {
        PluginKind::Gemini | PluginKind::GeminiAuto => {
            Box::new(GeminiPlugin::new(kind, args, world_size, cuda)?)
        }
        PluginKind::Fsdp | PluginKind::FsdpCpu => Box::new(FsdpPlugin::new(kind, world_size)?),
        PluginKind::ThreeD | PluginKind::ThreeDCpu => {
            Box::new(HybridParallelPlugin::new(kind, args, world_size, cuda)?)
        }
    };
    info!("🔀 Plugin {}: dp_size={}, precision={:?}", plugin.name(), plugin.dp_size(), plugin.precision());
    Ok(plugin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> BenchmarkArgs {
        let mut argv = vec!["benchmark"];
        argv.extend_from_slice(extra);
        BenchmarkArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn every_supported_plugin_constructs() {
        let args = args(&[]);
        for kind in PluginKind::ALL {
            let plugin = create_plugin(kind.as_str(), &args, 1, false).unwrap();
            assert_eq!(plugin.kind(), kind);
            assert_eq!(plugin.dp_size(), 1);
            assert!(!plugin.settings().is_empty());
        }
    }

    #[test]
    fn unknown_plugin_is_fatal() {
        let err = create_plugin("ddp", &args(&[]), 1, false).err().unwrap();
        assert!(err.to_string().contains("Unknown plugin ddp"));
        assert!("GEMINI".parse::<PluginKind>().is_err());
    }

    #[test]
    fn data_parallel_size_per_plugin() {
        let args = args(&["--tp", "2", "--pp", "2"]);
        assert_eq!(create_plugin("gemini", &args, 8, true).unwrap().dp_size(), 4);
        assert_eq!(create_plugin("fsdp", &args, 8, true).unwrap().dp_size(), 8);
        assert_eq!(create_plugin("3d", &args, 8, true).unwrap().dp_size(), 2);
    }

    #[test]
    fn world_size_must_divide_model_parallel_degree() {
        let args = args(&["--tp", "3"]);
        assert!(create_plugin("gemini", &args, 4, false).is_err());
        assert!(create_plugin("3d", &args, 4, false).is_err());
        assert!(create_plugin("fsdp", &args, 4, false).is_ok());
    }

    #[test]
    fn hybrid_validates_zero_and_microbatches() {
        assert!(create_plugin("3d", &args(&["--zero", "3"]), 1, false).is_err());
        assert!(create_plugin("3d", &args(&["--pp", "2", "--zero", "2"]), 2, false).is_err());
        assert!(create_plugin("3d", &args(&["--pp", "2", "-b", "3", "--mbs", "2"]), 2, false).is_err());

        let plugin = create_plugin("3d", &args(&["--pp", "2", "-b", "4", "--mbs", "2", "--zero", "1"]), 2, false).unwrap();
        let pipeline = plugin.pipeline().unwrap();
        assert_eq!(pipeline.num_stages, 2);
        assert_eq!(pipeline.num_microbatches(4), 2);
    }

    #[test]
    fn pipeline_only_when_pp_above_one() {
        assert!(create_plugin("3d", &args(&[]), 1, false).unwrap().pipeline().is_none());
        assert!(create_plugin("gemini", &args(&["--pp", "2"]), 1, false).unwrap().pipeline().is_none());
    }

    #[test]
    fn gemini_rejects_out_of_range_fractions() {
        assert!(create_plugin("gemini", &args(&["--offload_param_frac", "1.5"]), 1, false).is_err());
        assert!(create_plugin("gemini_auto", &args(&["-w", "1.5"]), 1, false).is_err());
        // gemini_auto ignores the static placement fractions
        assert!(create_plugin("gemini_auto", &args(&["--offload_param_frac", "1.5"]), 1, false).is_ok());
    }

    #[test]
    fn concrete_plugins_expose_their_mode() {
        let gemini = GeminiPlugin::new(PluginKind::Gemini, &args(&[]), 1, false).unwrap();
        assert_eq!(gemini.placement_policy(), PlacementPolicy::Static);
        let auto = GeminiPlugin::new(PluginKind::GeminiAuto, &args(&[]), 1, false).unwrap();
        assert_eq!(auto.placement_policy(), PlacementPolicy::Auto);

        let hybrid = HybridParallelPlugin::new(PluginKind::ThreeD, &args(&["--zero", "2"]), 1, false).unwrap();
        assert_eq!(hybrid.zero_stage(), 2);
        assert!(HybridParallelPlugin::new(PluginKind::Fsdp, &args(&[]), 1, false).is_err());
    }

    #[test]
    fn fused_normalization_follows_cuda() {
        let fused = |plugin: &dyn Plugin| {
            plugin.settings().into_iter().find(|(key, _)| *key == "fused_normalization").map(|(_, value)| value)
        };
        for name in ["gemini", "gemini_auto", "3d", "3d_cpu"] {
            assert_eq!(fused(create_plugin(name, &args(&[]), 1, true).unwrap().as_ref()).as_deref(), Some("true"));
            assert_eq!(fused(create_plugin(name, &args(&[]), 1, false).unwrap().as_ref()).as_deref(), Some("false"));
        }
    }

    #[test]
    fn distributes_remainder_to_middle_stages() {
        assert_eq!(distribute_layers(32, 4).unwrap(), vec![8, 8, 8, 8]);
        assert_eq!(distribute_layers(10, 4).unwrap(), vec![2, 3, 3, 2]);
        assert_eq!(distribute_layers(7, 3).unwrap(), vec![2, 3, 2]);
        assert!(distribute_layers(2, 4).is_err());
    }

    #[test]
    fn custom_layout_must_match_model_depth() {
        let plugin = create_plugin("3d", &args(&["--pp", "4", "--custom-ckpt"]), 4, true).unwrap();
        let pipeline = plugin.pipeline().unwrap();
        let ranges = pipeline.stage_ranges(80).unwrap();
        assert_eq!(ranges, vec![0..19, 19..39, 39..59, 59..80]);
        assert!(pipeline.stage_ranges(32).is_err());

        // 3d_cpu never takes the custom layout
        let plugin = create_plugin("3d_cpu", &args(&["--pp", "4", "--custom-ckpt"]), 4, true).unwrap();
        assert_eq!(plugin.pipeline().unwrap().stage_ranges(32).unwrap().len(), 4);
    }
}
