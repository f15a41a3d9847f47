use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

use crate::data::Batch;

// Helper for RMS normalization built from differentiable primitives
fn rms_norm(input: &Tensor, weight: &Tensor, eps: f64) -> Result<Tensor> {
    let dtype = input.dtype();
    let input = input.to_dtype(DType::F32)?;
    let variance = input.sqr()?.mean_keepdim(D::Minus1)?;
    let normalized = input.broadcast_div(&(variance + eps)?.sqrt()?)?;
    Ok(normalized.to_dtype(dtype)?.broadcast_mul(weight)?)
}

fn silu(input: &Tensor) -> Result<Tensor> {
    Ok((input / (input.neg()?.exp()? + 1.0)?)?)
}

/// LLaMA hyperparameters, deserializable from a Hugging Face style `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaConfig {
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub tie_word_embeddings: bool,
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self {
            model_type: "llama".to_string(),
            vocab_size: 32000,
            hidden_size: 4096,
            intermediate_size: 11008,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: None,
            max_position_embeddings: 2048,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            tie_word_embeddings: false,
        }
    }
}

impl LlamaConfig {
    pub fn llama_7b() -> Self {
        Self {
            max_position_embeddings: 4096,
            ..Self::default()
        }
    }

    pub fn llama_13b() -> Self {
        Self {
            hidden_size: 5120,
            intermediate_size: 13824,
            num_hidden_layers: 40,
            num_attention_heads: 40,
            max_position_embeddings: 4096,
            ..Self::default()
        }
    }

    pub fn llama_70b() -> Self {
        Self {
            hidden_size: 8192,
            intermediate_size: 28672,
            num_hidden_layers: 80,
            num_attention_heads: 64,
            num_key_value_heads: Some(8),
            max_position_embeddings: 4096,
            ..Self::default()
        }
    }

    pub fn preset(tag: &str) -> Option<Self> {
        match tag {
            "7b" => Some(Self::llama_7b()),
            "13b" => Some(Self::llama_13b()),
            "70b" => Some(Self::llama_70b()),
            _ => None,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read model config {}: {}", path.display(), e))?;
        let config: LlamaConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves `--config`: a preset tag first, then a JSON file path or a
    /// model directory holding `config.json`.
    pub fn resolve(name: &str) -> Result<Self> {
        if let Some(config) = Self::preset(name) {
            return Ok(config);
        }
        let path = Path::new(name);
        if path.is_file() {
            return Self::from_json_file(path);
        }
        if path.is_dir() {
            return Self::from_json_file(path.join("config.json"));
        }
        Err(anyhow::anyhow!(
            "Unknown model config '{}': expected one of 7b, 13b, 70b, a JSON config or a model directory",
            name
        ))
    }

    /// Grows the rotary table so sequences of `seq_len` tokens fit. Parameter
    /// shapes do not depend on it.
    pub fn with_positions_for(mut self, seq_len: usize) -> Self {
        if seq_len > self.max_position_embeddings {
            debug!(
                "Extending rotary positions from {} to {}",
                self.max_position_embeddings,
                seq_len
            );
            self.max_position_embeddings = seq_len;
        }
        self
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_hidden_layers == 0 {
            return Err(anyhow::anyhow!("Model config has zero-sized dimensions"));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(anyhow::anyhow!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            ));
        }
        if self.head_dim() % 2 != 0 {
            return Err(anyhow::anyhow!("Rotary embeddings need an even head dim, got {}", self.head_dim()));
        }
        let kv_heads = self.num_kv_heads();
        if kv_heads == 0 || self.num_attention_heads % kv_heads != 0 {
            return Err(anyhow::anyhow!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads,
                kv_heads
            ));
        }
        Ok(())
    }

    /// Exact trainable parameter count of [`CausalLm`] built from this config.
    pub fn num_parameters(&self) -> usize {
        let hidden_size = self.hidden_size;
        let kv_size = self.num_kv_heads() * self.head_dim();

        let embedding_params = self.vocab_size * hidden_size;

        // q and o are square, k and v project to the kv heads only
        let attention_params = 2 * hidden_size * hidden_size + 2 * hidden_size * kv_size;
        let mlp_params = 3 * hidden_size * self.intermediate_size;
        let norm_params = 2 * hidden_size;
        let layer_params = attention_params + mlp_params + norm_params;

        let lm_head_params = if self.tie_word_embeddings { 0 } else { self.vocab_size * hidden_size };

        embedding_params + self.num_hidden_layers * layer_params + hidden_size + lm_head_params
    }
}

/// Parameter counts in binary units, e.g. `6.28 B` for the 7b preset.
pub fn format_numel(numel: usize) -> String {
    const B: f64 = 1024.0 * 1024.0 * 1024.0;
    const M: f64 = 1024.0 * 1024.0;
    const K: f64 = 1024.0;
    let n = numel as f64;
    if n >= B {
        format!("{:.2} B", n / B)
    } else if n >= M {
        format!("{:.2} M", n / M)
    } else if n >= K {
        format!("{:.2} K", n / K)
    } else {
        numel.to_string()
    }
}

/// LLaMA-style decoder-only language model.
pub struct CausalLm {
    config: LlamaConfig,
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm_weight: Tensor,
    lm_head: Linear,
    rotary: RotaryEmbedding,
}

impl CausalLm {
    pub fn new(config: &LlamaConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let embed_tokens = candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("model.embed_tokens"))?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::new(config, vb.pp(format!("model.layers.{}", i)))?);
        }

        let norm_weight = vb.get_with_hints(
            config.hidden_size,
            "model.norm.weight",
            candle_nn::init::Init::Const(1.0),
        )?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };
        let rotary = RotaryEmbedding::new(config, vb.dtype(), vb.device())?;

        Ok(Self {
            config: config.clone(),
            embed_tokens,
            layers,
            norm_weight,
            lm_head,
            rotary,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(input_ids)?)
    }

    /// Runs the decoder layers in `layers` over `hidden_states`.
    pub fn forward_layers(&self, hidden_states: &Tensor, attention_mask: &Tensor, layers: Range<usize>) -> Result<Tensor> {
        if layers.end > self.layers.len() {
            return Err(anyhow::anyhow!(
                "Layer range {:?} exceeds model depth {}",
                layers,
                self.layers.len()
            ));
        }
        let (_, seq_len, _) = hidden_states.dims3()?;
        let (cos, sin) = self.rotary.cos_sin(seq_len)?;
        let bias = attention_bias(attention_mask, seq_len)?;

        let mut hidden_states = hidden_states.clone();
        for layer in &self.layers[layers] {
            hidden_states = layer.forward(&hidden_states, &cos, &sin, &bias)?;
        }
        Ok(hidden_states)
    }

    pub fn head(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let hidden_states = rms_norm(hidden_states, &self.norm_weight, self.config.rms_norm_eps)?;
        Ok(self.lm_head.forward(&hidden_states)?)
    }

    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let hidden_states = self.embed(input_ids)?;
        let hidden_states = self.forward_layers(&hidden_states, attention_mask, 0..self.layers.len())?;
        self.head(&hidden_states)
    }

    /// Next-token cross entropy over a batch, labels shifted by one position.
    pub fn loss(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, vocab_size) = logits.dims3()?;
        let shifted_logits = logits
            .narrow(1, 0, seq_len - 1)?
            .to_dtype(DType::F32)?
            .reshape((batch_size * (seq_len - 1), vocab_size))?;
        let shifted_labels = labels
            .narrow(1, 1, seq_len - 1)?
            .contiguous()?
            .reshape(batch_size * (seq_len - 1))?;
        Ok(candle_nn::loss::cross_entropy(&shifted_logits, &shifted_labels)?)
    }

    pub fn forward_loss(&self, batch: &Batch) -> Result<Tensor> {
        let logits = self.forward(&batch.input_ids, &batch.attention_mask)?;
        self.loss(&logits, &batch.labels)
    }
}

// Additive attention bias: causal -inf above the diagonal plus a large
// negative value on padded keys.
fn attention_bias(attention_mask: &Tensor, seq_len: usize) -> Result<Tensor> {
    let device = attention_mask.device();
    let causal: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    let causal = Tensor::from_vec(causal, (1, 1, seq_len, seq_len), device)?;

    let (batch_size, _) = attention_mask.dims2()?;
    let padding = ((attention_mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?) * -1e9)?
        .reshape((batch_size, 1, 1, seq_len))?;
    Ok(causal.broadcast_add(&padding)?)
}

struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, dtype: DType, device: &Device) -> Result<Self> {
        let head_dim = config.head_dim();
        let max_len = config.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / config.rope_theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let positions = Tensor::arange(0u32, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn cos_sin(&self, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let max_len = self.cos.dim(0)?;
        if seq_len > max_len {
            return Err(anyhow::anyhow!(
                "Sequence length {} exceeds max_position_embeddings {}",
                seq_len,
                max_len
            ));
        }
        Ok((self.cos.narrow(0, 0, seq_len)?, self.sin.narrow(0, 0, seq_len)?))
    }
}

fn apply_rotary(xs: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let half = xs.dim(D::Minus1)? / 2;
    let x1 = xs.narrow(D::Minus1, 0, half)?;
    let x2 = xs.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    Ok((xs.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?)
}

struct DecoderLayer {
    attention: Attention,
    mlp: Mlp,
    input_layernorm: Tensor,
    post_attention_layernorm: Tensor,
    eps: f64,
}

impl DecoderLayer {
    fn new(config: &LlamaConfig, vb: VarBuilder) -> Result<Self> {
        let attention = Attention::new(config, vb.pp("self_attn"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;
        let input_layernorm = vb.get_with_hints(
            config.hidden_size,
            "input_layernorm.weight",
            candle_nn::init::Init::Const(1.0),
        )?;
        let post_attention_layernorm = vb.get_with_hints(
            config.hidden_size,
            "post_attention_layernorm.weight",
            candle_nn::init::Init::Const(1.0),
        )?;

        Ok(Self {
            attention,
            mlp,
            input_layernorm,
            post_attention_layernorm,
            eps: config.rms_norm_eps,
        })
    }

    fn forward(&self, hidden_states: &Tensor, cos: &Tensor, sin: &Tensor, bias: &Tensor) -> Result<Tensor> {
        // Pre-norm residual blocks
        let normed = rms_norm(hidden_states, &self.input_layernorm, self.eps)?;
        let hidden_states = (hidden_states + self.attention.forward(&normed, cos, sin, bias)?)?;

        let normed = rms_norm(&hidden_states, &self.post_attention_layernorm, self.eps)?;
        Ok((&hidden_states + self.mlp.forward(&normed)?)?)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(config: &LlamaConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.head_dim();
        let kv_size = config.num_kv_heads() * head_dim;

        let q_proj = candle_nn::linear_no_bias(config.hidden_size, config.hidden_size, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear_no_bias(config.hidden_size, kv_size, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear_no_bias(config.hidden_size, kv_size, vb.pp("v_proj"))?;
        let o_proj = candle_nn::linear_no_bias(config.hidden_size, config.hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim,
        })
    }

    fn repeat_kv(&self, xs: Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(xs);
        }
        let (batch_size, num_kv_heads, seq_len, head_dim) = xs.dims4()?;
        Ok(xs
            .unsqueeze(2)?
            .expand((batch_size, num_kv_heads, n_rep, seq_len, head_dim))?
            .contiguous()?
            .reshape((batch_size, num_kv_heads * n_rep, seq_len, head_dim))?)
    }

    fn forward(&self, hidden_states: &Tensor, cos: &Tensor, sin: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, hidden_size) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states)?
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self.k_proj.forward(hidden_states)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self.v_proj.forward(hidden_states)?
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = apply_rotary(&q, cos, sin)?;
        let k = self.repeat_kv(apply_rotary(&k, cos, sin)?)?;
        let v = self.repeat_kv(v)?;

        // Scores and softmax in f32 regardless of the parameter dtype
        let dtype = q.dtype();
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)?.to_dtype(DType::F32)? * scale)?;
        let scores = scores.broadcast_add(bias)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
        let attention_output = weights.matmul(&v)?;

        let attention_output = attention_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, hidden_size))?;

        Ok(self.o_proj.forward(&attention_output)?)
    }
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn new(config: &LlamaConfig, vb: VarBuilder) -> Result<Self> {
        let gate_proj = candle_nn::linear_no_bias(config.hidden_size, config.intermediate_size, vb.pp("gate_proj"))?;
        let up_proj = candle_nn::linear_no_bias(config.hidden_size, config.intermediate_size, vb.pp("up_proj"))?;
        let down_proj = candle_nn::linear_no_bias(config.intermediate_size, config.hidden_size, vb.pp("down_proj"))?;

        Ok(Self { gate_proj, up_proj, down_proj })
    }

    fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let gate = silu(&self.gate_proj.forward(hidden_states)?)?;
        let up = self.up_proj.forward(hidden_states)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Model construction deferred until the booster knows where parameters live.
pub enum ModelInit {
    Lazy(LlamaConfig),
    Materialized { model: CausalLm, var_map: VarMap },
}

impl ModelInit {
    pub fn new(config: LlamaConfig, lazy: bool, device: &Device, dtype: DType) -> Result<Self> {
        if lazy {
            debug!("Deferring parameter materialization to the booster");
            Ok(Self::Lazy(config))
        } else {
            let (model, var_map) = materialize(&config, device, dtype)?;
            Ok(Self::Materialized { model, var_map })
        }
    }

    pub fn config(&self) -> &LlamaConfig {
        match self {
            Self::Lazy(config) => config,
            Self::Materialized { model, .. } => model.config(),
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy(_))
    }

    pub fn materialize(self, device: &Device, dtype: DType) -> Result<(CausalLm, VarMap)> {
        match self {
            Self::Lazy(config) => materialize(&config, device, dtype),
            Self::Materialized { model, var_map } => Ok((model, var_map)),
        }
    }
}

fn materialize(config: &LlamaConfig, device: &Device, dtype: DType) -> Result<(CausalLm, VarMap)> {
    info!("🧱 Materializing {} parameters as {:?} on {:?}", format_numel(config.num_parameters()), dtype, device);
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, dtype, device);
    let model = CausalLm::new(config, vb)?;
    Ok((model, var_map))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> LlamaConfig {
        LlamaConfig {
            vocab_size: 64,
            hidden_size: 32,
            intermediate_size: 48,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 32,
            ..LlamaConfig::default()
        }
    }

    #[test]
    fn preset_parameter_counts() {
        assert_eq!(LlamaConfig::llama_7b().num_parameters(), 6_738_415_616);
        assert_eq!(LlamaConfig::llama_13b().num_parameters(), 13_015_864_320);
        assert_eq!(LlamaConfig::llama_70b().num_parameters(), 68_976_648_192);
    }

    #[test]
    fn formats_binary_units() {
        assert_eq!(format_numel(LlamaConfig::llama_7b().num_parameters()), "6.28 B");
        assert_eq!(format_numel(3 * 1024 * 1024), "3.00 M");
        assert_eq!(format_numel(2048), "2.00 K");
        assert_eq!(format_numel(999), "999");
    }

    #[test]
    fn analytic_count_matches_materialized_vars() {
        let config = tiny_config();
        let (_, var_map) = materialize(&config, &Device::Cpu, DType::F32).unwrap();
        let materialized: usize = var_map.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(materialized, config.num_parameters());

        let tied = LlamaConfig { tie_word_embeddings: true, ..config };
        let (_, var_map) = materialize(&tied, &Device::Cpu, DType::F32).unwrap();
        let materialized: usize = var_map.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(materialized, tied.num_parameters());
    }

    #[test]
    fn forward_produces_vocab_logits_and_finite_loss() {
        let config = tiny_config();
        let (model, _) = materialize(&config, &Device::Cpu, DType::F32).unwrap();
        let ids: Vec<u32> = (0..16).map(|i| (i * 7 % 64) as u32).collect();
        let input_ids = Tensor::from_vec(ids, (2, 8), &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 8), DType::U32, &Device::Cpu).unwrap();

        let logits = model.forward(&input_ids, &mask).unwrap();
        assert_eq!(logits.dims(), &[2, 8, 64]);

        let loss = model.loss(&logits, &input_ids).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        assert!(loss > 0.0 && loss < 2.0 * (64f32).ln());
    }

    #[test]
    fn staged_forward_matches_full_forward() {
        let config = tiny_config();
        let (model, _) = materialize(&config, &Device::Cpu, DType::F32).unwrap();
        let ids: Vec<u32> = (0..8).map(|i| i as u32).collect();
        let input_ids = Tensor::from_vec(ids, (1, 8), &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 8), DType::U32, &Device::Cpu).unwrap();

        let full = model.forward(&input_ids, &mask).unwrap();

        let hidden = model.embed(&input_ids).unwrap();
        let hidden = model.forward_layers(&hidden, &mask, 0..1).unwrap();
        let hidden = model.forward_layers(&hidden, &mask, 1..2).unwrap();
        let staged = model.head(&hidden).unwrap();

        let diff = (full - staged).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-5);
        assert!(model.forward_layers(&model.embed(&input_ids).unwrap(), &mask, 0..3).is_err());
    }

    #[test]
    fn resolves_presets_and_json_files() {
        assert_eq!(LlamaConfig::resolve("13b").unwrap().hidden_size, 5120);
        assert!(LlamaConfig::resolve("not-a-model").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"vocab_size": 128, "hidden_size": 64, "intermediate_size": 96,
                "num_hidden_layers": 3, "num_attention_heads": 4, "max_position_embeddings": 64}"#,
        )
        .unwrap();
        let config = LlamaConfig::resolve(path.to_str().unwrap()).unwrap();
        assert_eq!(config.num_hidden_layers, 3);
        assert_eq!(config.num_kv_heads(), 4);
        assert_eq!(config.model_type, "llama");

        // a model directory resolves through its config.json
        let config = LlamaConfig::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.hidden_size, 64);
        let empty = tempfile::tempdir().unwrap();
        assert!(LlamaConfig::resolve(empty.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn sequences_beyond_max_positions_run() {
        let config = tiny_config().with_positions_for(48);
        assert_eq!(config.max_position_embeddings, 48);
        assert_eq!(config.num_parameters(), tiny_config().num_parameters());
        assert_eq!(tiny_config().with_positions_for(8).max_position_embeddings, 32);

        let (model, _) = materialize(&config, &Device::Cpu, DType::F32).unwrap();
        let ids: Vec<u32> = (0..48).map(|i| (i * 5 % 64) as u32).collect();
        let input_ids = Tensor::from_vec(ids, (1, 48), &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 48), DType::U32, &Device::Cpu).unwrap();
        let logits = model.forward(&input_ids, &mask).unwrap();
        assert_eq!(logits.dims(), &[1, 48, 64]);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = LlamaConfig { num_attention_heads: 5, ..tiny_config() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn lazy_init_defers_materialization() {
        let init = ModelInit::new(LlamaConfig::llama_70b(), true, &Device::Cpu, DType::F32).unwrap();
        assert!(init.is_lazy());
        assert_eq!(init.config().num_hidden_layers, 80);
    }
}
