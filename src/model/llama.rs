//! Llama-family causal language model.
//!
//! A thin model graph over candle: embedding, RMSNorm, rotary attention with
//! LoRA-capable projections, SwiGLU MLP, and an LM head. Weights load from
//! the standard pretrained directory layout, so the same graph serves
//! training (cache-free forward), adapter merging, and generation (KV cache).

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use serde::Deserialize;
use std::collections::HashMap;

use super::lora::{LoraHyperparams, LoraLinear};

/// Model hyperparameters, deserialized from the artifact's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    pub eos_token_id: Option<EosTokens>,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

/// `config.json` carries either a single EOS id or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EosTokens {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokens {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            Self::Single(id) => vec![*id],
            Self::Multiple(ids) => ids.clone(),
        }
    }
}

impl ModelConfig {
    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads
            .unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn eos_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(EosTokens::ids)
            .unwrap_or_default()
    }
}

/// Per-layer key/value cache for incremental decoding.
pub struct KvCache {
    enabled: bool,
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            enabled: true,
            layers: vec![None; num_layers],
        }
    }

    /// Cache-free mode, used by the training forward.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            layers: Vec::new(),
        }
    }

    pub fn past_len(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        self.layers
            .first()
            .and_then(|entry| entry.as_ref())
            .map_or(0, |(k, _)| k.dims()[2])
    }

    fn entry_mut(&mut self, idx: usize) -> Option<&mut Option<(Tensor, Tensor)>> {
        if self.enabled {
            self.layers.get_mut(idx)
        } else {
            None
        }
    }
}

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Normalize in F32, scale in the model dtype.
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(x.to_dtype(dtype)?.broadcast_mul(&self.weight)?)
    }

    fn weight(&self) -> &Tensor {
        &self.weight
    }
}

/// Attention projection: plain, or wrapped with a trainable low-rank bypass.
enum Projection {
    Plain(Linear),
    Lora(LoraLinear),
}

impl Projection {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Plain(linear) => linear.forward(x),
            Self::Lora(lora) => lora.forward(x),
        }
    }

    fn weight(&self) -> &Tensor {
        match self {
            Self::Plain(linear) => linear.weight(),
            Self::Lora(lora) => lora.weight(),
        }
    }

    fn merge(&mut self) -> Result<()> {
        if let Self::Lora(lora) = self {
            lora.merge()?;
        }
        Ok(())
    }

    fn num_adapter_parameters(&self) -> usize {
        match self {
            Self::Plain(_) => 0,
            Self::Lora(lora) => lora.num_adapter_parameters(),
        }
    }
}

struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(cfg: &ModelConfig, dtype: DType, device: &Device) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let theta = cfg.rope_theta as f32;
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let positions = Tensor::arange(0u32, cfg.max_position_embeddings as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((cfg.max_position_embeddings, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, index_pos: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, index_pos, seq_len)?;
        let sin = self.sin.narrow(0, index_pos, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

struct Attention {
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(
        vb: VarBuilder,
        lora: Option<(&LoraHyperparams, VarBuilder)>,
        cfg: &ModelConfig,
    ) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let q_size = cfg.num_attention_heads * head_dim;
        let kv_size = cfg.kv_heads() * head_dim;
        Ok(Self {
            q_proj: Self::projection(cfg.hidden_size, q_size, "q_proj", &vb, &lora)?,
            k_proj: Self::projection(cfg.hidden_size, kv_size, "k_proj", &vb, &lora)?,
            v_proj: Self::projection(cfg.hidden_size, kv_size, "v_proj", &vb, &lora)?,
            o_proj: Self::projection(q_size, cfg.hidden_size, "o_proj", &vb, &lora)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.kv_heads(),
            head_dim,
        })
    }

    fn projection(
        in_dim: usize,
        out_dim: usize,
        name: &str,
        vb: &VarBuilder,
        lora: &Option<(&LoraHyperparams, VarBuilder)>,
    ) -> Result<Projection> {
        let base = linear_no_bias(in_dim, out_dim, vb.pp(name))?;
        match lora {
            Some((hp, lora_vb)) if hp.targets(name) => Ok(Projection::Lora(LoraLinear::new(
                base,
                in_dim,
                out_dim,
                hp,
                lora_vb.pp(name),
            )?)),
            _ => Ok(Projection::Plain(base)),
        }
    }

    fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        index_pos: usize,
        kv_entry: Option<&mut Option<(Tensor, Tensor)>>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rope.apply(&q, &k, index_pos)?;

        let (k, v) = if let Some(entry) = kv_entry {
            let (k, v) = match entry.take() {
                Some((past_k, past_v)) => (
                    Tensor::cat(&[&past_k, &k], 2)?,
                    Tensor::cat(&[&past_v, &v], 2)?,
                ),
                None => (k, v),
            };
            *entry = Some((k.clone(), v.clone()));
            (k, v)
        } else {
            (k, v)
        };

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let att = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let att = match mask {
            Some(mask) => att.broadcast_add(mask)?,
            None => att,
        };
        let att = candle_nn::ops::softmax_last_dim(&att.to_dtype(DType::F32)?)?.to_dtype(v.dtype())?;

        let out = att
            .matmul(&v.contiguous()?)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }

    fn merge(&mut self) -> Result<()> {
        self.q_proj.merge()?;
        self.k_proj.merge()?;
        self.v_proj.merge()?;
        self.o_proj.merge()?;
        Ok(())
    }

    fn num_adapter_parameters(&self) -> usize {
        self.q_proj.num_adapter_parameters()
            + self.k_proj.num_adapter_parameters()
            + self.v_proj.num_adapter_parameters()
            + self.o_proj.num_adapter_parameters()
    }
}

/// Grouped-query attention: repeat each KV head to cover its query group.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    Ok(candle_transformers::utils::repeat_kv(x, n_rep)?)
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, cfg: &ModelConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(cfg.intermediate_size, cfg.hidden_size, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    input_layernorm: RmsNorm,
    attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn load(
        vb: VarBuilder,
        lora: Option<(&LoraHyperparams, VarBuilder)>,
        cfg: &ModelConfig,
    ) -> Result<Self> {
        Ok(Self {
            input_layernorm: RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            attn: Attention::load(vb.pp("self_attn"), lora, cfg)?,
            post_attention_layernorm: RmsNorm::load(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(vb.pp("mlp"), cfg)?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        index_pos: usize,
        kv_entry: Option<&mut Option<(Tensor, Tensor)>>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(x)?;
        let x = (x + self.attn.forward(&normed, rope, index_pos, kv_entry, mask)?)?;
        let normed = self.post_attention_layernorm.forward(&x)?;
        Ok((&x + self.mlp.forward(&normed)?)?)
    }
}

/// The full causal LM.
pub struct LlamaModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    config: ModelConfig,
    device: Device,
    dtype: DType,
}

impl LlamaModel {
    /// Build the graph from a weight source. When `lora` is given, the
    /// targeted attention projections are wrapped with adapter matrices
    /// resolved from the second builder (fresh vars for training, saved
    /// tensors for a loaded adapter).
    pub fn load(
        vb: VarBuilder,
        config: &ModelConfig,
        lora: Option<(&LoraHyperparams, VarBuilder)>,
    ) -> Result<Self> {
        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("model.embed_tokens"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let layer_lora = lora
                .as_ref()
                .map(|(hp, lvb)| (*hp, lvb.pp(format!("base_model.model.model.layers.{idx}.self_attn"))));
            layers.push(DecoderLayer::load(
                vb.pp(format!("model.layers.{idx}")),
                layer_lora,
                config,
            )?);
        }
        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let rope = RotaryEmbedding::new(config, dtype, &device)?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            config: config.clone(),
            device,
            dtype,
        })
    }

    /// Logits for every input position, shape `(batch, seq_len, vocab)`.
    pub fn forward(&self, input_ids: &Tensor, index_pos: usize, cache: &mut KvCache) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let past = cache.past_len();
        let mask = if seq_len > 1 {
            Some(self.causal_mask(seq_len, past)?)
        } else {
            None
        };
        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for (idx, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rope, index_pos, cache.entry_mut(idx), mask.as_ref())?;
        }
        let hidden = self.norm.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    fn causal_mask(&self, seq_len: usize, past: usize) -> Result<Tensor> {
        let total = past + seq_len;
        let mut mask = vec![0f32; seq_len * total];
        for i in 0..seq_len {
            for j in 0..total {
                if j > past + i {
                    mask[i * total + j] = f32::NEG_INFINITY;
                }
            }
        }
        let mask = Tensor::from_slice(&mask, (seq_len, total), &self.device)?;
        Ok(mask.to_dtype(self.dtype)?)
    }

    /// Fold every attached adapter into the base weights.
    pub fn merge_adapter(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            layer.attn.merge()?;
        }
        Ok(())
    }

    pub fn num_adapter_parameters(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.attn.num_adapter_parameters())
            .sum()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current weights under their standard pretrained key names, for
    /// persisting a merged model.
    pub fn export_tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "model.embed_tokens.weight".to_string(),
            self.embed_tokens.embeddings().clone(),
        );
        for (idx, layer) in self.layers.iter().enumerate() {
            let prefix = format!("model.layers.{idx}");
            tensors.insert(
                format!("{prefix}.self_attn.q_proj.weight"),
                layer.attn.q_proj.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.self_attn.k_proj.weight"),
                layer.attn.k_proj.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.self_attn.v_proj.weight"),
                layer.attn.v_proj.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.self_attn.o_proj.weight"),
                layer.attn.o_proj.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.mlp.gate_proj.weight"),
                layer.mlp.gate_proj.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.mlp.up_proj.weight"),
                layer.mlp.up_proj.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.mlp.down_proj.weight"),
                layer.mlp.down_proj.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.input_layernorm.weight"),
                layer.input_layernorm.weight().clone(),
            );
            tensors.insert(
                format!("{prefix}.post_attention_layernorm.weight"),
                layer.post_attention_layernorm.weight().clone(),
            );
        }
        tensors.insert("model.norm.weight".to_string(), self.norm.weight().clone());
        if !self.config.tie_word_embeddings {
            tensors.insert("lm_head.weight".to_string(), self.lm_head.weight().clone());
        }
        tensors
    }
}
