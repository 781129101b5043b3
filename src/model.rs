//! GPT-2 Model Architecture
//!
//! Inference-only GPT-2 running directly on a lazily parsed checkpoint tree.
//! The model never holds its weights: every layer keeps [`LazyTensor`]
//! handles and reads each weight from the checkpoint when a forward pass
//! needs it. Peak memory is one layer's weights plus activations.
//!
//! ## Architecture Overview
//!
//! ```text
//! Input tokens [seq]
//!     ↓
//! wte[ids] + wpe[0..seq]          [seq, n_embd]
//!     ↓
//! Block 1: x + mha(ln_1(x)), then x + mlp(ln_2(x))
//!     ↓
//!     ...
//!     ↓
//! Block N
//!     ↓
//! ln_f
//!     ↓
//! @ wteᵀ                          [seq, n_vocab]
//! ```
//!
//! The output projection reuses the token embedding (weight tying), so the
//! checkpoint has no separate `lm_head`.
//!
//! ## Checkpoint Layout
//!
//! ```text
//! wte, wpe                     tensors
//! ln_f { g, b }
//! blocks [n_layer] {
//!     ln_1 { g, b }   attn { c_attn { w, b }, c_proj { w, b } }
//!     ln_2 { g, b }   mlp  { c_fc   { w, b }, c_proj { w, b } }
//! }
//! ```
//!
//! [`GPT2::new`] checks this layout and every declared shape up front, so a
//! forward pass can only fail on I/O or on a payload that disagrees with its
//! own header.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gpt2_lazy::{GPT2, ModelFiles};
//!
//! let files = ModelFiles::new("models", "124M");
//! let model = GPT2::load(&files)?;
//! let logits = model.forward(&[15496, 11, 995])?;
//! assert_eq!(logits.shape, vec![3, model.hparams().n_vocab]);
//! # Ok::<(), gpt2_lazy::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::msgpack::read_checkpoint;
use crate::tensor::Tensor;
use crate::value::{Entry, LazyTensor, Map, Thunk, Value};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Layer norm epsilon used by every GPT-2 release
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Added to attention scores of future positions
const MASK_VALUE: f32 = -1e10;

/// Model hyperparameters, as stored in `hparams.json`
///
/// # Fields
///
/// - `n_vocab`: Number of tokens in vocabulary
/// - `n_ctx`: Maximum sequence length (context window)
/// - `n_embd`: Embedding dimension (width of the model)
/// - `n_head`: Number of attention heads per layer
/// - `n_layer`: Number of transformer blocks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HParams {
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
}

impl Default for HParams {
    /// The 124M release
    fn default() -> Self {
        Self {
            n_vocab: 50257,
            n_ctx: 1024,
            n_embd: 768,
            n_head: 12,
            n_layer: 12,
        }
    }
}

impl HParams {
    /// Read and validate `hparams.json`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let hparams: Self = serde_json::from_str(&text).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        hparams.validate()?;

        log::debug!("loaded {}: {:?}", path.display(), hparams);
        Ok(hparams)
    }

    /// Check that the values describe a runnable model
    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(Error::HParams(format!(
                "n_embd ({}) must be a positive multiple of n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.n_vocab == 0 || self.n_ctx == 0 || self.n_embd == 0 {
            return Err(Error::HParams(format!(
                "n_vocab, n_ctx and n_embd must be non-zero: {self:?}"
            )));
        }
        Ok(())
    }

    /// Width of one attention head
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// The files that make up one released model
///
/// Models are laid out as `<models_dir>/<variant>/` containing
/// `hparams.json`, `encoder.json`, `vocab.bpe` and `<variant>.msgpack`.
#[derive(Clone, Debug)]
pub struct ModelFiles {
    pub dir: PathBuf,
    pub hparams: PathBuf,
    pub encoder: PathBuf,
    pub merges: PathBuf,
    pub checkpoint: PathBuf,
}

impl ModelFiles {
    /// # Arguments
    ///
    /// * `models_dir` - Directory holding one sub-directory per variant
    /// * `variant` - Model size, e.g. `"124M"`
    pub fn new<P: AsRef<Path>>(models_dir: P, variant: &str) -> Self {
        let dir = models_dir.as_ref().join(variant);
        Self {
            hparams: dir.join("hparams.json"),
            encoder: dir.join("encoder.json"),
            merges: dir.join("vocab.bpe"),
            checkpoint: dir.join(format!("{variant}.msgpack")),
            dir,
        }
    }
}

//
// ============================================================================
// CHECKPOINT LOOKUP
// ============================================================================
//

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn child<'a>(map: &'a Map, path: &str, key: &str) -> Result<&'a Entry> {
    map.entry(key)
        .ok_or_else(|| Error::checkpoint(join(path, key), "missing"))
}

fn child_map<'a>(map: &'a Map, path: &str, key: &str) -> Result<&'a Map> {
    match child(map, path, key)? {
        Entry::Resolved(Value::Map(inner)) => Ok(inner),
        other => Err(Error::checkpoint(
            join(path, key),
            format!("expected a map, found {}", entry_kind(other)),
        )),
    }
}

fn entry_kind(entry: &Entry) -> &'static str {
    match entry {
        Entry::Resolved(value) => value.kind(),
        Entry::Deferred(Thunk::Blob(_)) => "deferred binary",
        Entry::Deferred(Thunk::Tensor(_)) => "deferred tensor",
    }
}

/// A weight in the checkpoint, read on every use
#[derive(Clone, Debug)]
pub struct Weight {
    path: String,
    tensor: LazyTensor,
}

impl Weight {
    fn lookup(map: &Map, path: &str, key: &str, expected: &[Option<usize>]) -> Result<Self> {
        let path = join(path, key);
        let entry = map
            .entry(key)
            .ok_or_else(|| Error::checkpoint(&path, "missing"))?;
        let tensor = match entry {
            Entry::Deferred(Thunk::Tensor(tensor)) => tensor.clone(),
            other => {
                return Err(Error::checkpoint(
                    path,
                    format!("expected a tensor, found {}", entry_kind(other)),
                ))
            }
        };

        let shape = tensor.shape();
        let matches = shape.len() == expected.len()
            && shape
                .iter()
                .zip(expected)
                .all(|(&dim, want)| want.map_or(true, |w| w == dim));
        if !matches {
            let want: Vec<String> = expected
                .iter()
                .map(|d| d.map_or("_".to_string(), |d| d.to_string()))
                .collect();
            return Err(Error::checkpoint(
                path,
                format!("expected shape [{}], found {:?}", want.join(", "), shape),
            ));
        }

        Ok(Self { path, tensor })
    }

    /// Read the weight from the checkpoint
    pub fn load(&self) -> Result<Tensor> {
        log::trace!("reading {} {:?}", self.path, self.tensor.shape());
        self.tensor.resolve()
    }

    /// Dotted path inside the checkpoint, e.g. `blocks.3.attn.c_proj.w`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub fn numel(&self) -> usize {
        self.tensor.numel()
    }
}

//
// ============================================================================
// ACTIVATION FUNCTIONS
// ============================================================================
//

/// GELU (Gaussian Error Linear Unit) activation
///
/// Uses the tanh approximation GPT-2 was trained with:
///
/// ```text
/// GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
/// ```
pub fn gelu(x: &Tensor) -> Tensor {
    let sqrt_2_over_pi = (2.0_f32 / std::f32::consts::PI).sqrt();
    let coeff = 0.044715_f32;

    x.map(|val| {
        let inner = sqrt_2_over_pi * (val + coeff * val * val * val);
        0.5 * val * (1.0 + inner.tanh())
    })
}

//
// ============================================================================
// LAYER NORMALIZATION
// ============================================================================
//

/// Layer normalization over the feature axis
///
/// ```text
/// output = (input - mean) / sqrt(variance + eps) × g + b
/// ```
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub g: Weight,
    pub b: Weight,
}

impl LayerNorm {
    fn lookup(map: &Map, path: &str, key: &str, n_embd: usize) -> Result<Self> {
        let inner = child_map(map, path, key)?;
        let path = join(path, key);
        Ok(Self {
            g: Weight::lookup(inner, &path, "g", &[Some(n_embd)])?,
            b: Weight::lookup(inner, &path, "b", &[Some(n_embd)])?,
        })
    }

    /// # Arguments
    ///
    /// * `x` - Activations `[seq, n_embd]`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean();
        let variance = x.var();
        let cols = x.shape[1];

        let normalized: Vec<f32> = x
            .data
            .par_chunks(cols)
            .zip(mean.data.par_iter().zip(&variance.data))
            .flat_map_iter(|(row, (&mu, &var))| {
                let inv_std = 1.0 / (var + LAYER_NORM_EPS).sqrt();
                row.iter().map(move |&v| (v - mu) * inv_std)
            })
            .collect();
        let normalized = Tensor::new(normalized, x.shape.clone());

        Ok(normalized.mul(&self.g.load()?).add(&self.b.load()?))
    }
}

//
// ============================================================================
// LINEAR LAYER
// ============================================================================
//

/// Affine projection `x @ w + b`, with `w` stored as `[in, out]`
#[derive(Clone, Debug)]
pub struct Linear {
    pub w: Weight,
    pub b: Weight,
}

impl Linear {
    fn lookup(
        map: &Map,
        path: &str,
        key: &str,
        in_features: usize,
        out_features: Option<usize>,
    ) -> Result<Self> {
        let inner = child_map(map, path, key)?;
        let path = join(path, key);
        let w = Weight::lookup(inner, &path, "w", &[Some(in_features), out_features])?;
        let out = w.shape()[1];
        let b = Weight::lookup(inner, &path, "b", &[Some(out)])?;
        Ok(Self { w, b })
    }

    pub fn out_features(&self) -> usize {
        self.w.shape()[1]
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.matmul(&self.w.load()?).add(&self.b.load()?))
    }
}

//
// ============================================================================
// ATTENTION MECHANISM
// ============================================================================
//

/// Multi-head causal self-attention
///
/// # Architecture
///
/// 1. **Projection**: `c_attn` produces Q, K and V side by side `[seq, 3·n_embd]`
/// 2. **Split**: into Q, K, V, then each into `n_head` column blocks
/// 3. **Per head**: `softmax(mask(Q Kᵀ / √head_dim)) V`
/// 4. **Merge**: heads concatenated back to `[seq, n_embd]`
/// 5. **Output projection**: `c_proj`
///
/// Position `i` may not attend to positions after `i`; their scores are
/// pushed to `-1e10` before the softmax.
#[derive(Clone, Debug)]
pub struct Attention {
    pub c_attn: Linear,
    pub c_proj: Linear,
    pub n_head: usize,
}

impl Attention {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.shape[0];

        let qkv = self.c_attn.forward(x)?.split_cols(3);
        let q = qkv[0].split_cols(self.n_head);
        let k = qkv[1].split_cols(self.n_head);
        let v = qkv[2].split_cols(self.n_head);

        let mask = causal_mask(seq_len);
        let heads: Vec<Tensor> = (0..self.n_head)
            .into_par_iter()
            .map(|h| attend(&q[h], &k[h], &v[h], &mask))
            .collect();

        self.c_proj.forward(&Tensor::concat_cols(&heads))
    }
}

/// Scaled dot-product attention for one head
fn attend(q: &Tensor, k: &Tensor, v: &Tensor, mask: &Tensor) -> Tensor {
    let scale = 1.0 / (q.shape[1] as f32).sqrt();
    q.matmul(&k.transpose())
        .mul_scalar(scale)
        .masked_fill(mask, MASK_VALUE)
        .softmax()
        .matmul(v)
}

/// `[seq, seq]` with 1.0 above the diagonal (future positions)
fn causal_mask(seq_len: usize) -> Tensor {
    let mut data = vec![0.0; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            data[i * seq_len + j] = 1.0;
        }
    }
    Tensor::new(data, vec![seq_len, seq_len])
}

//
// ============================================================================
// FEEDFORWARD AND BLOCK
// ============================================================================
//

/// Position-wise feedforward: project up, GELU, project back down
#[derive(Clone, Debug)]
pub struct MLP {
    pub c_fc: Linear,
    pub c_proj: Linear,
}

impl MLP {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = gelu(&self.c_fc.forward(x)?);
        self.c_proj.forward(&hidden)
    }
}

/// One transformer block with pre-norm residual connections
#[derive(Clone, Debug)]
pub struct Block {
    pub ln_1: LayerNorm,
    pub attn: Attention,
    pub ln_2: LayerNorm,
    pub mlp: MLP,
}

impl Block {
    fn lookup(block: &Map, path: &str, hparams: &HParams) -> Result<Self> {
        let n_embd = hparams.n_embd;

        let attn = child_map(block, path, "attn")?;
        let attn_path = join(path, "attn");
        let mlp = child_map(block, path, "mlp")?;
        let mlp_path = join(path, "mlp");

        let c_fc = Linear::lookup(mlp, &mlp_path, "c_fc", n_embd, None)?;
        let hidden = c_fc.out_features();

        Ok(Self {
            ln_1: LayerNorm::lookup(block, path, "ln_1", n_embd)?,
            attn: Attention {
                c_attn: Linear::lookup(attn, &attn_path, "c_attn", n_embd, Some(3 * n_embd))?,
                c_proj: Linear::lookup(attn, &attn_path, "c_proj", n_embd, Some(n_embd))?,
                n_head: hparams.n_head,
            },
            ln_2: LayerNorm::lookup(block, path, "ln_2", n_embd)?,
            mlp: MLP {
                c_fc,
                c_proj: Linear::lookup(mlp, &mlp_path, "c_proj", hidden, Some(n_embd))?,
            },
        })
    }

    /// `x + mha(ln_1(x))`, then `x + mlp(ln_2(x))`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.add(&self.attn.forward(&self.ln_1.forward(x)?)?);
        let ffn = self.mlp.forward(&self.ln_2.forward(&x)?)?;
        Ok(x.add(&ffn))
    }
}

//
// ============================================================================
// GPT-2 MODEL
// ============================================================================
//

/// GPT-2 over a lazily loaded checkpoint
pub struct GPT2 {
    hparams: HParams,
    wte: Weight,
    wpe: Weight,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
}

impl GPT2 {
    /// Bind a parsed checkpoint tree to the model
    ///
    /// Walks the tree once, checking every key the forward pass will need
    /// and every tensor's declared shape against `hparams`. No weight is
    /// read.
    ///
    /// # Arguments
    ///
    /// * `tree` - Root value returned by the checkpoint reader
    /// * `hparams` - Hyperparameters for this checkpoint
    ///
    /// # Returns
    ///
    /// The model, or [`Error::Checkpoint`] naming the first offending path
    pub fn new(tree: &Value, hparams: HParams) -> Result<Self> {
        hparams.validate()?;
        let root = tree
            .as_map()
            .ok_or_else(|| Error::checkpoint("<root>", format!("expected a map, found {}", tree.kind())))?;
        let n_embd = hparams.n_embd;

        let wte = Weight::lookup(root, "", "wte", &[Some(hparams.n_vocab), Some(n_embd)])?;
        let wpe = Weight::lookup(root, "", "wpe", &[None, Some(n_embd)])?;
        if wpe.shape()[0] < hparams.n_ctx {
            return Err(Error::checkpoint(
                "wpe",
                format!("{} positions but n_ctx is {}", wpe.shape()[0], hparams.n_ctx),
            ));
        }
        let ln_f = LayerNorm::lookup(root, "", "ln_f", n_embd)?;

        let blocks = match child(root, "", "blocks")? {
            Entry::Resolved(Value::Array(items)) => items,
            other => {
                return Err(Error::checkpoint(
                    "blocks",
                    format!("expected an array, found {}", entry_kind(other)),
                ))
            }
        };
        if blocks.len() != hparams.n_layer {
            return Err(Error::checkpoint(
                "blocks",
                format!("{} blocks but n_layer is {}", blocks.len(), hparams.n_layer),
            ));
        }
        let blocks = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let path = format!("blocks.{i}");
                let map = block.as_map().ok_or_else(|| {
                    Error::checkpoint(&path, format!("expected a map, found {}", block.kind()))
                })?;
                Block::lookup(map, &path, &hparams)
            })
            .collect::<Result<Vec<_>>>()?;

        let model = Self {
            hparams,
            wte,
            wpe,
            blocks,
            ln_f,
        };
        log::info!(
            "GPT-2 bound: {} layers, {} heads, {:.1}M parameters",
            model.hparams.n_layer,
            model.hparams.n_head,
            model.count_parameters() as f64 / 1e6
        );
        Ok(model)
    }

    /// Load hyperparameters and checkpoint from a model directory
    pub fn load(files: &ModelFiles) -> Result<Self> {
        let hparams = HParams::load(&files.hparams)?;
        let tree = read_checkpoint(&files.checkpoint)?;
        Self::new(&tree, hparams)
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    /// Forward pass: tokens → logits
    ///
    /// # Arguments
    ///
    /// * `token_ids` - Input sequence, at most `n_ctx` ids below `n_vocab`
    ///
    /// # Returns
    ///
    /// Logits over the vocabulary for every position: `[seq, n_vocab]`
    pub fn forward(&self, token_ids: &[usize]) -> Result<Tensor> {
        let seq_len = token_ids.len();
        if seq_len == 0 {
            return Err(Error::EmptyPrompt);
        }
        if seq_len > self.hparams.n_ctx {
            return Err(Error::PromptTooLong {
                len: seq_len,
                n_ctx: self.hparams.n_ctx,
            });
        }
        if let Some(&id) = token_ids.iter().find(|&&id| id >= self.hparams.n_vocab) {
            return Err(Error::TokenOutOfRange {
                id,
                n_vocab: self.hparams.n_vocab,
            });
        }

        // === 1. Token and position embeddings ===
        let wte = self.wte.load()?;
        let mut x = wte
            .gather_rows(token_ids)
            .add(&self.wpe.load()?.slice_rows(0, seq_len));

        // === 2. Transformer blocks ===
        for block in &self.blocks {
            x = block.forward(&x)?;
        }

        // === 3. Final layer norm and tied projection to vocabulary ===
        x = self.ln_f.forward(&x)?;
        Ok(x.matmul(&wte.transpose()))
    }

    /// Total number of parameters, from declared shapes only
    pub fn count_parameters(&self) -> usize {
        let linear = |l: &Linear| l.w.numel() + l.b.numel();
        let norm = |n: &LayerNorm| n.g.numel() + n.b.numel();

        let blocks: usize = self
            .blocks
            .iter()
            .map(|block| {
                norm(&block.ln_1)
                    + linear(&block.attn.c_attn)
                    + linear(&block.attn.c_proj)
                    + norm(&block.ln_2)
                    + linear(&block.mlp.c_fc)
                    + linear(&block.mlp.c_proj)
            })
            .sum();

        self.wte.numel() + self.wpe.numel() + norm(&self.ln_f) + blocks
    }
}

/// Tiny synthetic checkpoints for tests
#[cfg(test)]
pub(crate) mod testutil {
    use super::HParams;
    use crate::msgpack::testutil::Writer;

    pub fn tiny_hparams() -> HParams {
        HParams {
            n_vocab: 5,
            n_ctx: 4,
            n_embd: 4,
            n_head: 2,
            n_layer: 1,
        }
    }

    fn ramp(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| ((i % 7) as f32 - 3.0) * scale).collect()
    }

    fn norm(w: &mut Writer, key: &str, n: usize) {
        w.str(key).map(2);
        w.str("g").tensor(&[n], &vec![1.0; n]);
        w.str("b").tensor(&[n], &vec![0.0; n]);
    }

    fn linear(w: &mut Writer, key: &str, i: usize, o: usize) {
        w.str(key).map(2);
        w.str("w").tensor(&[i, o], &ramp(i * o, 0.05));
        w.str("b").tensor(&[o], &vec![0.01; o]);
    }

    /// Serialized checkpoint matching [`tiny_hparams`]
    ///
    /// Token `t`'s embedding is one-hot-ish so the model has a clear
    /// preference for some tokens over others.
    pub fn tiny_checkpoint(hp: &HParams) -> Vec<u8> {
        let d = hp.n_embd;
        let mut w = Writer::new();
        w.map(4);

        let wte: Vec<f32> = (0..hp.n_vocab * d)
            .map(|i| if i / d == i % d { 1.0 } else { 0.1 * (i % 3) as f32 })
            .collect();
        w.str("wte").tensor(&[hp.n_vocab, d], &wte);
        w.str("wpe").tensor(&[hp.n_ctx, d], &ramp(hp.n_ctx * d, 0.01));

        w.str("blocks").array(hp.n_layer);
        for _ in 0..hp.n_layer {
            w.map(4);
            norm(&mut w, "ln_1", d);
            w.str("attn").map(2);
            linear(&mut w, "c_attn", d, 3 * d);
            linear(&mut w, "c_proj", d, d);
            norm(&mut w, "ln_2", d);
            w.str("mlp").map(2);
            linear(&mut w, "c_fc", d, 4 * d);
            linear(&mut w, "c_proj", 4 * d, d);
        }

        norm(&mut w, "ln_f", d);
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{tiny_checkpoint, tiny_hparams};
    use super::*;
    use crate::msgpack::testutil::Writer;
    use crate::msgpack::LazyReader;
    use crate::source::ByteSource;

    fn parse(bytes: Vec<u8>) -> Value {
        LazyReader::new(ByteSource::from_bytes(bytes)).parse().unwrap()
    }

    fn tiny_model() -> GPT2 {
        let hp = tiny_hparams();
        GPT2::new(&parse(tiny_checkpoint(&hp)), hp).unwrap()
    }

    #[test]
    fn test_hparams_validation() {
        assert!(HParams::default().validate().is_ok());
        assert_eq!(HParams::default().head_dim(), 64);

        let bad = HParams {
            n_head: 5,
            ..HParams::default()
        };
        assert!(matches!(bad.validate(), Err(Error::HParams(_))));
    }

    #[test]
    fn test_hparams_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        fs::write(
            &path,
            r#"{"n_vocab": 50257, "n_ctx": 1024, "n_embd": 768, "n_head": 12, "n_layer": 12}"#,
        )
        .unwrap();
        assert_eq!(HParams::load(&path).unwrap(), HParams::default());

        fs::write(&path, r#"{"n_vocab": 10}"#).unwrap();
        assert!(matches!(HParams::load(&path), Err(Error::Json { .. })));
    }

    #[test]
    fn test_model_files_layout() {
        let files = ModelFiles::new("models", "355M");
        assert_eq!(files.dir, Path::new("models/355M"));
        assert_eq!(files.hparams, Path::new("models/355M/hparams.json"));
        assert_eq!(files.encoder, Path::new("models/355M/encoder.json"));
        assert_eq!(files.merges, Path::new("models/355M/vocab.bpe"));
        assert_eq!(files.checkpoint, Path::new("models/355M/355M.msgpack"));
    }

    #[test]
    fn test_gelu_reference_points() {
        let x = Tensor::new(vec![0.0, 1.0, -1.0, 3.0], vec![4]);
        let y = gelu(&x);
        assert_eq!(y.data[0], 0.0);
        assert!((y.data[1] - 0.8412).abs() < 1e-3);
        assert!((y.data[2] + 0.1588).abs() < 1e-3);
        assert!((y.data[3] - 2.9964).abs() < 1e-3);
    }

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(3);
        assert_eq!(mask.data, vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_attention_first_position_sees_only_itself() {
        let q = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
        let v = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        let out = attend(&q, &q, &v, &causal_mask(2));
        assert_eq!(out.row(0), &[5.0, 6.0]);
    }

    #[test]
    fn test_forward_shape_and_determinism() {
        let model = tiny_model();
        assert_eq!(model.count_parameters(), 5 * 4 + 4 * 4 + 8 + (8 + 60 + 20 + 8 + 80 + 68));

        let logits = model.forward(&[0, 3, 1]).unwrap();
        assert_eq!(logits.shape, vec![3, 5]);
        assert!(logits.data.iter().all(|v| v.is_finite()));
        assert_eq!(model.forward(&[0, 3, 1]).unwrap(), logits);
    }

    #[test]
    fn test_forward_is_causal() {
        let model = tiny_model();
        let short = model.forward(&[2, 4]).unwrap();
        let long = model.forward(&[2, 4, 1, 0]).unwrap();
        for (a, b) in short.data.iter().zip(&long.data[..short.data.len()]) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_rejects_bad_input() {
        let model = tiny_model();
        assert!(matches!(model.forward(&[]), Err(Error::EmptyPrompt)));
        assert!(matches!(
            model.forward(&[0, 1, 2, 3, 4]),
            Err(Error::PromptTooLong { len: 5, n_ctx: 4 })
        ));
        assert!(matches!(
            model.forward(&[0, 5]),
            Err(Error::TokenOutOfRange { id: 5, n_vocab: 5 })
        ));
    }

    #[test]
    fn test_missing_key_names_path() {
        let hp = tiny_hparams();
        let mut w = Writer::new();
        w.map(1).str("wte").tensor(&[5, 4], &[0.0; 20]);
        let err = GPT2::new(&parse(w.finish()), hp).err().unwrap();
        match err {
            Error::Checkpoint { path, .. } => assert_eq!(path, "wpe"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let hp = HParams {
            n_vocab: 6,
            ..tiny_hparams()
        };
        let err = GPT2::new(&parse(tiny_checkpoint(&tiny_hparams())), hp)
            .err()
            .unwrap();
        match err {
            Error::Checkpoint { path, reason } => {
                assert_eq!(path, "wte");
                assert!(reason.contains("expected shape"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_layer_count_mismatch() {
        let hp = HParams {
            n_layer: 2,
            ..tiny_hparams()
        };
        let err = GPT2::new(&parse(tiny_checkpoint(&tiny_hparams())), hp)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Checkpoint { ref path, .. } if path == "blocks"));
    }

    #[test]
    fn test_load_from_model_directory() {
        let dir = tempfile::tempdir().unwrap();
        let files = ModelFiles::new(dir.path(), "tiny");
        fs::create_dir_all(&files.dir).unwrap();
        fs::write(&files.hparams, serde_json::to_string(&tiny_hparams()).unwrap()).unwrap();
        fs::write(&files.checkpoint, tiny_checkpoint(&tiny_hparams())).unwrap();

        let model = GPT2::load(&files).unwrap();
        assert_eq!(model.forward(&[1]).unwrap().shape, vec![1, 5]);
    }
}
