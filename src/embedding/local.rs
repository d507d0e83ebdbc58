//! Local ONNX Runtime embedding provider.
//!
//! all-MiniLM-L6-v2 via `ort`: tokenize, run the encoder, mean-pool token embeddings under
//! the attention mask, then L2-normalize.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, ArrayView3, Axis};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// all-MiniLM-L6-v2 was trained at 256 tokens.
const MAX_SEQ_LEN: usize = 256;

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

/// Token ids and attention mask for one padded batch, row-major `[batch, seq]`.
struct Batch {
    ids: Vec<i64>,
    mask: Vec<i64>,
    size: usize,
    seq_len: usize,
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_path, tokenizer_path) = model_files(config)?;

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;
        tracing::info!(model = %config.model, path = %model_path.display(), "embedding model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    fn tokenize(&self, texts: &[&str]) -> Result<Batch> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let size = encodings.len();
        let seq_len = encodings.first().map_or(0, |e| e.get_ids().len());
        let mut ids = Vec::with_capacity(size * seq_len);
        let mut mask = Vec::with_capacity(size * seq_len);
        for encoding in &encodings {
            ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }
        Ok(Batch {
            ids,
            mask,
            size,
            seq_len,
        })
    }
}

fn model_files(config: &EmbeddingConfig) -> Result<(PathBuf, PathBuf)> {
    let cache_dir = crate::config::expand_tilde(&config.cache_dir);
    let model_path = cache_dir.join("model.onnx");
    let tokenizer_path = cache_dir.join("tokenizer.json");

    anyhow::ensure!(
        model_path.exists(),
        "embedding model not found at {}. Run `worldline model download` first.",
        model_path.display()
    );
    anyhow::ensure!(
        tokenizer_path.exists(),
        "tokenizer not found at {}. Run `worldline model download` first.",
        tokenizer_path.display()
    );
    Ok((model_path, tokenizer_path))
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .context("embedding batch came back empty")
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let batch = self.tokenize(texts)?;
        let shape = vec![batch.size as i64, batch.seq_len as i64];
        let input_ids = Tensor::from_array((shape.clone(), batch.ids.clone().into_boxed_slice()))?;
        let attention_mask =
            Tensor::from_array((shape.clone(), batch.mask.clone().into_boxed_slice()))?;
        // Single-segment input.
        let token_type_ids = Tensor::from_array((
            shape,
            vec![0i64; batch.size * batch.seq_len].into_boxed_slice(),
        ))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("embedding session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        })?;

        // Output naming differs between exports.
        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (dims, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;
        let dims: &[i64] = dims;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token embedding shape {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
        );

        let tokens = ArrayView3::from_shape(
            (dims[0] as usize, dims[1] as usize, dims[2] as usize),
            data,
        )
        .context("token embeddings do not match their shape")?;
        let mask = Array2::from_shape_vec((batch.size, batch.seq_len), batch.mask)
            .context("attention mask does not match batch shape")?
            .mapv(|m| m as f32);

        Ok(mean_pool(tokens, &mask)
            .outer_iter()
            .map(|row| l2_normalize(row.to_owned()).to_vec())
            .collect())
    }
}

/// Average each sequence's token vectors, counting only unmasked tokens.
fn mean_pool(tokens: ArrayView3<'_, f32>, mask: &Array2<f32>) -> Array2<f32> {
    let (batch, seq, hidden) = tokens.dim();
    let mut pooled = Array2::<f32>::zeros((batch, hidden));
    for (b, mut out) in pooled.axis_iter_mut(Axis(0)).enumerate() {
        let mut count = 0.0f32;
        for s in 0..seq.min(mask.ncols()) {
            let m = mask[[b, s]];
            if m > 0.0 {
                out.scaled_add(m, &tokens.slice(ndarray::s![b, s, ..]));
                count += m;
            }
        }
        if count > 0.0 {
            out /= count;
        }
    }
    pooled
}

/// Scale to unit length. A zero vector stays zero.
fn l2_normalize(v: Array1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v / norm
    } else {
        v
    }
}
