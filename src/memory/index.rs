//! Flat nearest-neighbor index over turn embeddings, mirrored to a file.
//!
//! Rows are appended in insertion order and never removed, so a row number is a stable
//! reference. Every [`MemoryIndex::add`] rewrites the whole backing file before returning;
//! there is no batching. All matrix and file access happens under one mutex, so a search
//! waits behind an in-flight add. Embedding runs outside the lock.
//!
//! File layout: magic `WLVI`, `u32` format version, `u32` dimension, `u64` row count, then
//! `rows * dimension` little-endian `f32`.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, ensure, Context, Result};
use ndarray::{s, Array2, ArrayView1, Axis};

use crate::embedding::EmbeddingProvider;

const MAGIC: &[u8; 4] = b"WLVI";
const FORMAT_VERSION: u32 = 1;
/// Magic, version, dimension, row count.
const HEADER_LEN: u64 = 4 + 4 + 4 + 8;

/// What to search with.
#[derive(Debug, Clone, Copy)]
pub enum Query<'a> {
    Text(&'a str),
    Vector(&'a [f32]),
}

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Insertion index of the matched row.
    pub index: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

pub struct MemoryIndex {
    inner: Mutex<Inner>,
    provider: Arc<dyn EmbeddingProvider>,
}

struct Inner {
    vectors: Array2<f32>,
    path: PathBuf,
}

impl MemoryIndex {
    /// Load the index at `path`, or start an empty one sized for `provider`.
    pub fn open(path: impl Into<PathBuf>, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let path = path.into();
        let dim = provider.dimensions();
        let vectors = if path.exists() {
            let vectors = read_index(&path)?;
            ensure!(
                vectors.ncols() == dim,
                "index at {} has dimension {}, embedding provider produces {dim}",
                path.display(),
                vectors.ncols()
            );
            tracing::info!(path = %path.display(), entries = vectors.nrows(), "vector index loaded");
            vectors
        } else {
            tracing::info!(path = %path.display(), "no vector index yet, starting empty");
            Array2::zeros((0, dim))
        };

        Ok(Self {
            inner: Mutex::new(Inner { vectors, path }),
            provider,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("vector index lock poisoned: {e}"))
    }

    /// Embed `text`, append it, and persist. Returns the new row's index.
    pub fn add(&self, text: &str) -> Result<usize> {
        let vector = self.provider.embed(text).context("failed to embed text")?;
        self.add_vector(&vector)
    }

    /// Append a precomputed vector and persist. Returns the new row's index.
    pub fn add_vector(&self, vector: &[f32]) -> Result<usize> {
        let mut inner = self.lock()?;
        let dim = inner.vectors.ncols();
        ensure!(
            vector.len() == dim,
            "vector has {} dimensions, index expects {dim}",
            vector.len()
        );

        let index = inner.vectors.nrows();
        inner
            .vectors
            .push_row(ArrayView1::from(vector))
            .context("failed to append vector")?;

        if let Err(e) = write_index(&inner.path, &inner.vectors) {
            inner.vectors = inner.vectors.slice(s![..index, ..]).to_owned();
            return Err(e.context("vector not added: index file could not be written"));
        }

        tracing::debug!(index, "vector added");
        Ok(index)
    }

    /// Up to `min(k, len)` nearest rows by squared Euclidean distance, closest first.
    pub fn search(&self, query: Query<'_>, k: usize) -> Result<Vec<Neighbor>> {
        let embedded;
        let vector = match query {
            Query::Vector(v) => v,
            Query::Text(text) => {
                embedded = self.provider.embed(text).context("failed to embed query")?;
                embedded.as_slice()
            }
        };

        let inner = self.lock()?;
        let dim = inner.vectors.ncols();
        ensure!(
            vector.len() == dim,
            "query has {} dimensions, index expects {dim}",
            vector.len()
        );
        if k == 0 || inner.vectors.nrows() == 0 {
            return Ok(Vec::new());
        }

        let query = ArrayView1::from(vector);
        let distances = (&inner.vectors - &query)
            .mapv(|x| x * x)
            .sum_axis(Axis(1));

        let mut hits: Vec<Neighbor> = distances
            .iter()
            .enumerate()
            .map(|(index, &distance)| Neighbor { index, distance })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index)));
        hits.truncate(k);
        Ok(hits)
    }

    /// The stored vector for a row, if it exists.
    pub fn vector(&self, index: usize) -> Result<Option<Vec<f32>>> {
        let inner = self.lock()?;
        if index >= inner.vectors.nrows() {
            return Ok(None);
        }
        Ok(Some(inner.vectors.row(index).to_vec()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.vectors.nrows())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }
}

fn write_index(path: &Path, vectors: &Array2<f32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let file = std::fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    let mut w = BufWriter::new(file);

    w.write_all(MAGIC)?;
    w.write_all(&FORMAT_VERSION.to_le_bytes())?;
    w.write_all(&(vectors.ncols() as u32).to_le_bytes())?;
    w.write_all(&(vectors.nrows() as u64).to_le_bytes())?;
    for x in vectors.iter() {
        w.write_all(&x.to_le_bytes())?;
    }

    let file = w.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

fn read_index(path: &Path) -> Result<Array2<f32>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open vector index {}", path.display()))?;
    let file_len = file
        .metadata()
        .with_context(|| format!("failed to stat vector index {}", path.display()))?
        .len();
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).context("vector index header truncated")?;
    if &magic != MAGIC {
        bail!("{} is not a vector index file", path.display());
    }
    let version = read_u32(&mut r)?;
    ensure!(
        version == FORMAT_VERSION,
        "unsupported vector index format version {version}"
    );
    let dim = read_u32(&mut r)?;
    let rows = read_u64(&mut r)?;

    // The header must describe exactly the bytes on disk before anything is allocated.
    let expected = rows
        .checked_mul(u64::from(dim))
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(HEADER_LEN));
    if expected != Some(file_len) {
        bail!(
            "vector index {} is corrupt: header claims {rows} rows of dimension {dim}, file is {file_len} bytes",
            path.display()
        );
    }
    let dim = usize::try_from(dim).context("vector index dimension too large")?;
    let rows = usize::try_from(rows).context("vector index row count too large")?;
    let len = rows * dim;
    let mut data = Vec::with_capacity(len);
    let mut buf = [0u8; 4];
    for _ in 0..len {
        r.read_exact(&mut buf).context("vector index body truncated")?;
        data.push(f32::from_le_bytes(buf));
    }

    Array2::from_shape_vec((rows, dim), data).context("vector index shape mismatch")
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).context("vector index header truncated")?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).context("vector index header truncated")?;
    Ok(u64::from_le_bytes(buf))
}
