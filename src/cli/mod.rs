pub mod chat;
pub mod history;
pub mod search;
pub mod state;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tokio::io::AsyncWriteExt;

const HF_BASE: &str = "https://huggingface.co/sentence-transformers";

/// Cache file name and download URL for each file the local provider loads.
fn model_files(model: &str) -> [(&'static str, String); 2] {
    [
        ("model.onnx", format!("{HF_BASE}/{model}/resolve/main/onnx/model.onnx")),
        ("tokenizer.json", format!("{HF_BASE}/{model}/resolve/main/tokenizer.json")),
    ]
}

/// Fetch the embedding model and tokenizer into the cache directory, skipping files already there.
pub async fn model_download(config: &worldline::config::EmbeddingConfig) -> Result<()> {
    let cache_dir = worldline::config::expand_tilde(&config.cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

    println!("Embedding model: {}", config.model);
    for (name, url) in model_files(&config.model) {
        let dest = cache_dir.join(name);
        if dest.exists() {
            println!("{name} already present at {}", dest.display());
            continue;
        }
        println!("Downloading {name}...");
        download_file(&url, &dest).await?;
        println!("Saved {}", dest.display());
    }

    println!("Embedding model ready.");
    Ok(())
}

/// Stream a URL to `dest` with a progress bar. Written to a temp file, then renamed.
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")?
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk)
            .await
            .context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to rename temp file")?;

    pb.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_urls_follow_the_configured_model() {
        let files = model_files("all-MiniLM-L6-v2");
        assert_eq!(files[0].0, "model.onnx");
        assert_eq!(
            files[0].1,
            "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx"
        );
        assert!(model_files("paraphrase-MiniLM-L3-v2")[1]
            .1
            .contains("/paraphrase-MiniLM-L3-v2/resolve/main/tokenizer.json"));
    }
}
