use crate::config::config::Settings;
use anyhow::{Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("File already exists: {0}")]
    FileExists(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub fn http_client(proxy: Option<&str>) -> Result<Client> {
    match proxy {
        Some(proxy_url) => {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("Failed to create HTTP proxy with URL {}", proxy_url))?;
            Client::builder()
                .proxy(proxy)
                .build()
                .with_context(|| "Failed to create HTTP client")
        }
        None => Client::builder()
            .build()
            .with_context(|| "Failed to create HTTP client"),
    }
}

/// Streams `url` into `target` through a `.tmp` sibling; `target` only appears once complete.
pub async fn download_file(client: &Client, url: &str, target: &Path) -> Result<(), DownloadError> {
    info!("Downloading {}", url);
    debug!("Saving to: {}", target.display());

    if fs::try_exists(target)
        .await
        .with_context(|| format!("Failed to inspect {}", target.display()))?
    {
        return Err(DownloadError::FileExists(target.display().to_string()));
    }

    let partial = partial_path(target);
    let result = stream_to(client, url, &partial).await;
    if let Err(e) = result {
        let _ = fs::remove_file(&partial).await;
        return Err(e.into());
    }

    fs::rename(&partial, target)
        .await
        .with_context(|| format!("Failed to move download into {}", target.display()))?;

    info!("Download completed successfully");
    Ok(())
}

async fn stream_to(client: &Client, url: &str, target: &Path) -> Result<()> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download from {}", url))?
        .error_for_status()
        .with_context(|| format!("HTTP error while downloading from {}", url))?;

    let mut file = BufWriter::new(
        File::create(target)
            .await
            .with_context(|| format!("Failed to create file: {}", target.display()))?,
    );

    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| "Failed to read response chunk")?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write chunk to file: {}", target.display()))?;
    }

    file.flush()
        .await
        .with_context(|| format!("Failed to flush file: {}", target.display()))?;
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Path of `file_name` in the shared cache, downloading it from the image mirror if absent.
pub async fn ensure_cached(settings: &Settings, file_name: &str) -> Result<PathBuf> {
    let cache_dir = settings.cache_dir();
    fs::create_dir_all(&cache_dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", cache_dir.display()))?;

    let target = cache_dir.join(file_name);
    if fs::try_exists(&target).await? {
        debug!("Using cached {}", target.display());
        return Ok(target);
    }

    let url = format!(
        "{}/{}",
        settings.image_base_url.trim_end_matches('/'),
        file_name
    );
    let client = http_client(settings.proxy.as_deref())?;
    match download_file(&client, &url, &target).await {
        Ok(()) | Err(DownloadError::FileExists(_)) => Ok(target),
        Err(DownloadError::Other(e)) => {
            Err(e.context(format!("unable to download {}", file_name)))
        }
    }
}

/// True for `http://` and `https://` locations.
pub fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}
