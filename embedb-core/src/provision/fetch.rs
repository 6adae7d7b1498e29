//! Archive sources: where provisioning gets its bytes from.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Fetches an archive URL to a local file, reporting percent complete.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Write the archive behind `url` to `dest`, returning the bytes written.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<u64>;
}

/// Turns byte counts into integer percentages, each reported once.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    received: u64,
    last: Option<u8>,
}

impl ProgressTracker {
    /// `total` of zero means the length is unknown and nothing is reported.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            received: 0,
            last: None,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Record `n` more bytes; returns the new percentage if it changed.
    pub fn advance(&mut self, n: u64) -> Option<u8> {
        self.received += n;
        if self.total == 0 {
            return None;
        }
        let percent = (self.received.saturating_mul(100) / self.total).min(100) as u8;
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }
}

/// Streams archives over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpArchiveSource {
    client: reqwest::Client,
}

impl HttpArchiveSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("embedb/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<u64> {
        info!(url, "Downloading archive");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("GET {url} returned {status}");
        }

        let mut tracker = ProgressTracker::new(response.content_length().unwrap_or(0));
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("reading body of {url}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;
            if let Some(percent) = tracker.advance(chunk.len() as u64) {
                progress(percent);
            }
        }
        file.sync_all().await?;

        debug!(url, bytes = tracker.received(), "Download complete");
        Ok(tracker.received())
    }
}

/// Serves archives from a local directory holding files named like the last
/// URL segment, for offline machines and tests.
#[derive(Debug, Clone)]
pub struct MirrorArchiveSource {
    dir: PathBuf,
}

impl MirrorArchiveSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Mirror file that stands in for `url`.
    pub fn path_for(&self, url: &str) -> PathBuf {
        let name = url.rsplit('/').next().unwrap_or(url);
        self.dir.join(name)
    }
}

#[async_trait]
impl ArchiveSource for MirrorArchiveSource {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<u64> {
        let src = self.path_for(url);
        info!(url, mirror = %src.display(), "Copying archive from mirror");

        let mut input = tokio::fs::File::open(&src)
            .await
            .with_context(|| format!("{url} is not in the mirror at {}", src.display()))?;
        let total = input.metadata().await?.len();
        let mut output = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;

        let mut tracker = ProgressTracker::new(total);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n]).await?;
            if let Some(percent) = tracker.advance(n as u64) {
                progress(percent);
            }
        }
        output.sync_all().await?;
        Ok(tracker.received())
    }
}
