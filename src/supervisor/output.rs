//! Child output capture
//!
//! Captured streams either go to the log line by line or are copied into a
//! file the host owns, which lets it rotate the file while the child runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::rotation;

/// Output file written by the host on behalf of the child
pub struct FileSink {
    path: PathBuf,
    file: File,
    written: u64,
    /// Rotate once this many bytes were written, 0 = only on request
    threshold: u64,
    generation: u64,
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

impl FileSink {
    pub async fn open(path: impl Into<PathBuf>, threshold: u64, generation: u64) -> std::io::Result<Self> {
        let path = path.into();
        let file = open_append(&path).await?;
        let written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
            threshold,
            generation,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        rotation::force_rotate(&self.path)?;
        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    pub async fn write(&mut self, buf: &[u8], requested: u64) -> std::io::Result<()> {
        let over = self.threshold > 0 && self.written >= self.threshold;
        if over || requested != self.generation {
            self.generation = requested;
            if let Err(e) = self.rotate().await {
                log::warn!("Cannot rotate {}: {}", self.path.display(), e);
            }
        }
        self.file.write_all(buf).await?;
        self.file.flush().await?;
        self.written += buf.len() as u64;
        Ok(())
    }
}

/// Forward `stream` to the log, one record per line
pub async fn pump_to_log<R>(service: String, stream: R, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                if stderr {
                    log::warn!(target: "child", "{}: {}", service, text);
                } else {
                    log::info!(target: "child", "{}: {}", service, text);
                }
            }
            Err(e) => {
                log::debug!("{}: output stream closed: {}", service, e);
                break;
            }
        }
    }
}

/// Copy `stream` into a shared file sink
pub async fn pump_to_file<R>(stream: R, sink: Arc<Mutex<FileSink>>, rotate: Arc<AtomicU64>)
where
    R: AsyncRead + Unpin,
{
    let mut stream = stream;
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut sink = sink.lock().await;
        if let Err(e) = sink.write(&buf[..n], rotate.load(Ordering::Relaxed)).await {
            log::warn!("Cannot write {}: {}", sink.path().display(), e);
            break;
        }
    }
}
