//! Archive mode: append posts to size-rotated JSON-lines files instead of
//! inserting them. The files (gzipped or not) are valid `--input` for a later
//! insert run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use streamgraph_common::StreamMessage;

use crate::stats::IngestStats;
use crate::worker::RecordHandler;

const SUFFIX: &str = ".posts.jsonl";
const GZIP_SUFFIX: &str = ".posts.jsonl.gz";

/// File name for archive number `id`, e.g. `000042.posts.jsonl` or `000042.posts.jsonl.gz`.
pub fn archive_file_name(id: u64, gzip: bool) -> String {
    let suffix = if gzip { GZIP_SUFFIX } else { SUFFIX };
    format!("{id:06}{suffix}")
}

/// Archive number encoded in `name`, if it is an archive file of either kind.
pub fn parse_archive_id(name: &str) -> Option<u64> {
    name.strip_suffix(GZIP_SUFFIX)
        .or_else(|| name.strip_suffix(SUFFIX))?
        .parse()
        .ok()
}

/// First archive number to use in `dir`: one past the highest existing file.
pub fn next_archive_id(dir: &Path) -> std::io::Result<u64> {
    let mut next = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_archive_id) {
            next = next.max(id + 1);
        }
    }
    Ok(next)
}

type ArchiveFile = Box<dyn AsyncWrite + Send + Unpin>;

struct Current {
    id: u64,
    file: ArchiveFile,
    /// Uncompressed bytes appended so far.
    written: u64,
}

pub struct ArchiveWriter {
    dir: PathBuf,
    max_file_bytes: u64,
    gzip: bool,
    current: Mutex<Current>,
    stats: Arc<IngestStats>,
}

impl ArchiveWriter {
    /// Create `dir` if needed and open the next archive file in it.
    pub async fn open(
        dir: &Path,
        max_file_bytes: u64,
        gzip: bool,
        stats: Arc<IngestStats>,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let id = next_archive_id(dir)?;
        let file = create(dir, id, gzip).await?;
        info!(
            dir = %dir.display(),
            first_file = archive_file_name(id, gzip).as_str(),
            gzip,
            "Archiving posts"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_bytes,
            gzip,
            current: Mutex::new(Current { id, file, written: 0 }),
            stats,
        })
    }

    /// Append one post as a JSON line, rotating first if the line would overflow the file.
    pub async fn append(&self, message: &StreamMessage) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let len = line.len() as u64;

        let mut current = self.current.lock().await;
        if current.written > 0 && current.written + len > self.max_file_bytes {
            current.file.shutdown().await?;
            let id = current.id + 1;
            *current = Current {
                id,
                file: create(&self.dir, id, self.gzip).await?,
                written: 0,
            };
            info!(file = archive_file_name(id, self.gzip).as_str(), "Rotated archive file");
        }
        current.file.write_all(&line).await?;
        current.written += len;
        Ok(())
    }

    /// Complete the current file. A gzip file is unreadable until its trailer is written here.
    pub async fn finish(&self) -> std::io::Result<()> {
        self.current.lock().await.file.shutdown().await
    }
}

async fn create(dir: &Path, id: u64, gzip: bool) -> std::io::Result<ArchiveFile> {
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(dir.join(archive_file_name(id, gzip)))
        .await?;
    Ok(if gzip {
        Box::new(GzipEncoder::new(file))
    } else {
        Box::new(file)
    })
}

#[async_trait]
impl RecordHandler for ArchiveWriter {
    async fn handle(&self, message: StreamMessage) {
        self.stats.record_received();
        match &message {
            StreamMessage::Post(_) => {}
            StreamMessage::Malformed { reason, .. } => {
                debug!(reason = reason.as_str(), "Malformed post not archived");
                self.stats.record_rejected();
                return;
            }
            StreamMessage::Other(_) => {
                self.stats.record_skipped();
                return;
            }
        }
        match self.append(&message).await {
            Ok(()) => self.stats.record_archived(),
            Err(e) => {
                warn!(error = %e, "Failed to archive post");
                self.stats.record_rejected();
            }
        }
    }
}
