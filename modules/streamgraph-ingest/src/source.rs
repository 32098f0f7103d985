//! Stream sources: newline-delimited JSON from files (plain or `.gz`) or from
//! the live HTTP stream.
//!
//! Both push decoded messages into the bounded channel that feeds the dispatcher,
//! which is the only buffering point. A full channel blocks the source.

use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::GzipDecoder;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use streamgraph_common::StreamMessage;

use crate::stats::IngestStats;

/// Longest live stream line kept in memory. Longer lines are dropped as rejected.
pub const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Unable to read input '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to walk input directory")]
    Walk(#[from] walkdir::Error),

    #[error("Stream request failed")]
    Http(#[from] reqwest::Error),
}

/// Whether the consumer side is still taking messages.
enum Flow {
    Continue,
    Stop,
}

/// Decode one line and push it downstream. Blank lines are keep-alives.
async fn forward(
    line: &str,
    tx: &mpsc::Sender<StreamMessage>,
    stats: &IngestStats,
    shutdown: &CancellationToken,
) -> Flow {
    let line = line.trim();
    if line.is_empty() {
        return Flow::Continue;
    }
    let message = match StreamMessage::from_json(line) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Undecodable stream line");
            stats.record_rejected();
            return Flow::Continue;
        }
    };
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Flow::Stop,
        sent = tx.send(message) => match sent {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        },
    }
}

/// Every regular file under `path` (or `path` itself), in name order.
pub fn input_files(path: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Read JSON lines from a file or a directory tree. `.gz` files are decompressed. Returns the number of lines read.
pub async fn read_files(
    path: &Path,
    tx: mpsc::Sender<StreamMessage>,
    stats: &IngestStats,
    shutdown: CancellationToken,
) -> Result<u64, SourceError> {
    let files = input_files(path)?;
    info!(files = files.len(), path = %path.display(), "Reading posts from files");

    let mut lines_read = 0u64;
    for file in files {
        let handle = tokio::fs::File::open(&file)
            .await
            .map_err(|source| SourceError::Io {
                path: file.clone(),
                source,
            })?;
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = if is_gzip(&file) {
            let mut decoder = GzipDecoder::new(BufReader::new(handle));
            decoder.multiple_members(true);
            Box::new(BufReader::new(decoder))
        } else {
            Box::new(BufReader::new(handle))
        };
        let mut lines = reader.lines();
        loop {
            let line = lines.next_line().await.map_err(|source| SourceError::Io {
                path: file.clone(),
                source,
            })?;
            let Some(line) = line else {
                break;
            };
            lines_read += 1;
            if let Flow::Stop = forward(&line, &tx, stats, &shutdown).await {
                info!(lines_read, "File source stopped early");
                return Ok(lines_read);
            }
        }
        debug!(file = %file.display(), "Finished input file");
    }
    info!(lines_read, "File source exhausted");
    Ok(lines_read)
}

/// A complete line split out of the live byte stream.
#[derive(Debug, PartialEq)]
enum Chunk {
    Line(String),
    /// A line longer than the buffer's limit. Its bytes were discarded.
    Oversize,
}

/// Splits a byte stream into lines, holding at most `max` bytes of an unfinished line.
struct LineBuffer {
    pending: Vec<u8>,
    max: usize,
    /// Inside an oversize line; drop bytes until the next newline.
    discarding: bool,
}

impl LineBuffer {
    fn new(max: usize) -> Self {
        Self {
            pending: Vec::new(),
            max,
            discarding: false,
        }
    }

    fn push(&mut self, mut bytes: &[u8]) -> Vec<Chunk> {
        let mut out = Vec::new();
        while let Some(newline) = bytes.iter().position(|b| *b == b'\n') {
            let (head, rest) = (&bytes[..newline], &bytes[newline + 1..]);
            if self.discarding || self.pending.len() + head.len() > self.max {
                if !self.discarding {
                    out.push(Chunk::Oversize);
                }
                self.discarding = false;
                self.pending.clear();
            } else {
                self.pending.extend_from_slice(head);
                out.push(Chunk::Line(String::from_utf8_lossy(&self.pending).into_owned()));
                self.pending.clear();
            }
            bytes = rest;
        }
        if !self.discarding {
            if self.pending.len() + bytes.len() > self.max {
                out.push(Chunk::Oversize);
                self.discarding = true;
                self.pending = Vec::new();
            } else {
                self.pending.extend_from_slice(bytes);
            }
        }
        out
    }
}

/// Consume the live HTTP stream until it ends, errors, or `shutdown` fires.
pub async fn read_live(
    url: &str,
    bearer_token: &str,
    tx: mpsc::Sender<StreamMessage>,
    stats: &IngestStats,
    shutdown: CancellationToken,
) -> Result<u64, SourceError> {
    let response = reqwest::Client::new()
        .get(url)
        .bearer_auth(bearer_token)
        .send()
        .await?
        .error_for_status()?;
    info!(url, "Connected to live stream");

    let mut body = response.bytes_stream();
    let mut buffer = LineBuffer::new(MAX_LINE_BYTES);
    let mut lines_read = 0u64;
    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else {
            warn!(lines_read, "Live stream closed by remote");
            break;
        };
        for line in buffer.push(&chunk?) {
            lines_read += 1;
            let text = match line {
                Chunk::Line(text) => text,
                Chunk::Oversize => {
                    warn!(max_bytes = MAX_LINE_BYTES, "Dropped oversize stream line");
                    stats.record_rejected();
                    continue;
                }
            };
            if let Flow::Stop = forward(&text, &tx, stats, &shutdown).await {
                return Ok(lines_read);
            }
        }
    }
    Ok(lines_read)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const POST: &str = r#"{"id_str":"1","created_at":"Wed Oct 10 20:19:24 +0000 2018","user":{"id_str":"9"}}"#;

    #[tokio::test]
    async fn directory_is_walked_recursively_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.jsonl"), format!("{POST}\n")).unwrap();
        std::fs::write(dir.path().join("nested/a.jsonl"), format!("{POST}\n{POST}\n")).unwrap();

        let files = input_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("b.jsonl"));

        let (tx, mut rx) = mpsc::channel(16);
        let stats = IngestStats::default();
        let read = read_files(dir.path(), tx, &stats, CancellationToken::new()).await.unwrap();
        assert_eq!(read, 3);

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn undecodable_and_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{POST}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{not json").unwrap();
        writeln!(file, r#"{{"limit":{{"track":3}}}}"#).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let stats = IngestStats::default();
        read_files(file.path(), tx, &stats, CancellationToken::new()).await.unwrap();

        assert!(rx.recv().await.unwrap().as_post().is_some());
        assert!(rx.recv().await.unwrap().as_post().is_none());
        assert!(rx.recv().await.is_none());
        assert_eq!(stats.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn cancelled_source_stops_sending() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for _ in 0..10 {
            writeln!(file, "{POST}").unwrap();
        }
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = IngestStats::default();
        let read = read_files(file.path(), tx, &stats, shutdown).await.unwrap();
        assert_eq!(read, 1);
    }

    #[test]
    fn missing_input_is_a_walk_error() {
        assert!(matches!(
            input_files(Path::new("/nonexistent/streamgraph-input")),
            Err(SourceError::Walk(_))
        ));
    }

    #[tokio::test]
    async fn gzip_input_is_decompressed() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let mut encoder = async_compression::tokio::write::GzipEncoder::new(Vec::new());
        encoder.write_all(format!("{POST}\n{POST}\n").as_bytes()).await.unwrap();
        encoder.shutdown().await.unwrap();
        std::fs::write(dir.path().join("a.jsonl.gz"), encoder.into_inner()).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let stats = IngestStats::default();
        let read = read_files(dir.path(), tx, &stats, CancellationToken::new()).await.unwrap();
        assert_eq!(read, 2);
        assert!(rx.recv().await.unwrap().as_post().is_some());
        assert_eq!(stats.snapshot().rejected, 0);
    }

    #[test]
    fn lines_split_across_chunks_are_joined() {
        let mut buffer = LineBuffer::new(64);
        assert!(buffer.push(b"{\"a\"").is_empty());
        assert_eq!(
            buffer.push(b":1}\r\n\n{}"),
            vec![Chunk::Line("{\"a\":1}\r".into()), Chunk::Line(String::new())]
        );
        assert_eq!(buffer.push(b"\n"), vec![Chunk::Line("{}".into())]);
    }

    #[test]
    fn oversize_line_is_dropped_once_and_reading_resumes() {
        let mut buffer = LineBuffer::new(8);
        assert_eq!(buffer.push(b"0123456"), vec![]);
        assert_eq!(buffer.push(b"789abc"), vec![Chunk::Oversize]);
        assert!(buffer.pending.is_empty());
        assert_eq!(buffer.push(b"defghijk"), vec![]);
        assert_eq!(buffer.push(b"lmn\nok\n"), vec![Chunk::Line("ok".into())]);
        assert_eq!(
            buffer.push(b"0123456789\nshort\n"),
            vec![Chunk::Oversize, Chunk::Line("short".into())]
        );
    }
}
