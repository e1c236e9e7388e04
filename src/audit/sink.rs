//! Single-writer audit log.
//!
//! Producers hold an [`AuditHandle`] and push records onto an unbounded
//! queue; one writer task owns the log file and appends records in dequeue
//! order. Write failures are logged as they happen and the first one is
//! returned from [`AuditSink::close`].

use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::record::TransactionRecord;
use crate::error::AuditError;
use crate::observability::metrics;

enum Command {
    Record(Box<TransactionRecord>),
    Close,
}

/// Producer side of the audit log. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl AuditHandle {
    /// Queue a record for writing. Never waits on disk I/O.
    pub fn submit(&self, record: TransactionRecord) -> Result<(), AuditError> {
        self.tx
            .send(Command::Record(Box::new(record)))
            .map_err(|_| AuditError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Record(r) => write!(f, "Record({})", r.transaction_id),
            Command::Close => write!(f, "Close"),
        }
    }
}

/// Owner of the audit log file and its writer task.
pub struct AuditSink {
    handle: AuditHandle,
    writer: JoinHandle<Result<u64, AuditError>>,
    path: PathBuf,
}

impl AuditSink {
    /// Open (or create) the log in append mode and start the writer.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AuditError::Open {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(BufWriter::new(file), rx));

        tracing::info!(path = %path.display(), "Audit log opened");

        Ok(Self {
            handle: AuditHandle { tx },
            writer,
            path,
        })
    }

    pub fn handle(&self) -> AuditHandle {
        self.handle.clone()
    }

    pub fn submit(&self, record: TransactionRecord) -> Result<(), AuditError> {
        self.handle.submit(record)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting records, drain the queue, flush, and close the file.
    ///
    /// Returns the first write error seen over the sink's lifetime.
    pub async fn close(self) -> Result<(), AuditError> {
        let _ = self.handle.tx.send(Command::Close);
        let written = self
            .writer
            .await
            .map_err(|e| AuditError::Writer(e.to_string()))??;
        tracing::info!(path = %self.path.display(), records = written, "Audit log closed");
        Ok(())
    }
}

async fn run_writer<W>(
    mut out: BufWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) -> Result<u64, AuditError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut first_error: Option<AuditError> = None;
    let mut written = 0u64;
    let mut buf = String::new();

    while let Some(command) = rx.recv().await {
        let record = match command {
            Command::Record(record) => record,
            Command::Close => {
                // Refuse new submissions; everything already queued still drains.
                rx.close();
                continue;
            }
        };

        buf.clear();
        record.encode(&mut buf);
        let result = async {
            out.write_all(buf.as_bytes()).await?;
            out.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                written += 1;
                metrics::record_audit_write(true);
            }
            Err(e) => {
                metrics::record_audit_write(false);
                tracing::error!(
                    transaction_id = %record.transaction_id,
                    kind = record.kind.type_label(),
                    error = %e,
                    "Failed to write audit record"
                );
                first_error.get_or_insert(AuditError::Write(e.to_string()));
            }
        }
    }

    if let Err(e) = out.shutdown().await {
        tracing::error!(error = %e, "Failed to close audit log");
        first_error.get_or_insert(AuditError::Write(e.to_string()));
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(written),
    }
}
