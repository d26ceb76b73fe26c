//! Multi-producer record queue with a single drain loop that persists each
//! record and flushes immediately.
//!
//! Producers hold cheap [`RecordSink`] clones. The [`RecordDrain`] ends once
//! every sink clone is dropped and the queue is empty, so closing the queue
//! is just dropping the producers.
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::types::Record;

/// Create a connected producer/consumer pair.
pub fn channel<R: Record>() -> (RecordSink<R>, RecordDrain<R>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RecordSink { tx }, RecordDrain { rx })
}

/// Producer half. Clone freely across workers and connection tasks.
#[derive(Debug)]
pub struct RecordSink<R> {
    tx: mpsc::UnboundedSender<R>,
}

impl<R> Clone for RecordSink<R> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<R: Record> RecordSink<R> {
    /// Enqueue a record. Never blocks.
    pub fn push(&self, record: R) {
        if self.tx.send(record).is_err() {
            warn!("record sink closed; record dropped");
        }
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct RecordDrain<R> {
    rx: mpsc::UnboundedReceiver<R>,
}

/// Summary returned when the drain loop ends.
#[derive(Debug)]
pub struct DrainReport<R> {
    pub written: u64,
    /// Records whose write failed, in arrival order.
    pub failed: Vec<R>,
    pub last_error: Option<io::Error>,
}

impl<R: Record> RecordDrain<R> {
    /// Next record in FIFO order, `None` once all producers are gone.
    pub async fn recv(&mut self) -> Option<R> {
        self.rx.recv().await
    }

    /// Run the drain loop on the blocking pool, writing through `writer`.
    pub fn spawn<W>(self, mut writer: W) -> JoinHandle<DrainReport<R>>
    where
        W: RecordWriter<R> + Send + 'static,
    {
        let mut rx = self.rx;
        tokio::task::spawn_blocking(move || {
            let mut report = DrainReport { written: 0, failed: Vec::new(), last_error: None };
            while let Some(record) = rx.blocking_recv() {
                match writer.write_record(&record) {
                    Ok(()) => report.written += 1,
                    Err(e) => {
                        error!("failed to persist record: {e}");
                        report.failed.push(record);
                        report.last_error = Some(e);
                    }
                }
            }
            report
        })
    }
}

/// Persists one record at a time; implementations flush before returning.
pub trait RecordWriter<R> {
    fn write_record(&mut self, record: &R) -> io::Result<()>;
}

/// Comma-separated rows with an optional header line.
///
/// Rows end in CRLF and cells are quoted only when they need it.
pub struct CsvWriter<W: Write> {
    out: csv::Writer<W>,
}

impl<W: Write> CsvWriter<W> {
    /// Wrap `out`, writing `header` first when given.
    pub fn new(out: W, header: Option<&[&str]>) -> io::Result<Self> {
        let mut out = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(out);
        if let Some(h) = header {
            out.write_record(h)?;
            out.flush()?;
        }
        Ok(Self { out })
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(|e| e.into_error())
    }
}

impl<R: Record, W: Write> RecordWriter<R> for CsvWriter<W> {
    fn write_record(&mut self, record: &R) -> io::Result<()> {
        self.out.write_record(record.csv_fields())?;
        self.out.flush()
    }
}

/// One JSON object per line.
pub struct JsonLinesWriter<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<R: Record, W: Write> RecordWriter<R> for JsonLinesWriter<W> {
    fn write_record(&mut self, record: &R) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

impl<R, T: RecordWriter<R> + ?Sized> RecordWriter<R> for Box<T> {
    fn write_record(&mut self, record: &R) -> io::Result<()> {
        (**self).write_record(record)
    }
}
