//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::metrics::PersistenceMetrics;
use crate::{PersistenceError, Result};

/// First line of every report log.
pub const REPORT_HEADER: &str = "# Start of energy consumption 15 minute period, kWh used";

/// Last line of a report log that was closed cleanly.
pub const REPORT_SENTINEL: &str = "#   Sentinel  halt  stop";

/// Energy used during one closed period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// Period start rendered as `YYYY-MM-DD_HH:MM`.
    pub period_start_label: String,
    /// Energy in kilowatt-hours.
    pub kwh: f64,
}

impl ReportRecord {
    /// Construct a record for the period starting at `period_start_label`.
    pub fn new(period_start_label: impl Into<String>, kwh: f64) -> Self {
        Self {
            period_start_label: period_start_label.into(),
            kwh,
        }
    }

    /// Parse a `<label>,<kwh>` line. `line_no` is only used for diagnostics.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self> {
        let (label, value) =
            line.split_once(',')
                .ok_or_else(|| PersistenceError::MalformedRecord {
                    line: line_no,
                    reason: "missing ',' separator".into(),
                })?;
        let kwh = value
            .trim()
            .parse::<f64>()
            .map_err(|err| PersistenceError::MalformedRecord {
                line: line_no,
                reason: format!("invalid kWh value '{}': {}", value.trim(), err),
            })?;
        Ok(Self::new(label.trim(), kwh))
    }
}

/// `f64` display is the shortest representation that parses back to the same
/// value and never depends on the process locale.
impl fmt::Display for ReportRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.period_start_label, self.kwh)
    }
}

/// Append-only writer for the interval report log.
///
/// [`append`](Self::append) syncs each record to stable storage before
/// returning. [`write_record`](Self::write_record) only buffers; the record is
/// durable after the next [`flush`](Self::flush).
pub struct ReportLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records_written: u64,
    pending_records: u64,
    pending_bytes: usize,
    finished: bool,
    metrics: Option<Arc<PersistenceMetrics>>,
}

impl ReportLogWriter {
    /// Create (or truncate) the log at `path` and write the header line.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut log = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records_written: 0,
            pending_records: 0,
            pending_bytes: 0,
            finished: false,
            metrics: None,
        };
        log.write_line(REPORT_HEADER)?;
        log.sync()?;
        debug!(path = %log.path.display(), "report log created");
        Ok(log)
    }

    /// Attach metrics that will observe every subsequent append.
    pub fn with_metrics(mut self, metrics: Arc<PersistenceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Append a record and sync it to disk. Returns the number of bytes written.
    pub fn append(&mut self, record: &ReportRecord) -> Result<usize> {
        let bytes = self.write_record(record)?;
        self.flush()?;
        Ok(bytes)
    }

    /// Buffer a record without syncing. Returns the number of bytes buffered.
    pub fn write_record(&mut self, record: &ReportRecord) -> Result<usize> {
        if self.finished {
            return Err(PersistenceError::Finished);
        }
        let line = record.to_string();
        if let Err(err) = self.write_line(&line) {
            self.observe_failure(&err);
            return Err(err);
        }
        let bytes = line.len() + 1;
        self.pending_records += 1;
        self.pending_bytes += bytes;
        Ok(bytes)
    }

    /// Flush buffered records and sync the file to stable storage.
    ///
    /// No-op when nothing has been written since the last sync.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending_records == 0 {
            return Ok(());
        }
        let started = Instant::now();
        if let Err(err) = self.sync() {
            self.observe_failure(&err);
            return Err(err);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_sync(
                self.pending_records,
                self.pending_bytes,
                started.elapsed().as_secs_f64(),
            );
        }
        self.records_written += self.pending_records;
        self.pending_records = 0;
        self.pending_bytes = 0;
        Ok(())
    }

    /// Sync pending records, then write the sentinel. Further appends are rejected.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush()?;
        self.write_line(REPORT_SENTINEL)?;
        self.sync()?;
        self.finished = true;
        debug!(path = %self.path.display(), records = self.records_written, "report log finished");
        Ok(())
    }

    /// Number of records synced to disk so far.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Records buffered since the last sync.
    pub fn pending_records(&self) -> u64 {
        self.pending_records
    }

    /// Access the current path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn observe_failure(&self, err: &PersistenceError) {
        error!(path = %self.path.display(), error = %err, "report append failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_failure();
        }
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl fmt::Debug for ReportLogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportLogWriter")
            .field("path", &self.path)
            .field("records_written", &self.records_written)
            .field("pending_records", &self.pending_records)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Replay the records of a log in order, invoking the callback for each one.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(ReportRecord) -> Result<()>,
{
    let mut count = 0usize;
    for record in ReportLogReader::open(path)? {
        handler(record?)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over the records of a report log.
///
/// Comment lines (header, sentinel, anything else starting with `#`) are
/// skipped; [`ReportLogReader::sentinel_seen`] tells whether the log was
/// closed cleanly once the iterator is exhausted.
pub struct ReportLogReader {
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
    sentinel_seen: bool,
}

impl ReportLogReader {
    /// Open the log for sequential reading.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            sentinel_seen: false,
        })
    }

    /// Whether the sentinel line has been read so far.
    pub fn sentinel_seen(&self) -> bool {
        self.sentinel_seen
    }
}

impl Iterator for ReportLogReader {
    type Item = Result<ReportRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('#') {
                if line == REPORT_SENTINEL {
                    self.sentinel_seen = true;
                }
                continue;
            }
            return Some(ReportRecord::parse_line(trimmed, self.line_no));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_lines_are_locale_independent() {
        assert_eq!(
            ReportRecord::new("2024-05-01_10:15", 0.025).to_string(),
            "2024-05-01_10:15,0.025"
        );
        assert_eq!(
            ReportRecord::new("2024-05-01_10:30", 0.0).to_string(),
            "2024-05-01_10:30,0"
        );
    }

    #[test]
    fn parse_line_rejects_garbage() {
        assert!(matches!(
            ReportRecord::parse_line("2024-05-01_10:15 0.1", 2),
            Err(PersistenceError::MalformedRecord { line: 2, .. })
        ));
        assert!(matches!(
            ReportRecord::parse_line("2024-05-01_10:15,abc", 5),
            Err(PersistenceError::MalformedRecord { line: 5, .. })
        ));
    }

    #[test]
    fn header_records_and_sentinel_are_written_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("watts.txt");
        let mut writer = ReportLogWriter::create(&path).unwrap();
        writer
            .append(&ReportRecord::new("2024-05-01_10:00", 0.125))
            .unwrap();
        writer
            .append(&ReportRecord::new("2024-05-01_10:15", 0.5))
            .unwrap();
        writer.finish().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                REPORT_HEADER,
                "2024-05-01_10:00,0.125",
                "2024-05-01_10:15,0.5",
                REPORT_SENTINEL,
            ]
        );
        assert_eq!(writer.records_written(), 2);
    }

    #[test]
    fn append_after_finish_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = ReportLogWriter::create(&dir.path().join("w.txt")).unwrap();
        writer.finish().unwrap();
        writer.finish().unwrap();
        assert!(matches!(
            writer.append(&ReportRecord::new("2024-05-01_10:00", 1.0)),
            Err(PersistenceError::Finished)
        ));
    }

    #[test]
    fn buffered_records_count_once_synced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.txt");
        let mut writer = ReportLogWriter::create(&path).unwrap();
        writer
            .write_record(&ReportRecord::new("2024-05-01_10:00", 0.1))
            .unwrap();
        writer
            .write_record(&ReportRecord::new("2024-05-01_10:15", 0.2))
            .unwrap();
        assert_eq!(writer.pending_records(), 2);
        assert_eq!(writer.records_written(), 0);

        writer.flush().unwrap();
        assert_eq!(writer.pending_records(), 0);
        assert_eq!(writer.records_written(), 2);
        writer.flush().unwrap();
        assert_eq!(writer.records_written(), 2);

        writer
            .write_record(&ReportRecord::new("2024-05-01_10:30", 0.3))
            .unwrap();
        writer.finish().unwrap();
        assert_eq!(writer.records_written(), 3);
        let records: Vec<_> = ReportLogReader::open(&path)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn reader_reports_unterminated_logs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("w.txt");
        let mut writer = ReportLogWriter::create(&path).unwrap();
        writer
            .append(&ReportRecord::new("2024-05-01_10:00", 2.5))
            .unwrap();
        drop(writer);

        let mut reader = ReportLogReader::open(&path).unwrap();
        let records: Vec<_> = reader.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![ReportRecord::new("2024-05-01_10:00", 2.5)]);
        assert!(!reader.sentinel_seen());
    }
}
