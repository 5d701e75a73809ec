//! Consumers of the records produced by a scan.

use log::info;
use std::io::Write;

use crate::error::{Result, ScanError};
use crate::mft::FileRecord;

/// Receives every non-zero `FileRecord` produced by a scan.
pub trait RecordSink {
    fn accept(&mut self, record: FileRecord) -> Result<()>;

    /// Called once after the last record.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Collects everything in memory (needed before paths can be rebuilt).
impl RecordSink for Vec<FileRecord> {
    fn accept(&mut self, record: FileRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Print mode: one line per record as it is parsed.
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> RecordSink for ConsoleSink<W> {
    fn accept(&mut self, record: FileRecord) -> Result<()> {
        writeln!(self.out, "{}", record.summary_line())?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Store hand-off: one JSON object per line, committed in batches.
pub struct JsonLinesSink<W: Write> {
    out: W,
    batch_size: usize,
    pending: usize,
    committed: usize,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W, batch_size: usize) -> Self {
        Self {
            out,
            batch_size: batch_size.max(1),
            pending: 0,
            committed: 0,
        }
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        self.out
            .flush()
            .map_err(|e| ScanError::Sink(format!("cannot commit batch: {}", e)))?;
        self.committed += self.pending;
        info!(
            "Committed batch of {} records. Total written: {}",
            self.pending, self.committed
        );
        self.pending = 0;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn accept(&mut self, record: FileRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, &record.to_json())?;
        self.out
            .write_all(b"\n")
            .map_err(|e| ScanError::Sink(e.to_string()))?;
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.commit()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn rec(id: u64, name: &str) -> FileRecord {
        FileRecord {
            record_id: id,
            parent_directory_id: 5,
            file_name: name.into(),
            is_active: true,
            content_offset: 4096,
            content_length: 12,
            full_path: Some(name.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_json_lines_batches() {
        let mut sink = JsonLinesSink::new(Vec::new(), 2);
        for i in 0..5 {
            sink.accept(rec(30 + i, &format!("f{i}.txt"))).unwrap();
        }
        assert_eq!(sink.committed(), 4);
        sink.finish().unwrap();
        assert_eq!(sink.committed(), 5);

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["record_id"], 30);
        assert_eq!(lines[0]["full_path"], "f0.txt");
        assert_eq!(lines[4]["offset"], 4096);
        assert_eq!(lines[4]["is_active"], true);
    }

    #[test]
    fn test_console_lines() {
        let mut buf = Vec::new();
        {
            let mut sink = ConsoleSink::new(&mut buf);
            sink.accept(rec(42, "a.txt")).unwrap();
            sink.finish().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("42"));
        assert!(text.trim_end().ends_with("a.txt"));
    }

    #[test]
    fn test_vec_collects() {
        let mut v: Vec<FileRecord> = Vec::new();
        v.accept(rec(1, "x")).unwrap();
        v.finish().unwrap();
        assert_eq!(v.len(), 1);
    }
}
