//! Scalar time-series sink for training curves.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;

/// File name of the scalar log inside the sink directory.
pub const SCALARS_FILE: &str = "scalars.jsonl";

/// Receiver of `(tag, value, step)` points.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
}

/// Tag for a per-step training scalar.
pub fn training_tag(task_id: &str, name: &str) -> String {
    format!("{task_id}-Metrics/Training(Step): {name}")
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
    timestamp: String,
}

/// Appends one JSON object per point to `<dir>/scalars.jsonl`.
pub struct JsonlScalarSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlScalarSink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SCALARS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for JsonlScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            tag,
            value,
            step,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_appends_lines() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlScalarSink::create(&dir.path().join("vdl_log")).unwrap();
        sink.add_scalar(&training_tag("", "loss"), 0.5, 10).unwrap();
        sink.add_scalar(&training_tag("", "acc1"), 0.25, 10).unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["tag"], "-Metrics/Training(Step): loss");
        assert_eq!(lines[1]["step"], 10);
    }
}
