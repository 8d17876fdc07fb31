//! Append-only run output: one JSON Lines file per sink plus the failures
//! and arrival anomalies of the run.
//!
//! Records are appended before the checkpoint that covers them is saved, so
//! a resumed run continues the same files and every row keeps its terminal
//! outcome across the crash.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use tributary_types::Result;

pub const FAILURES_FILE: &str = "failures.jsonl";
pub const ANOMALIES_FILE: &str = "anomalies.jsonl";

#[derive(Debug, Clone)]
pub struct OutputLog {
    dir: PathBuf,
}

impl OutputLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sink_path(&self, sink: &str) -> PathBuf {
        self.dir.join(format!("{sink}.jsonl"))
    }

    pub fn failures_path(&self) -> PathBuf {
        self.dir.join(FAILURES_FILE)
    }

    pub fn anomalies_path(&self) -> PathBuf {
        self.dir.join(ANOMALIES_FILE)
    }

    /// Remove the files an earlier run left behind for these sinks.
    pub async fn reset<'a>(&self, sinks: impl IntoIterator<Item = &'a str>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut paths: Vec<PathBuf> = sinks.into_iter().map(|s| self.sink_path(s)).collect();
        paths.push(self.failures_path());
        paths.push(self.anomalies_path());
        for path in paths {
            if tokio::fs::try_exists(&path).await? {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    /// Append one JSON line per record and sync the file.
    pub async fn append<T: Serialize>(&self, path: &Path, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_data().await?;
        debug!(path = %path.display(), records = records.len(), "Appended run output");
        Ok(())
    }

    /// Read back every record of a JSON Lines file; a missing file is empty.
    pub async fn read_lines(path: &Path) -> Result<Vec<serde_json::Value>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_accumulates_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let log = OutputLog::new(dir.path().join("out"));
        let path = log.sink_path("sink");

        log.append(&path, &[json!({"id": 1})]).await.unwrap();
        log.append(&path, &[json!({"id": 2}), json!({"id": 3})]).await.unwrap();
        log.append::<serde_json::Value>(&path, &[]).await.unwrap();

        let lines = OutputLog::read_lines(&path).await.unwrap();
        assert_eq!(lines, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
    }

    #[tokio::test]
    async fn reset_removes_previous_run_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = OutputLog::new(dir.path());
        log.append(&log.sink_path("out"), &[json!({"id": 1})]).await.unwrap();
        log.append(&log.failures_path(), &[json!({"kind": "rejected"})]).await.unwrap();
        let unrelated = dir.path().join("notes.txt");
        std::fs::write(&unrelated, "keep").unwrap();

        log.reset(["out"]).await.unwrap();

        assert!(OutputLog::read_lines(&log.sink_path("out")).await.unwrap().is_empty());
        assert!(!log.failures_path().exists());
        assert!(unrelated.exists());
    }
}
