//! Result table on disk: `results.jsonl` (one row per line) and `summary.json`.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::errors::{SnapError, SnapResult};

use super::{ResultRow, RunArtifacts};

pub const RESULTS_FILE: &str = "results.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

/// Write `results.jsonl` and `summary.json` under `dir`; returns their paths.
pub fn write_artifacts(artifacts: &RunArtifacts, dir: &Path) -> SnapResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let results_path = dir.join(RESULTS_FILE);
    let mut buf = Vec::new();
    for row in &artifacts.results {
        serde_json::to_writer(&mut buf, row).map_err(std::io::Error::from)?;
        buf.push(b'\n');
    }
    write_replace(&results_path, &buf)?;

    let summary_path = dir.join(SUMMARY_FILE);
    let summary = serde_json::json!({
        "experiment_id": artifacts.experiment_id,
        "experiment_name": artifacts.experiment_name,
        "mode": artifacts.mode,
        "summary": artifacts.summary,
    });
    let pretty = serde_json::to_vec_pretty(&summary).map_err(std::io::Error::from)?;
    write_replace(&summary_path, &pretty)?;

    Ok((results_path, summary_path))
}

fn write_replace(path: &Path, content: &[u8]) -> SnapResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(content)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a `results.jsonl` file back. Blank lines are skipped.
pub fn read_results(path: &Path) -> SnapResult<Vec<ResultRow>> {
    let file = std::fs::File::open(path)?;
    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line).map_err(|e| {
            SnapError::config(format!("{}:{}: invalid result row: {}", path.display(), idx + 1, e))
        })?;
        rows.push(row);
    }
    Ok(rows)
}
