//! JSON run reports.
//!
//! Files are organized by date with the job and edition in the name:
//! ```text
//! report_dir/
//! └── 2025-05-06/
//!     ├── categorize_morning.json
//!     └── extract_evening.json
//! ```
//!
//! A later run of the same job in the same edition overwrites the earlier
//! report.

use crate::models::JobReport;
use std::error::Error;
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info, instrument};

/// Write a [`JobReport`] under `{report_dir}/{date}/{job}_{time_of_day}.json`.
///
/// Returns the path written.
#[instrument(level = "info", skip_all, fields(report_dir = %report_dir))]
pub async fn write_report(report: &JobReport, report_dir: &str) -> Result<PathBuf, Box<dyn Error>> {
    let json = serde_json::to_string_pretty(report)?;

    let full_dir = PathBuf::from(report_dir).join(&report.local_date);
    info!(full_dir = %full_dir.display(), "Ensuring report directory exists");
    if let Err(e) = fs::create_dir_all(&full_dir).await {
        error!(full_dir = %full_dir.display(), error = %e, "Failed to create report dir");
        return Err(e.into());
    }

    let path = full_dir.join(format!("{}_{}.json", report.job, report.time_of_day));
    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote run report");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::models::FailureRecord;
    use crate::scheduler::RunSummary;

    #[tokio::test]
    async fn test_write_report_layout() {
        let dir = tempfile::tempdir().unwrap();
        let report = JobReport {
            job: "categorize".to_string(),
            collection: "articles".to_string(),
            local_date: "2025-05-06".to_string(),
            time_of_day: "evening".to_string(),
            local_time: "20:30:00".to_string(),
            dry_run: false,
            summary: RunSummary {
                total: 2,
                succeeded: 1,
                failed: 1,
                rate_limited: 0,
                elapsed_ms: 1500,
            },
            written: 1,
            failures: vec![FailureRecord::new(
                "a2",
                &PipelineError::Validation("unknown category".to_string()),
            )],
        };

        let path = write_report(&report, dir.path().to_str().unwrap()).await.unwrap();
        assert!(path.ends_with("2025-05-06/categorize_evening.json"));

        let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(written["summary"]["failed"], 1);
        assert_eq!(written["failures"][0]["kind"], "permanent");
    }
}
