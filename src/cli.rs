//! Command-line interface definitions for gossip_wire.
//!
//! Arguments pick the job and its targets; everything else comes from the
//! YAML config. The API key can be passed via flag or environment variable.

use crate::jobs::{JobKind, JobOptions};
use crate::store::Filter;
use clap::Parser;

/// Command-line arguments for a single job run.
///
/// # Examples
///
/// ```sh
/// # Categorize every article that has no category yet
/// gossip_wire categorize
///
/// # Re-summarize two specific documents without writing anything
/// gossip_wire summarize --ids a12,a13 --force --dry-run
///
/// # Extract facts from 50 articles, 10 at a time, and write a report
/// gossip_wire extract -l 50 -b 10 -r ./reports
///
/// # Categorize only recent, popular articles
/// gossip_wire categorize -w "published_at>=2025-05-01" -w "views>1000"
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Job to run
    #[arg(value_enum)]
    pub job: JobKind,

    /// Collection holding the articles
    #[arg(long, default_value = "articles")]
    pub collection: String,

    /// Path to config.yaml
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,

    /// Override the store path from the config
    #[arg(short, long)]
    pub store: Option<String>,

    /// Only process these document ids (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<String>,

    /// Stop after this many documents
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Only process documents matching FIELD<op>VALUE (=, <, <=, >, >=); repeatable
    #[arg(short = 'w', long = "where", value_parser = Filter::parse)]
    pub filters: Vec<Filter>,

    /// Override the batch size from the config
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Reprocess documents that already have the job's field
    #[arg(long)]
    pub force: bool,

    /// Call the model but do not write results back
    #[arg(long)]
    pub dry_run: bool,

    /// Directory for JSON run reports
    #[arg(short, long)]
    pub report_dir: Option<String>,

    /// API key for the completion endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

impl Cli {
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            ids: (!self.ids.is_empty()).then(|| self.ids.clone()),
            limit: self.limit,
            filters: self.filters.clone(),
            batch_size: self.batch_size,
            force: self.force,
            dry_run: self.dry_run,
            ..JobOptions::new(&self.collection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["gossip_wire", "categorize"]);

        assert_eq!(cli.job, JobKind::Categorize);
        assert_eq!(cli.collection, "articles");
        assert_eq!(cli.config, "config.yaml");
        assert!(!cli.dry_run);

        let opts = cli.job_options();
        assert_eq!(opts.ids, None);
        assert_eq!(opts.limit, None);
    }

    #[test]
    fn test_cli_short_flags_and_ids() {
        let cli = Cli::parse_from([
            "gossip_wire",
            "extract",
            "-c",
            "/etc/gossip.yaml",
            "-l",
            "50",
            "-b",
            "10",
            "-r",
            "/tmp/reports",
            "--ids",
            "a1,a2",
            "--force",
            "--dry-run",
        ]);

        assert_eq!(cli.job, JobKind::Extract);
        assert_eq!(cli.config, "/etc/gossip.yaml");
        assert_eq!(cli.report_dir.as_deref(), Some("/tmp/reports"));

        let opts = cli.job_options();
        assert_eq!(opts.ids, Some(vec!["a1".to_string(), "a2".to_string()]));
        assert_eq!(opts.limit, Some(50));
        assert_eq!(opts.batch_size, Some(10));
        assert!(opts.force);
        assert!(opts.dry_run);
        assert!(opts.filters.is_empty());
    }

    #[test]
    fn test_cli_where_filters() {
        let cli = Cli::parse_from(["gossip_wire", "summarize", "-w", "views>1000", "--where", "category=Music"]);
        let opts = cli.job_options();
        assert_eq!(
            opts.filters,
            vec![
                Filter::Gt("views".to_string(), serde_json::json!(1000)),
                Filter::Eq("category".to_string(), serde_json::json!("Music")),
            ]
        );
        assert!(Cli::try_parse_from(["gossip_wire", "summarize", "--where", "views"]).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_job() {
        assert!(Cli::try_parse_from(["gossip_wire", "migrate"]).is_err());
    }
}
