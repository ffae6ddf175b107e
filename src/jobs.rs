//! Enrichment jobs: categorize, summarize and extract.
//!
//! Every job follows the same shape:
//!
//! 1. Stream articles that still lack the job's target field
//! 2. Build one prompt per article
//! 3. Run the prompts through the [`BatchScheduler`]
//! 4. Parse each reply, re-asking once if the JSON was cut off
//! 5. Write results back in batched writes (unless dry-run)
//!
//! A [`Pipeline`] holds references to the configuration, the LLM client and
//! the document store; nothing here touches global state.

use crate::api::{with_deadline, Complete};
use crate::config::AppConfig;
use crate::error::{PipelineError, StoreError};
use crate::models::{Article, Categorization, FactSheet, FailureRecord, JobReport, Summary, CATEGORIES};
use crate::rate_limiter::{clamp_cost, estimate_cost, RateLimiter};
use crate::retry::RetryPolicy;
use crate::scheduler::{BatchScheduler, RunSummary};
use crate::store::{BatchWriter, DocumentStore, FieldValue, Filter, Query};
use crate::utils::{clip_chars, reply_truncated, strip_code_fence, time_of_day, truncate_for_log};
use chrono::Local;
use clap::ValueEnum;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// Article text beyond this many characters is not sent to the model.
const MAX_ARTICLE_CHARS: usize = 12_000;

type FieldWrites = Vec<(String, FieldValue)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum JobKind {
    /// Assign one of the fixed categories
    Categorize,
    /// Write a short summary and headline
    Summarize,
    /// Extract celebrities, key facts and tags
    Extract,
}

impl JobKind {
    pub fn name(self) -> &'static str {
        match self {
            JobKind::Categorize => "categorize",
            JobKind::Summarize => "summarize",
            JobKind::Extract => "extract",
        }
    }

    /// Field whose absence marks an article as not yet processed.
    pub fn target_field(self) -> &'static str {
        match self {
            JobKind::Categorize => "category",
            JobKind::Summarize => "summary",
            JobKind::Extract => "celebrities",
        }
    }

    /// Server-timestamped field recording when the job last ran.
    pub fn stamp_field(self) -> &'static str {
        match self {
            JobKind::Categorize => "categorized_at",
            JobKind::Summarize => "summarized_at",
            JobKind::Extract => "extracted_at",
        }
    }

    pub fn prompt(self, article: &Article) -> String {
        let instructions = match self {
            JobKind::Categorize => format!(
                "Classify this celebrity news article into exactly one category from: {}.\n\
                 Reply with JSON only: {{\"category\": \"...\"}}",
                CATEGORIES.join(", ")
            ),
            JobKind::Summarize => "Summarize this celebrity news article in two or three sentences \
                 and propose a short headline.\n\
                 Reply with JSON only: {\"summary\": \"...\", \"headline\": \"...\"}"
                .to_string(),
            JobKind::Extract => "List every celebrity mentioned in this article, the key facts \
                 reported, and a few topic tags.\n\
                 Reply with JSON only: {\"celebrities\": [{\"name\": \"...\", \"knownFor\": \"...\", \
                 \"whyRelevant\": \"...\"}], \"keyFacts\": [\"...\"], \"tags\": [\"...\"]}"
                .to_string(),
        };
        let outlet = article
            .source_tag()
            .map(|tag| format!("\nOutlet: {tag}"))
            .unwrap_or_default();
        format!(
            "{instructions}\n\nTitle: {}{outlet}\n\nArticle:\n{}",
            article.title,
            clip_chars(&article.content, MAX_ARTICLE_CHARS)
        )
    }

    /// Parse a model reply into the field writes for this job.
    pub fn parse(self, reply: &str) -> Result<FieldWrites, PipelineError> {
        let writes = match self {
            JobKind::Categorize => {
                let c: Categorization = parse_reply::<Categorization>(reply)?.validate()?;
                vec![("category".to_string(), json!(c.category).into())]
            }
            JobKind::Summarize => {
                let s: Summary = parse_reply::<Summary>(reply)?.validate()?;
                // A blank headline clears one left by an earlier forced run.
                let headline = match s.headline.filter(|h| !h.trim().is_empty()) {
                    Some(h) => json!(h.trim()).into(),
                    None => FieldValue::Delete,
                };
                vec![
                    ("summary".to_string(), json!(s.summary.trim()).into()),
                    ("headline".to_string(), headline),
                ]
            }
            JobKind::Extract => {
                let sheet = parse_reply::<FactSheet>(reply)?.dedupe();
                vec![
                    ("celebrities".to_string(), to_value(&sheet.celebrities)?.into()),
                    ("key_facts".to_string(), json!(sheet.key_facts).into()),
                    ("tags".to_string(), json!(sheet.tags).into()),
                ]
            }
        };
        Ok(writes)
    }
}

fn parse_reply<T: DeserializeOwned>(reply: &str) -> Result<T, PipelineError> {
    serde_json::from_str(strip_code_fence(reply)).map_err(|e| PipelineError::Parse(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, PipelineError> {
    serde_json::to_value(value).map_err(|e| PipelineError::Parse(e.to_string()))
}

/// Which documents a job touches and how.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub collection: String,
    /// Restrict the run to these document ids.
    pub ids: Option<Vec<String>>,
    pub limit: Option<usize>,
    /// Extra field filters, e.g. `published_at>=2025-05-01`.
    pub filters: Vec<Filter>,
    /// Overrides `batch.size` from the config.
    pub batch_size: Option<usize>,
    /// Also reprocess documents that already have the target field.
    pub force: bool,
    pub dry_run: bool,
}

impl JobOptions {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ids: None,
            limit: None,
            filters: Vec::new(),
            batch_size: None,
            force: false,
            dry_run: false,
        }
    }

    fn query(&self, job: JobKind) -> Query {
        let mut query = Query::collection(&self.collection);
        if !self.force {
            query = query.filter(Filter::Missing(job.target_field().to_string()));
        }
        for filter in &self.filters {
            query = query.filter(filter.clone());
        }
        if let Some(ids) = &self.ids {
            query = query.ids(ids.clone());
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }
}

/// Runs jobs against one store with one LLM client.
#[derive(Debug)]
pub struct Pipeline<'a, C, S> {
    config: &'a AppConfig,
    llm: &'a C,
    store: &'a S,
}

impl<'a, C: Complete, S: DocumentStore> Pipeline<'a, C, S> {
    pub fn new(config: &'a AppConfig, llm: &'a C, store: &'a S) -> Self {
        Self { config, llm, store }
    }

    /// Run `job` over the matching documents and report what happened.
    ///
    /// Item failures land in the report; only store errors abort the run.
    #[instrument(level = "info", skip_all, fields(job = job.name(), collection = %opts.collection))]
    pub async fn run(&self, job: JobKind, opts: &JobOptions) -> Result<JobReport, PipelineError> {
        let t0 = Instant::now();
        let docs = self.store.stream(&opts.query(job)).await?;
        info!(count = docs.len(), "Fetched documents");

        let mut failures = Vec::new();
        let mut items = Vec::with_capacity(docs.len());
        for doc in &docs {
            match Article::from_document(doc) {
                Ok(article) => {
                    let prompt = job.prompt(&article);
                    items.push((article, prompt));
                }
                Err(e) => {
                    warn!(id = %doc.id, error = %e, "Skipping invalid document");
                    failures.push(FailureRecord::new(&doc.id, &e));
                }
            }
        }

        let limiter = RateLimiter::from_config(&self.config.rate_limit);
        let scheduler = BatchScheduler::new(
            &limiter,
            RetryPolicy::from(&self.config.retry),
            self.config.batch.cooldown(),
        );
        let batch_size = opts.batch_size.unwrap_or(self.config.batch.size);
        let reply_budget = u64::from(self.config.llm.max_tokens);
        let llm = self.llm;
        let deadline = self.config.llm.timeout();
        let gate = &limiter;

        let results = scheduler
            .run(
                &items,
                batch_size,
                |(_, prompt)| estimate_cost(prompt) + reply_budget,
                |(article, prompt)| {
                    let id = article.id.clone();
                    let prompt = prompt.clone();
                    let cost = clamp_cost(estimate_cost(&prompt) + reply_budget, gate.capacity());
                    async move {
                        let reply = with_deadline(deadline, llm.complete(&prompt)).await?;
                        match job.parse(&reply) {
                            Err(PipelineError::Parse(e)) if reply_truncated(&reply) => {
                                warn!(%id, error = %e, "Reply cut off mid-JSON; re-asking once");
                                // A re-ask is a new request and is admitted like one.
                                if !gate.try_admit(cost).await {
                                    info!(%id, cost, "Re-ask waiting for budget");
                                    gate.admit(cost).await;
                                }
                                let reply = with_deadline(deadline, llm.complete(&prompt)).await?;
                                job.parse(&reply).inspect_err(|e| {
                                    warn!(%id, error = %e, preview = %truncate_for_log(&reply, 300), "Re-ask failed");
                                })
                            }
                            Err(e) => {
                                warn!(%id, error = %e, preview = %truncate_for_log(&reply, 300), "Model returned non-conforming JSON");
                                Err(e)
                            }
                            ok => ok,
                        }
                    }
                },
            )
            .await;

        let mut summary = RunSummary::from_results(&results, t0.elapsed());
        summary.total += failures.len();
        summary.failed += failures.len();

        let mut writes = Vec::new();
        for ((article, _), result) in items.iter().zip(results) {
            match result {
                Ok(mut fields) => {
                    if opts.dry_run {
                        info!(id = %article.id, ?fields, "Dry run; not writing");
                        continue;
                    }
                    fields.push((job.stamp_field().to_string(), FieldValue::ServerTimestamp));
                    writes.push((article.id.as_str(), fields));
                }
                Err(e) => {
                    error!(id = %article.id, kind = ?e.kind(), error = %e, "Item failed");
                    failures.push(FailureRecord::new(&article.id, &e));
                }
            }
        }
        let written = self.commit_writes(&opts.collection, writes).await?;

        let stats = limiter.stats().await;
        let budget_left = limiter.available().await;
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rate_limited = summary.rate_limited,
            written,
            admitted = stats.admitted,
            tokens_admitted = stats.tokens_admitted,
            admission_waits = stats.waits,
            admission_wait_ms = stats.total_wait.as_millis() as u64,
            budget_left,
            "Job complete"
        );

        let now = Local::now();
        Ok(JobReport {
            job: job.name().to_string(),
            collection: opts.collection.clone(),
            local_date: now.date_naive().to_string(),
            time_of_day: time_of_day(),
            local_time: now.time().format("%H:%M:%S").to_string(),
            dry_run: opts.dry_run,
            summary,
            written,
            failures,
        })
    }

    /// Commit one update per document. On a store error the committed count
    /// and the ids still pending are logged before the error is returned.
    async fn commit_writes(&self, collection: &str, writes: Vec<(&str, FieldWrites)>) -> Result<usize, StoreError> {
        let ids: Vec<&str> = writes.iter().map(|(id, _)| *id).collect();
        let mut writer = BatchWriter::new(self.store, self.config.store.write_batch_limit);
        let mut outcome = Ok(());
        for (id, fields) in writes {
            outcome = writer.update(collection, id, fields).await;
            if outcome.is_err() {
                break;
            }
        }
        if outcome.is_ok() {
            outcome = writer.flush().await;
        }

        match outcome {
            Ok(()) => Ok(writer.committed()),
            Err(e) => {
                let committed = writer.committed();
                let pending = &ids[committed.min(ids.len())..];
                error!(
                    error = %e,
                    committed,
                    pending = pending.len(),
                    pending_ids = ?pending,
                    "Write batch failed; results for pending ids were not stored"
                );
                Err(e)
            }
        }
    }
}
