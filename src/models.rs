//! Data models for stored articles, LLM outputs and run reports.
//!
//! - [`Article`]: a news article as read from the document store
//! - [`Categorization`], [`Summary`], [`FactSheet`]: what each job asks the
//!   model to return, parsed from its JSON reply
//! - [`JobReport`]: the outcome of one job run, written as JSON
//!
//! LLM reply types use camelCase field names to match the JSON schema the
//! prompts describe.

use crate::error::{ErrorKind, PipelineError};
use crate::scheduler::RunSummary;
use crate::store::Document;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Categories the categorize job may assign.
pub const CATEGORIES: &[&str] = &[
    "Music",
    "Film & TV",
    "Fashion & Beauty",
    "Relationships",
    "Legal Trouble",
    "Sports",
    "Royals",
    "Social Media",
    "Business",
    "Other",
];

/// A stored news article.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    /// Document id in the store.
    pub id: String,
    pub title: String,
    pub content: String,
    /// The URL the article was scraped from, when known.
    pub source: Option<String>,
}

impl Article {
    /// Build an article from a store document. `title` may be absent;
    /// `content` must be present and non-blank.
    pub fn from_document(doc: &Document) -> Result<Self, PipelineError> {
        let content = doc
            .str_field("content")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipelineError::Validation(format!("article {} has no content", doc.id)))?;
        Ok(Self {
            id: doc.id.clone(),
            title: doc.str_field("title").unwrap_or_default().to_string(),
            content: content.to_string(),
            source: doc.str_field("source").map(str::to_string),
        })
    }

    /// Extract the domain name (before .com/.org/etc) from the source URL.
    /// For example: "https://www.tmz.com/2025/05/06/story" -> "tmz"
    pub fn source_tag(&self) -> Option<String> {
        let parsed = url::Url::parse(self.source.as_ref()?).ok()?;
        let parts: Vec<&str> = parsed.host_str()?.split('.').collect();
        if parts.len() >= 2 {
            Some(parts[parts.len() - 2].to_string())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Categorization {
    pub category: String,
}

impl Categorization {
    /// Normalize the category against [`CATEGORIES`], case-insensitively.
    pub fn validate(self) -> Result<Self, PipelineError> {
        let wanted = self.category.trim();
        CATEGORIES
            .iter()
            .find(|c| c.eq_ignore_ascii_case(wanted))
            .map(|c| Categorization {
                category: c.to_string(),
            })
            .ok_or_else(|| PipelineError::Validation(format!("unknown category {wanted:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub summary: String,
    #[serde(default)]
    pub headline: Option<String>,
}

impl Summary {
    pub fn validate(self) -> Result<Self, PipelineError> {
        if self.summary.trim().is_empty() {
            return Err(PipelineError::Validation("empty summary".to_string()));
        }
        Ok(self)
    }
}

/// A celebrity mentioned in an article.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Celebrity {
    pub name: String,
    /// What they are known for ("singer", "actor", ...).
    #[serde(default)]
    pub known_for: String,
    #[serde(default)]
    pub why_relevant: String,
}

/// Structured facts extracted from an article.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FactSheet {
    pub celebrities: Vec<Celebrity>,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FactSheet {
    /// Drop duplicate celebrities (by case-insensitive name), facts and tags.
    pub fn dedupe(self) -> Self {
        Self {
            celebrities: self
                .celebrities
                .into_iter()
                .filter(|c| !c.name.trim().is_empty())
                .unique_by(|c| c.name.trim().to_lowercase())
                .collect(),
            key_facts: self.key_facts.into_iter().unique().collect(),
            tags: self
                .tags
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .unique()
                .collect(),
        }
    }
}

/// One failed item in a job report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureRecord {
    pub fn new(id: &str, error: &PipelineError) -> Self {
        Self {
            id: id.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one job run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub collection: String,
    /// The date of the run in `YYYY-MM-DD` format.
    pub local_date: String,
    /// "morning", "afternoon", or "evening".
    pub time_of_day: String,
    pub local_time: String,
    pub dry_run: bool,
    pub summary: RunSummary,
    /// Store operations committed.
    pub written: usize,
    pub failures: Vec<FailureRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(fields: serde_json::Value) -> Document {
        Document {
            id: "doc-1".to_string(),
            fields: serde_json::from_value(fields).unwrap(),
        }
    }

    #[test]
    fn test_article_from_document() {
        let article = Article::from_document(&doc(json!({
            "title": "Pop star announces tour",
            "content": "  The tour starts in May.  ",
            "source": "https://www.tmz.com/2025/05/06/tour"
        })))
        .unwrap();
        assert_eq!(article.id, "doc-1");
        assert_eq!(article.content, "The tour starts in May.");
        assert_eq!(article.source_tag(), Some("tmz".to_string()));
    }

    #[test]
    fn test_article_without_content_is_invalid() {
        let err = Article::from_document(&doc(json!({"title": "Empty", "content": "   "}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(Article::from_document(&doc(json!({"title": "No body"}))).is_err());
    }

    #[test]
    fn test_source_tag_missing_or_bad() {
        let mut article = Article::from_document(&doc(json!({"content": "x"}))).unwrap();
        assert_eq!(article.source_tag(), None);
        article.source = Some("not a url".to_string());
        assert_eq!(article.source_tag(), None);
        article.source = Some("https://localhost/a".to_string());
        assert_eq!(article.source_tag(), None);
    }

    #[test]
    fn test_categorization_validation() {
        let ok = Categorization {
            category: " film & tv ".to_string(),
        }
        .validate()
        .unwrap();
        assert_eq!(ok.category, "Film & TV");

        let bad = Categorization {
            category: "Astrology".to_string(),
        };
        assert!(matches!(bad.validate(), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_summary_parsing_and_validation() {
        let summary: Summary = serde_json::from_str(r#"{"summary": "They married in Rome."}"#).unwrap();
        assert_eq!(summary.headline, None);
        assert!(summary.validate().is_ok());

        let empty: Summary = serde_json::from_str(r#"{"summary": " ", "headline": "x"}"#).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_fact_sheet_dedupe() {
        let sheet: FactSheet = serde_json::from_value(json!({
            "celebrities": [
                {"name": "Taylor Swift", "knownFor": "singer"},
                {"name": "taylor swift", "knownFor": "songwriter"},
                {"name": "Travis Kelce", "whyRelevant": "boyfriend"},
                {"name": "  "}
            ],
            "keyFacts": ["Tour extended", "Tour extended"],
            "tags": ["Music", "music ", "NFL"]
        }))
        .unwrap();

        let sheet = sheet.dedupe();
        let names: Vec<_> = sheet.celebrities.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Taylor Swift", "Travis Kelce"]);
        assert_eq!(sheet.celebrities[0].known_for, "singer");
        assert_eq!(sheet.key_facts, vec!["Tour extended"]);
        assert_eq!(sheet.tags, vec!["music", "nfl"]);
    }

    #[test]
    fn test_failure_record() {
        let err = PipelineError::Parse("EOF while parsing".to_string());
        let record = FailureRecord::new("a7", &err);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "a7");
        assert_eq!(json["kind"], "permanent");
        assert!(json["message"].as_str().unwrap().contains("EOF"));
    }
}
