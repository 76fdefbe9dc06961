//! Deterministic, in-process capability implementations.
//!
//! Used by the test suites and by the CLI's `--offline` mode. Every stub
//! answers from its script first and falls back to a canned response built
//! only from its inputs, so identical requests always produce identical trees
//! and reports.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::capabilities::{
    Capabilities, ContentExtractor, GenerationParams, Purpose, SearchHit, SearchProvider,
    TextGenerator,
};
use crate::error::ResearchError;

/// Unscripted stubs for all three capabilities, as used by offline runs.
pub fn offline_capabilities() -> Capabilities {
    Capabilities::new(
        Arc::new(ScriptedGenerator::new()),
        Arc::new(StaticSearch::new()),
        Arc::new(EchoExtractor::new()),
    )
}

/// Delay in `0..=max_ms` derived from `key`; stable across runs.
fn jitter(key: &str, max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % (max_ms + 1))
}

/// Canned reply of a scripted rule.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Fail with a retryable provider error on every attempt.
    Fail(String),
    /// Fail this many times, then answer with the text.
    FailTimes(usize, String),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Reply::Fail(message.into())
    }
}

struct Rule {
    purpose: Purpose,
    needle: Option<String>,
    reply: Reply,
    hits: AtomicUsize,
}

/// Scripted [`TextGenerator`]. Rules match on purpose and, optionally, on a
/// substring of the prompt; the first match wins.
#[derive(Default)]
pub struct ScriptedGenerator {
    rules: Vec<Rule>,
    max_jitter_ms: u64,
    calls: Mutex<Vec<(Purpose, String)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, purpose: Purpose, reply: Reply) -> Self {
        self.rules.push(Rule {
            purpose,
            needle: None,
            reply,
            hits: AtomicUsize::new(0),
        });
        self
    }

    pub fn on_prompt(mut self, purpose: Purpose, needle: impl Into<String>, reply: Reply) -> Self {
        self.rules.push(Rule {
            purpose,
            needle: Some(needle.into()),
            reply,
            hits: AtomicUsize::new(0),
        });
        self
    }

    /// Delay each answer by a prompt-derived amount up to `max_ms`.
    pub fn with_jitter(mut self, max_ms: u64) -> Self {
        self.max_jitter_ms = max_ms;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }

    pub fn calls_for(&self, purpose: Purpose) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|(p, _)| *p == purpose).count())
            .unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<(Purpose, String)> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn find_rule(&self, prompt: &str, purpose: Purpose) -> Option<&Rule> {
        self.rules.iter().find(|rule| {
            rule.purpose == purpose
                && rule
                    .needle
                    .as_deref()
                    .is_none_or(|needle| prompt.contains(needle))
        })
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ResearchError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((params.purpose, prompt.to_string()));
        }
        tokio::time::sleep(jitter(prompt, self.max_jitter_ms)).await;

        let Some(rule) = self.find_rule(prompt, params.purpose) else {
            return Ok(canned_text(prompt, params.purpose));
        };
        let attempt = rule.hits.fetch_add(1, Ordering::SeqCst);
        match &rule.reply {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail(message) => Err(ResearchError::Provider(message.clone())),
            Reply::FailTimes(times, _) if attempt < *times => Err(ResearchError::Provider(
                format!("scripted failure {} of {times}", attempt + 1),
            )),
            Reply::FailTimes(_, text) => Ok(text.clone()),
        }
    }
}

/// Value of the first `label:` line in `prompt`.
fn labelled_line<'a>(prompt: &'a str, label: &str) -> Option<&'a str> {
    prompt.lines().find_map(|line| {
        line.trim()
            .strip_prefix(label)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

fn canned_text(prompt: &str, purpose: Purpose) -> String {
    let subject = labelled_line(prompt, "Question")
        .or_else(|| labelled_line(prompt, "Topic"))
        .unwrap_or("the subject");
    match purpose {
        Purpose::RootQuestions => [
            "What is the current state of {s}?",
            "What are the main drivers behind {s}?",
            "Which risks and open problems affect {s}?",
            "How has {s} evolved historically?",
            "Which assumptions about {s} are contested?",
        ]
        .iter()
        .enumerate()
        .map(|(idx, template)| format!("{}. {}", idx + 1, template.replace("{s}", subject)))
        .collect::<Vec<_>>()
        .join("\n"),
        Purpose::SubQuestions => format!(
            "- What evidence supports: {subject}\n- What are the counterarguments to: {subject}\n- What remains unknown about: {subject}"
        ),
        Purpose::Extraction => format!("Extracted passage relevant to {subject}."),
        Purpose::SourceAnalysis => serde_json::json!({
            "relevance": 7,
            "finding": format!("The source addresses {subject}."),
            "evidence": "Offline stub evidence.",
        })
        .to_string(),
        Purpose::ReportAnalysis => format!(
            "Themes: recurring findings about {subject}.\nConflicts: none detected.\nGaps: questions marked insufficient data.\nCredibility: offline stub sources."
        ),
        Purpose::ReportNarrative => format!(
            "# Executive Summary\nOffline research report on {subject}.\n\n# Key Findings\nSee the findings tree.\n\n# Detailed Analysis\nGenerated without network access.\n\n# Conclusions\nNo live sources were consulted."
        ),
    }
}

/// [`SearchProvider`] serving fixed results per query substring, or
/// `default_hits` generated results for anything unscripted.
pub struct StaticSearch {
    results: Vec<(String, Vec<SearchHit>)>,
    failures: Vec<String>,
    default_hits: usize,
    max_jitter_ms: u64,
    calls: AtomicUsize,
}

impl Default for StaticSearch {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            failures: Vec::new(),
            default_hits: 3,
            max_jitter_ms: 0,
            calls: AtomicUsize::new(0),
        }
    }
}

impl StaticSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(mut self, needle: impl Into<String>, hits: Vec<SearchHit>) -> Self {
        self.results.push((needle.into(), hits));
        self
    }

    /// Queries containing `needle` fail with a search error.
    pub fn failing_for(mut self, needle: impl Into<String>) -> Self {
        self.failures.push(needle.into());
        self
    }

    pub fn with_default_hits(mut self, count: usize) -> Self {
        self.default_hits = count;
        self
    }

    pub fn with_jitter(mut self, max_ms: u64) -> Self {
        self.max_jitter_ms = max_ms;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Results the stub would serve for `query`, before the `limit` cap.
    pub fn generated_hits(query: &str, count: usize) -> Vec<SearchHit> {
        let slug: String = query
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
            .collect::<String>()
            .split_whitespace()
            .take(6)
            .collect::<Vec<_>>()
            .join("-")
            .to_lowercase();
        (1..=count)
            .map(|idx| {
                SearchHit::new(
                    format!("Result {idx} for {query}"),
                    format!("https://example.org/{slug}/{idx}"),
                    format!("Reference material number {idx} discussing {query} in detail."),
                )
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ResearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(jitter(query, self.max_jitter_ms)).await;

        if self.failures.iter().any(|needle| query.contains(needle)) {
            return Err(ResearchError::Search(format!(
                "search backend rejected query: {query}"
            )));
        }
        let mut hits = self
            .results
            .iter()
            .find(|(needle, _)| query.contains(needle.as_str()))
            .map(|(_, hits)| hits.clone())
            .unwrap_or_else(|| Self::generated_hits(query, self.default_hits));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// How an [`EchoExtractor`] treats a matching URL.
#[derive(Debug, Clone)]
enum UrlFault {
    Fetch { message: String, retryable: bool },
    Panic,
}

/// [`ContentExtractor`] that echoes the URL and instruction back as content.
#[derive(Default)]
pub struct EchoExtractor {
    faults: Vec<(String, UrlFault)>,
    max_jitter_ms: u64,
    calls: AtomicUsize,
}

impl EchoExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs containing `needle` fail to fetch.
    pub fn failing_for(mut self, needle: impl Into<String>, retryable: bool) -> Self {
        self.faults.push((
            needle.into(),
            UrlFault::Fetch {
                message: "HTTP 404 Not Found".into(),
                retryable,
            },
        ));
        self
    }

    /// URLs containing `needle` panic inside the extractor.
    pub fn panicking_for(mut self, needle: impl Into<String>) -> Self {
        self.faults.push((needle.into(), UrlFault::Panic));
        self
    }

    pub fn with_jitter(mut self, max_ms: u64) -> Self {
        self.max_jitter_ms = max_ms;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentExtractor for EchoExtractor {
    async fn extract(
        &self,
        url: &str,
        instruction: &str,
        max_tokens: usize,
    ) -> Result<String, ResearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(jitter(url, self.max_jitter_ms)).await;

        if let Some((_, fault)) = self.faults.iter().find(|(needle, _)| url.contains(needle)) {
            match fault {
                UrlFault::Fetch { message, retryable } => {
                    return Err(ResearchError::fetch(format!("{message}: {url}"), *retryable));
                }
                UrlFault::Panic => panic!("extractor crashed on {url}"),
            }
        }

        let content = format!("Content of {url}.\n{instruction}");
        Ok(crate::text::truncate_chars(&content, max_tokens.saturating_mul(4)))
    }
}
