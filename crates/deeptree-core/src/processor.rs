//! Per-source fetch and relevance analysis.
//!
//! Each source of a node runs in its own task; a failure (or panic) in one
//! task only ever touches that task's record.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::capabilities::{DynContentExtractor, DynTextGenerator, GenerationParams, Purpose};
use crate::config::EngineConfig;
use crate::error::{ErrorDetail, ErrorKind, ResearchError};
use crate::events::EventCollector;
use crate::metrics;
use crate::model::{SourceAnalysis, SourceRecord, SourceStatus};
use crate::policy::CallPolicy;
use crate::text::truncate_chars;

const ANALYSIS_TEMPERATURE: f32 = 0.2;
const MAX_RELEVANCE: u8 = 10;

static RELEVANCE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)relevance\**\s*(?:\(\s*0\s*-\s*10\s*\))?\s*\**\s*[:=]?\s*\**\s*(-?\d+(?:\.\d+)?)",
    )
    .expect("invalid relevance regex")
});
static FINDING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[\s*#\d.)-]*(?:key\s+)?finding\**\s*[:=]\s*\**\s*(.+)$")
        .expect("invalid finding regex")
});
static EVIDENCE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[\s*#\d.)-]*(?:main\s+)?evidence\**\s*[:=]\s*\**\s*(.+)$")
        .expect("invalid evidence regex")
});

/// Limits applied while processing one source.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorLimits {
    pub max_content_chars: usize,
    pub max_finding_chars: usize,
    pub extract_max_tokens: usize,
    /// Per-attempt budget for the extractor, which covers fetch and extraction.
    pub extract_timeout: Duration,
}

impl From<&EngineConfig> for ProcessorLimits {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            max_content_chars: engine.max_content_chars,
            max_finding_chars: engine.max_finding_chars,
            extract_max_tokens: engine.extract_max_tokens,
            extract_timeout: engine.extract_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct SourceProcessor {
    extractor: DynContentExtractor,
    generator: DynTextGenerator,
    policy: CallPolicy,
    limits: ProcessorLimits,
    events: Option<EventCollector>,
}

impl SourceProcessor {
    pub fn new(
        extractor: DynContentExtractor,
        generator: DynTextGenerator,
        policy: CallPolicy,
        limits: ProcessorLimits,
    ) -> Self {
        Self {
            extractor,
            generator,
            policy,
            limits,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    /// Drive `source` to a terminal status. Records that are already terminal
    /// are returned untouched.
    #[instrument(skip_all, fields(question_id = %question_id, url = %source.url))]
    pub async fn process(
        &self,
        question_id: &str,
        question: &str,
        mut source: SourceRecord,
        cancel: &CancellationToken,
    ) -> SourceRecord {
        if source.is_terminal() {
            return source;
        }
        let started = Instant::now();

        if let Err(err) = self.fetch_and_analyze(question, &mut source, cancel).await {
            debug!(error = %err, "source failed");
            let detail = err.detail();
            if source.mark_failed(detail.clone()).is_err() {
                source = source.failed_copy(detail);
            }
        }

        let elapsed = started.elapsed().as_millis() as u64;
        metrics::record_source(source.status, elapsed);
        if let Some(events) = &self.events {
            events.source_finished(question_id, &source.url, source.status, elapsed);
        }
        source
    }

    async fn fetch_and_analyze(
        &self,
        question: &str,
        source: &mut SourceRecord,
        cancel: &CancellationToken,
    ) -> Result<(), ResearchError> {
        let url = source.url.clone();
        let instruction = extraction_instruction(question);
        let max_tokens = self.limits.extract_max_tokens;

        let content = self
            .policy
            .with_timeout(self.limits.extract_timeout)
            .call("extract", cancel, || {
                self.extractor.extract(&url, &instruction, max_tokens)
            })
            .await?;
        let content = truncate_chars(content.trim(), self.limits.max_content_chars);
        if content.is_empty() {
            return Err(ResearchError::fetch(format!("no content extracted from {url}"), false));
        }
        let prompt = analysis_prompt(question, &content);
        source.mark_fetched(content)?;

        let params =
            GenerationParams::new(Purpose::SourceAnalysis).with_temperature(ANALYSIS_TEMPERATURE);
        let max_finding_chars = self.limits.max_finding_chars;
        let analysis = self
            .policy
            .call("analyze", cancel, || async {
                let raw = self.generator.generate(&prompt, &params).await?;
                parse_analysis(&raw, max_finding_chars)
            })
            .await?;

        source.mark_analyzed(analysis)
    }

    /// Process every source of one node concurrently, one task per source.
    /// The returned records are in the same order as `sources`.
    pub async fn process_all(
        &self,
        question_id: &str,
        question: &str,
        sources: Vec<SourceRecord>,
        cancel: &CancellationToken,
    ) -> Vec<SourceRecord> {
        let handles: Vec<_> = sources
            .iter()
            .cloned()
            .map(|source| {
                let processor = self.clone();
                let question_id = question_id.to_string();
                let question = question.to_string();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    processor
                        .process(&question_id, &question, source, &cancel)
                        .await
                })
            })
            .collect();

        let mut processed = Vec::with_capacity(handles.len());
        for (handle, original) in handles.into_iter().zip(sources) {
            match handle.await {
                Ok(record) => processed.push(record),
                Err(join_err) => {
                    error!(
                        question_id,
                        url = %original.url,
                        error = %join_err,
                        "source task aborted"
                    );
                    let detail = ErrorDetail::new(
                        ErrorKind::Internal,
                        format!("source task aborted: {join_err}"),
                    );
                    metrics::record_source(SourceStatus::Failed, 0);
                    processed.push(original.failed_copy(detail));
                }
            }
        }
        processed
    }
}

fn extraction_instruction(question: &str) -> String {
    format!(
        "Extract the facts, figures and statements from this page that help answer the question: {question}"
    )
}

fn analysis_prompt(question: &str, content: &str) -> String {
    format!(
        "Analyze the content below for the research question.\n\
         Question: {question}\n\
         Content:\n{content}\n\n\
         Respond with JSON only, in the form \
         {{\"relevance\": <integer 0-10>, \"finding\": \"<key finding in 1-2 sentences>\", \
         \"evidence\": \"<main supporting evidence in one sentence>\"}}"
    )
}

#[derive(Deserialize)]
struct RawAnalysis {
    relevance: serde_json::Value,
    #[serde(default)]
    finding: Option<String>,
    #[serde(default)]
    evidence: Option<String>,
}

/// Parse a generator answer into a [`SourceAnalysis`].
///
/// JSON (optionally fenced) is tried first, then `Relevance: N` style lines.
/// An answer without a relevance score is a retryable provider error.
pub fn parse_analysis(
    raw: &str,
    max_finding_chars: usize,
) -> Result<SourceAnalysis, ResearchError> {
    let (score, finding, evidence) = match parse_json(raw) {
        Some(parsed) => parsed,
        None => parse_lines(raw).ok_or_else(|| {
            warn!("analysis response carried no relevance score");
            ResearchError::Provider("analysis response carried no relevance score".into())
        })?,
    };

    let clean = |text: String| {
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| truncate_chars(trimmed, max_finding_chars))
    };

    Ok(SourceAnalysis {
        relevance: clamp_relevance(score),
        finding: finding.and_then(clean).unwrap_or_default(),
        evidence: evidence.and_then(clean),
    })
}

fn parse_json(raw: &str) -> Option<(f64, Option<String>, Option<String>)> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: RawAnalysis = serde_json::from_str(&raw[start..=end]).ok()?;
    let score = match &parsed.relevance {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().split('/').next()?.trim().parse().ok()?,
        _ => return None,
    };
    Some((score, parsed.finding, parsed.evidence))
}

fn parse_lines(raw: &str) -> Option<(f64, Option<String>, Option<String>)> {
    let score = RELEVANCE_LINE
        .captures(raw)?
        .get(1)?
        .as_str()
        .parse::<f64>()
        .ok()?;
    let capture = |re: &Regex| {
        re.captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim_end_matches('*').trim().to_string())
    };
    let finding = capture(&FINDING_LINE).or_else(|| {
        let rest: Vec<&str> = raw
            .lines()
            .filter(|line| !RELEVANCE_LINE.is_match(line) && !line.trim().is_empty())
            .collect();
        (!rest.is_empty()).then(|| rest.join(" "))
    });
    Some((score, finding, capture(&EVIDENCE_LINE)))
}

fn clamp_relevance(score: f64) -> u8 {
    if score.is_nan() {
        return 0;
    }
    score.round().clamp(0.0, f64::from(MAX_RELEVANCE)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::stub::{EchoExtractor, Reply, ScriptedGenerator};
    use std::sync::Arc;
    use std::time::Duration;

    fn limits() -> ProcessorLimits {
        ProcessorLimits {
            max_content_chars: 200,
            max_finding_chars: 40,
            extract_max_tokens: 100,
            extract_timeout: Duration::from_secs(5),
        }
    }

    fn processor(extractor: EchoExtractor, generator: ScriptedGenerator) -> SourceProcessor {
        let policy = CallPolicy::new(
            4,
            Duration::from_secs(5),
            RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            },
        );
        SourceProcessor::new(Arc::new(extractor), Arc::new(generator), policy, limits())
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"relevance\": 8, \"finding\": \"Costs fell.\", \"evidence\": \"IEA 2023\"}\n```";
        let analysis = parse_analysis(raw, 100).unwrap();
        assert_eq!(analysis.relevance, 8);
        assert_eq!(analysis.finding, "Costs fell.");
        assert_eq!(analysis.evidence.as_deref(), Some("IEA 2023"));
    }

    #[test]
    fn falls_back_to_line_patterns() {
        let raw = "1. Relevance: 7/10\n2. Key finding: Adoption doubled.\n3. Main evidence: survey data";
        let analysis = parse_analysis(raw, 100).unwrap();
        assert_eq!(analysis.relevance, 7);
        assert_eq!(analysis.finding, "Adoption doubled.");
        assert_eq!(analysis.evidence.as_deref(), Some("survey data"));
    }

    #[test]
    fn clamps_and_truncates() {
        let raw = r#"{"relevance": 42, "finding": "an extremely long finding that goes on and on"}"#;
        let analysis = parse_analysis(raw, 10).unwrap();
        assert_eq!(analysis.relevance, 10);
        assert_eq!(analysis.finding.chars().count(), 10);
        assert!(analysis.evidence.is_none());

        let negative = parse_analysis(r#"{"relevance": "-3"}"#, 10).unwrap();
        assert_eq!(negative.relevance, 0);
    }

    #[test]
    fn missing_score_is_retryable_provider_error() {
        let err = parse_analysis("This page is about cats.", 100).unwrap_err();
        assert!(matches!(err, ResearchError::Provider(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn successful_source_is_analyzed_with_truncated_content() {
        let generator = ScriptedGenerator::new().on(
            Purpose::SourceAnalysis,
            Reply::text(r#"{"relevance": 6, "finding": "ok", "evidence": "e"}"#),
        );
        let processor = processor(EchoExtractor::new(), generator);
        let record = processor
            .process(
                "1",
                "What changed?",
                SourceRecord::pending("t", "https://ok", "s"),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(record.status, SourceStatus::Analyzed);
        assert!(record.extracted_content.unwrap().chars().count() <= 200);
        assert_eq!(record.analysis.unwrap().relevance, 6);
    }

    #[tokio::test]
    async fn fetch_failure_marks_only_that_record() {
        let processor = processor(
            EchoExtractor::new().failing_for("/dead", false),
            ScriptedGenerator::new(),
        );
        let sources = vec![
            SourceRecord::pending("a", "https://x/a", "s"),
            SourceRecord::pending("dead", "https://x/dead", "s"),
            SourceRecord::pending("c", "https://x/c", "s"),
        ];
        let processed = processor
            .process_all("1", "q", sources, &CancellationToken::new())
            .await;

        let statuses: Vec<_> = processed.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![SourceStatus::Analyzed, SourceStatus::Failed, SourceStatus::Analyzed]
        );
        let error = processed[1].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Fetch);
    }

    #[tokio::test]
    async fn unparseable_analysis_fails_after_retries() {
        let generator =
            ScriptedGenerator::new().on(Purpose::SourceAnalysis, Reply::text("no score here"));
        let processor = processor(EchoExtractor::new(), generator);
        let record = processor
            .process(
                "1",
                "q",
                SourceRecord::pending("t", "https://ok", "s"),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(record.status, SourceStatus::Failed);
        assert!(record.extracted_content.is_some());
        assert_eq!(record.error.unwrap().kind, ErrorKind::Provider);
    }

    #[tokio::test]
    async fn panicking_task_yields_failed_record_in_place() {
        let processor = processor(
            EchoExtractor::new().panicking_for("/boom"),
            ScriptedGenerator::new(),
        );
        let sources = vec![
            SourceRecord::pending("boom", "https://x/boom", "snippet"),
            SourceRecord::pending("fine", "https://x/fine", "snippet"),
        ];
        let processed = processor
            .process_all("1", "q", sources, &CancellationToken::new())
            .await;

        assert_eq!(processed[0].url, "https://x/boom");
        assert_eq!(processed[0].status, SourceStatus::Failed);
        assert_eq!(processed[0].error.as_ref().unwrap().kind, ErrorKind::Internal);
        assert_eq!(processed[0].snippet, "snippet");
        assert_eq!(processed[1].status, SourceStatus::Analyzed);
    }
}
