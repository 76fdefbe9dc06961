//! End-to-end runs of the orchestrator against the deterministic stubs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deeptree_core::stub::{EchoExtractor, Reply, ScriptedGenerator, StaticSearch};
use deeptree_core::{
    CancellationToken, Capabilities, ContentExtractor, Coverage, EngineConfig, ErrorKind,
    EventCollector, Orchestrator, Phase, Purpose, QuestionNode, ResearchError, ResearchEvent,
    ResearchQuery, RetryConfig, SearchHit, SourceStatus,
};

fn engine() -> EngineConfig {
    EngineConfig {
        fanout: 2,
        max_depth: 3,
        max_root_questions: 5,
        results_per_question: 2,
        min_snippet_chars: 20,
        max_content_chars: 500,
        max_finding_chars: 200,
        extract_max_tokens: 200,
        summary_chars: 300,
        max_concurrent_calls: 4,
        call_timeout_ms: 5_000,
        extract_timeout_ms: 10_000,
    }
}

fn retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    }
}

fn two_root_script() -> ScriptedGenerator {
    ScriptedGenerator::new()
        .on(Purpose::RootQuestions, Reply::text("1. Alpha?\n2. Beta?"))
        .on(Purpose::SubQuestions, Reply::text("- Deeper?"))
}

fn orchestrator(
    generator: ScriptedGenerator,
    search: StaticSearch,
    extractor: EchoExtractor,
) -> Orchestrator {
    orchestrator_with(Arc::new(generator), Arc::new(search), Arc::new(extractor))
}

fn orchestrator_with(
    generator: Arc<ScriptedGenerator>,
    search: Arc<StaticSearch>,
    extractor: Arc<dyn ContentExtractor>,
) -> Orchestrator {
    Orchestrator::new(
        engine(),
        retry(),
        Capabilities::new(generator, search, extractor),
    )
    .expect("engine config is valid")
}

fn leaves(roots: &[QuestionNode]) -> Vec<&QuestionNode> {
    let mut out = Vec::new();
    for root in roots {
        root.walk(&mut |node| {
            if node.is_leaf() {
                out.push(node);
            }
        });
    }
    out
}

#[tokio::test]
async fn two_roots_one_child_each_with_two_sources_per_leaf() {
    let orchestrator = orchestrator(
        two_root_script(),
        StaticSearch::new().with_default_hits(2),
        EchoExtractor::new(),
    );

    let report = orchestrator
        .run(&ResearchQuery::new("X", 1, 2))
        .await
        .unwrap();

    assert_eq!(report.tree.len(), 2);
    for root in &report.tree {
        assert_eq!(root.children.len(), 1);
        assert!(root.children[0].is_leaf());
    }
    let leaves = leaves(&report.tree);
    assert_eq!(leaves.len(), 2);
    for leaf in leaves {
        assert_eq!(leaf.sources.len(), 2);
        assert!(
            leaf.sources
                .iter()
                .all(|source| source.status == SourceStatus::Analyzed)
        );
    }
    assert!(!report.degraded);
    assert_eq!(report.stats.questions, 4);
}

#[tokio::test]
async fn failed_search_on_one_root_leaves_sibling_untouched() {
    let orchestrator = orchestrator(
        two_root_script(),
        StaticSearch::new().with_default_hits(2).failing_for("Beta?"),
        EchoExtractor::new(),
    );

    let report = orchestrator
        .run(&ResearchQuery::new("X", 1, 2))
        .await
        .unwrap();

    let (first, second) = (&report.tree[0], &report.tree[1]);
    assert_eq!(first.sources.len(), 2);
    assert!(first.retrieval_error.is_none());
    assert!(
        first
            .sources
            .iter()
            .all(|source| source.status == SourceStatus::Analyzed)
    );

    assert!(second.sources.is_empty());
    assert_eq!(second.retrieval_error.as_ref().unwrap().kind, ErrorKind::Search);
    assert!(matches!(report.findings[0].coverage, Coverage::Covered { .. }));
    assert!(report.findings[1].coverage.is_insufficient());
    // The child of the failed root still searched normally.
    assert_eq!(second.children[0].sources.len(), 2);
}

#[tokio::test]
async fn short_snippets_are_filtered_in_relative_order() {
    let long = "a snippet long enough to survive the filter";
    let hits = vec![
        SearchHit::new("r1", "https://r/1", "short"),
        SearchHit::new("r2", "https://r/2", long),
        SearchHit::new("r3", "https://r/3", "tiny"),
        SearchHit::new("r4", "https://r/4", long),
        SearchHit::new("r5", "https://r/5", "nope"),
    ];
    let generator = ScriptedGenerator::new().on(Purpose::RootQuestions, Reply::text("Only?"));
    let orchestrator = orchestrator(
        generator,
        StaticSearch::new().with_results("Only?", hits),
        EchoExtractor::new(),
    );

    let report = orchestrator
        .run(&ResearchQuery::new("X", 0, 1))
        .await
        .unwrap();

    let urls: Vec<_> = report.tree[0]
        .sources
        .iter()
        .map(|source| source.url.as_str())
        .collect();
    assert_eq!(urls, vec!["https://r/2", "https://r/4"]);
}

#[tokio::test]
async fn identical_runs_produce_identical_reports() {
    let run = || async {
        orchestrator(
            ScriptedGenerator::new().with_jitter(5),
            StaticSearch::new().with_jitter(5),
            EchoExtractor::new().with_jitter(5),
        )
        .run(&ResearchQuery::new("battery recycling", 2, 3))
        .await
        .unwrap()
    };

    let first = run().await;
    let second = run().await;
    assert_eq!(first.tree, second.tree);
    assert_eq!(first.findings, second.findings);
    assert_eq!(first.detailed_analysis, second.detailed_analysis);
    assert_eq!(first.summary, second.summary);
}

#[tokio::test]
async fn sources_keep_retrieval_order_under_random_completion() {
    let orchestrator = orchestrator(
        ScriptedGenerator::new().with_jitter(15),
        StaticSearch::new().with_default_hits(6),
        EchoExtractor::new().with_jitter(40),
    );
    let wanted = engine().results_per_question;

    let report = orchestrator
        .run(&ResearchQuery::new("grid storage", 1, 3))
        .await
        .unwrap();

    for root in &report.tree {
        root.walk(&mut |node| {
            let expected: Vec<_> =
                StaticSearch::generated_hits(&node.text, wanted)
                    .into_iter()
                    .map(|hit| hit.link)
                    .collect();
            let actual: Vec<_> = node.sources.iter().map(|s| s.url.clone()).collect();
            assert_eq!(actual, expected, "question {}", node.id);
        });
    }
}

#[tokio::test]
async fn question_with_all_sources_failing_is_insufficient() {
    let orchestrator = orchestrator(
        two_root_script(),
        StaticSearch::new().with_default_hits(2),
        EchoExtractor::new().failing_for("/alpha/", false),
    );

    let report = orchestrator
        .run(&ResearchQuery::new("X", 1, 2))
        .await
        .unwrap();

    let alpha = &report.tree[0];
    assert!(
        alpha
            .sources
            .iter()
            .all(|source| source.status == SourceStatus::Failed)
    );
    assert_eq!(
        report.findings[0].coverage,
        Coverage::InsufficientData {
            reason: "all 2 sources failed".into()
        }
    );
    assert!(matches!(report.findings[1].coverage, Coverage::Covered { .. }));
    assert!(matches!(
        report.findings[0].children[0].coverage,
        Coverage::Covered { .. }
    ));
    assert_eq!(report.stats.failed, 2);
    assert_eq!(report.stats.insufficient, 1);
}

#[tokio::test]
async fn tree_respects_depth_and_fanout_bounds() {
    let orchestrator = orchestrator(
        ScriptedGenerator::new(),
        StaticSearch::new(),
        EchoExtractor::new(),
    );
    let query = ResearchQuery::new("urban heat islands", 2, 3);

    let report = orchestrator.run(&query).await.unwrap();

    assert!(report.tree.len() <= query.max_questions);
    for root in &report.tree {
        root.walk(&mut |node| {
            assert!(node.depth <= query.depth);
            assert!(node.children.len() <= orchestrator.engine().fanout);
            assert!(node.sources.iter().all(|source| source.is_terminal()));
        });
    }
    assert_eq!(report.stats.questions, 3 + 3 * 2 + 3 * 2 * 2);
}

#[tokio::test]
async fn invalid_queries_never_reach_a_capability() {
    let generator = Arc::new(ScriptedGenerator::new());
    let search = Arc::new(StaticSearch::new());
    let extractor = Arc::new(EchoExtractor::new());
    let orchestrator = orchestrator_with(generator.clone(), search.clone(), extractor.clone());

    let invalid = [
        ResearchQuery::new("   ", 1, 2),
        ResearchQuery::new("X", 1, 0),
        ResearchQuery::new("X", 1, 6),
        ResearchQuery::new("X", 4, 2),
    ];
    for query in &invalid {
        let outcome = orchestrator.execute(query, CancellationToken::new()).await;
        assert_eq!(outcome.phase, Phase::Failed);
        assert!(
            matches!(outcome.result, Err(ResearchError::Validation(_))),
            "{query:?}"
        );
    }

    assert_eq!(generator.call_count(), 0);
    assert_eq!(search.call_count(), 0);
    assert_eq!(extractor.call_count(), 0);
}

#[tokio::test]
async fn root_generation_failure_is_systemic_after_all_attempts() {
    let generator = Arc::new(
        ScriptedGenerator::new().on(Purpose::RootQuestions, Reply::fail("model unavailable")),
    );
    let search = Arc::new(StaticSearch::new());
    let orchestrator =
        orchestrator_with(generator.clone(), search.clone(), Arc::new(EchoExtractor::new()));

    let outcome = orchestrator
        .execute(&ResearchQuery::new("X", 1, 2), CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, Phase::Failed);
    assert!(matches!(outcome.result, Err(ResearchError::Systemic(_))));
    assert_eq!(
        generator.calls_for(Purpose::RootQuestions),
        retry().max_retries + 1
    );
    assert_eq!(search.call_count(), 0);
}

#[tokio::test]
async fn transient_root_failures_are_retried() {
    let generator = Arc::new(ScriptedGenerator::new().on(
        Purpose::RootQuestions,
        Reply::FailTimes(2, "1. Recovered?".into()),
    ));
    let orchestrator = orchestrator_with(
        generator.clone(),
        Arc::new(StaticSearch::new()),
        Arc::new(EchoExtractor::new()),
    );

    let report = orchestrator
        .run(&ResearchQuery::new("X", 0, 2))
        .await
        .unwrap();

    assert_eq!(report.tree.len(), 1);
    assert_eq!(report.tree[0].text, "Recovered?");
    assert_eq!(generator.calls_for(Purpose::RootQuestions), 3);
}

#[tokio::test]
async fn synthesis_outage_still_returns_a_degraded_report() {
    let generator = two_root_script()
        .on(Purpose::ReportAnalysis, Reply::fail("overloaded"))
        .on(Purpose::ReportNarrative, Reply::fail("overloaded"));
    let orchestrator = orchestrator(generator, StaticSearch::new(), EchoExtractor::new());

    let report = orchestrator
        .run(&ResearchQuery::new("X", 1, 2))
        .await
        .unwrap();

    assert!(report.degraded);
    assert!(report.detailed_analysis.contains("## Executive Summary"));
    assert!(report.summary.chars().count() <= engine().summary_chars);
}

#[tokio::test]
async fn events_follow_the_state_machine() {
    let (events, mut receiver) = EventCollector::new();
    let orchestrator = orchestrator(two_root_script(), StaticSearch::new(), EchoExtractor::new())
        .with_events(events);

    orchestrator
        .run(&ResearchQuery::new("X", 1, 2))
        .await
        .unwrap();
    drop(orchestrator);

    let mut phases = Vec::new();
    let mut finished_sources = 0;
    let mut completed = false;
    while let Some(event) = receiver.recv().await {
        match event {
            ResearchEvent::PhaseChanged { to, .. } => phases.push(to),
            ResearchEvent::SourceFinished { .. } => finished_sources += 1,
            ResearchEvent::Completed { .. } => completed = true,
            _ => {}
        }
    }

    assert_eq!(
        phases,
        vec![
            Phase::ExpandingQuestions,
            Phase::Retrieving,
            Phase::Processing,
            Phase::Compiling,
            Phase::Done,
        ]
    );
    // 4 questions with 2 sources each.
    assert_eq!(finished_sources, 8);
    assert!(completed);
}

struct StalledExtractor;

#[async_trait]
impl ContentExtractor for StalledExtractor {
    async fn extract(
        &self,
        _url: &str,
        _instruction: &str,
        _max_tokens: usize,
    ) -> Result<String, ResearchError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok("too late".into())
    }
}

#[tokio::test]
async fn cancellation_leaves_no_open_records() {
    let orchestrator = orchestrator_with(
        Arc::new(two_root_script()),
        Arc::new(StaticSearch::new()),
        Arc::new(StalledExtractor),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = orchestrator
        .execute(&ResearchQuery::new("X", 1, 2), cancel)
        .await;

    assert_eq!(outcome.phase, Phase::Cancelled);
    assert!(matches!(outcome.result, Err(ResearchError::Cancelled)));
    assert!(!outcome.tree.is_empty());
    for root in &outcome.tree {
        root.walk(&mut |node| {
            for source in &node.sources {
                assert_eq!(source.status, SourceStatus::Failed);
                assert_eq!(source.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
            }
        });
    }
}

/// Records the highest number of extractions running at the same time.
#[derive(Default)]
struct PeakTrackingExtractor {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ContentExtractor for PeakTrackingExtractor {
    async fn extract(
        &self,
        url: &str,
        _instruction: &str,
        _max_tokens: usize,
    ) -> Result<String, ResearchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("Content of {url}."))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outbound_calls_never_exceed_the_global_limit() {
    let extractor = Arc::new(PeakTrackingExtractor::default());
    let orchestrator = Orchestrator::new(
        EngineConfig {
            max_concurrent_calls: 2,
            ..engine()
        },
        retry(),
        Capabilities::new(
            Arc::new(ScriptedGenerator::new()),
            Arc::new(StaticSearch::new()),
            extractor.clone(),
        ),
    )
    .unwrap();

    let report = orchestrator
        .run(&ResearchQuery::new("Grid storage", 1, 3))
        .await
        .unwrap();

    // 3 roots, 2 children each, 2 sources per question
    assert_eq!(report.stats.sources, 18);
    assert_eq!(report.stats.analyzed, 18);
    let peak = extractor.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in-flight extractions: {peak}");
    assert_eq!(orchestrator.policy().available_permits(), 2);
}

/// Never answers for URLs ending in `/2`.
#[derive(Default)]
struct HangingSecondSource {
    stalled_calls: AtomicUsize,
}

#[async_trait]
impl ContentExtractor for HangingSecondSource {
    async fn extract(
        &self,
        url: &str,
        _instruction: &str,
        _max_tokens: usize,
    ) -> Result<String, ResearchError> {
        if url.ends_with("/2") {
            self.stalled_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(format!("Content of {url}."))
    }
}

#[tokio::test]
async fn timed_out_source_fails_alone() {
    let extractor = Arc::new(HangingSecondSource::default());
    let orchestrator = Orchestrator::new(
        EngineConfig {
            call_timeout_ms: 100,
            extract_timeout_ms: 100,
            ..engine()
        },
        retry(),
        Capabilities::new(
            Arc::new(two_root_script()),
            Arc::new(StaticSearch::new()),
            extractor.clone(),
        ),
    )
    .unwrap();

    let report = orchestrator
        .run(&ResearchQuery::new("X", 0, 2))
        .await
        .unwrap();

    assert_eq!(report.tree.len(), 2);
    for root in &report.tree {
        let outcome: Vec<_> = root
            .sources
            .iter()
            .map(|s| (s.status, s.error.as_ref().map(|e| e.kind)))
            .collect();
        assert_eq!(
            outcome,
            vec![
                (SourceStatus::Analyzed, None),
                (SourceStatus::Failed, Some(ErrorKind::Timeout)),
            ],
            "question {}",
            root.text
        );
    }
    // every stalled source was attempted max_retries + 1 times
    assert_eq!(extractor.stalled_calls.load(Ordering::SeqCst), 2 * 3);
}
