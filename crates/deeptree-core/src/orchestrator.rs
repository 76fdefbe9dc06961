//! End-to-end research pipeline for one request.
//!
//! Drives the state machine `Initializing → ExpandingQuestions → Retrieving →
//! Processing → Compiling → Done`, with `Failed` for validation and systemic
//! errors and `Cancelled` when the request token fires. Every node is moved
//! into its own task for retrieval and processing and moved back on join, so
//! the tree needs no locks.

use std::future::Future;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capabilities::Capabilities;
use crate::compiler::ReportCompiler;
use crate::config::{Config, EngineConfig, RetryConfig};
use crate::error::{ErrorKind, ResearchError};
use crate::events::{EventCollector, Phase};
use crate::metrics;
use crate::model::{QuestionNode, ResearchQuery, ResearchReport, tree_stats};
use crate::planner::QuestionTreeBuilder;
use crate::policy::CallPolicy;
use crate::processor::{ProcessorLimits, SourceProcessor};
use crate::retriever::SourceRetriever;

/// Where a run stopped, with the tree as it stood at that point.
#[derive(Debug)]
pub struct RunOutcome {
    pub phase: Phase,
    pub tree: Vec<QuestionNode>,
    pub result: Result<ResearchReport, ResearchError>,
}

impl RunOutcome {
    pub fn into_result(self) -> Result<ResearchReport, ResearchError> {
        self.result
    }
}

pub struct Orchestrator {
    engine: EngineConfig,
    policy: CallPolicy,
    builder: QuestionTreeBuilder,
    retriever: SourceRetriever,
    processor: SourceProcessor,
    compiler: ReportCompiler,
    events: Option<EventCollector>,
}

impl Orchestrator {
    pub fn new(
        engine: EngineConfig,
        retry: RetryConfig,
        capabilities: Capabilities,
    ) -> Result<Self, ResearchError> {
        engine.validate()?;
        let policy = CallPolicy::from_config(&engine, &retry);
        let Capabilities {
            generator,
            search,
            extractor,
        } = capabilities;

        Ok(Self {
            builder: QuestionTreeBuilder::new(generator.clone(), policy.clone(), engine.fanout),
            retriever: SourceRetriever::new(search, policy.clone(), engine.min_snippet_chars),
            processor: SourceProcessor::new(
                extractor,
                generator.clone(),
                policy.clone(),
                ProcessorLimits::from(&engine),
            ),
            compiler: ReportCompiler::new(generator, policy.clone(), engine.summary_chars),
            policy,
            engine,
            events: None,
        })
    }

    /// Build the HTTP-backed capabilities described by `config`.
    #[cfg(feature = "http-providers")]
    pub fn from_config(config: &Config) -> Result<Self, ResearchError> {
        let capabilities = crate::providers::build_capabilities(config)?;
        Self::new(config.engine.clone(), config.retry.clone(), capabilities)
    }

    /// Use caller-supplied capabilities with the limits from `config`.
    pub fn with_capabilities(
        config: &Config,
        capabilities: Capabilities,
    ) -> Result<Self, ResearchError> {
        Self::new(config.engine.clone(), config.retry.clone(), capabilities)
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.processor = self.processor.clone().with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Reject a query before any capability is touched.
    pub fn validate(&self, query: &ResearchQuery) -> Result<(), ResearchError> {
        if query.topic.trim().is_empty() {
            return Err(ResearchError::Validation("topic must not be blank".into()));
        }
        if query.max_questions == 0 {
            return Err(ResearchError::Validation(
                "max_questions must be at least 1".into(),
            ));
        }
        if query.max_questions > self.engine.max_root_questions {
            return Err(ResearchError::Validation(format!(
                "max_questions must be at most {}",
                self.engine.max_root_questions
            )));
        }
        if query.depth > self.engine.max_depth {
            return Err(ResearchError::Validation(format!(
                "depth must be at most {}",
                self.engine.max_depth
            )));
        }
        Ok(())
    }

    pub async fn run(&self, query: &ResearchQuery) -> Result<ResearchReport, ResearchError> {
        self.run_with_cancel(query, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        query: &ResearchQuery,
        cancel: CancellationToken,
    ) -> Result<ResearchReport, ResearchError> {
        self.execute(query, cancel).await.into_result()
    }

    /// Run the whole pipeline and report the final phase alongside the result.
    #[tracing::instrument(
        skip_all,
        fields(topic = %query.topic, depth = query.depth, max_questions = query.max_questions)
    )]
    pub async fn execute(&self, query: &ResearchQuery, cancel: CancellationToken) -> RunOutcome {
        let mut run = Run {
            phase: Phase::Initializing,
            started: Instant::now(),
            events: self.events.as_ref(),
        };
        info!("research request accepted");

        if let Err(err) = self.validate(query) {
            return run.fail(Vec::new(), err);
        }

        run.enter(Phase::ExpandingQuestions);
        let topic = query.topic.trim();
        let roots = match self
            .builder
            .expand(topic, query.max_questions, query.depth, &cancel)
            .await
        {
            Ok(roots) => roots,
            Err(err) => return run.fail(Vec::new(), err),
        };
        let questions: usize = roots.iter().map(QuestionNode::node_count).sum();
        info!(roots = roots.len(), questions, "question tree expanded");
        if let Some(events) = &self.events {
            events.tree_expanded(roots.len(), questions);
        }

        run.enter(Phase::Retrieving);
        let roots = self.retrieve_all(roots, &cancel).await;
        if cancel.is_cancelled() {
            return run.cancel(roots);
        }

        run.enter(Phase::Processing);
        let mut roots = self.process_all(roots, &cancel).await;
        if cancel.is_cancelled() {
            return run.cancel(roots);
        }
        let sealed: usize = roots
            .iter_mut()
            .map(|root| {
                root.seal_unfinished(ErrorKind::Internal, "source processing did not complete")
            })
            .sum();
        if sealed > 0 {
            warn!(sealed, "sealed unfinished source records");
        }

        run.enter(Phase::Compiling);
        match self.compiler.compile(topic, &roots, &cancel).await {
            Ok(report) => run.done(roots, report),
            Err(ResearchError::Cancelled) => run.cancel(roots),
            Err(err) => run.fail(roots, err),
        }
    }

    async fn retrieve_all(
        &self,
        roots: Vec<QuestionNode>,
        cancel: &CancellationToken,
    ) -> Vec<QuestionNode> {
        let retriever = self.retriever.clone();
        let events = self.events.clone();
        let cancel = cancel.clone();
        let num_results = self.engine.results_per_question;

        for_each_node(roots, move |mut node| {
            let retriever = retriever.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            async move {
                match retriever.retrieve(&node.text, num_results, &cancel).await {
                    Ok(sources) => node.sources = sources,
                    Err(err) => {
                        if !matches!(err, ResearchError::Cancelled) {
                            warn!(question_id = %node.id, error = %err, "source retrieval failed");
                        }
                        node.retrieval_error = Some(err.detail());
                    }
                }
                if let Some(events) = &events {
                    events.node_retrieved(
                        &node.id,
                        node.sources.len(),
                        node.retrieval_error.clone(),
                    );
                }
                node
            }
        })
        .await
    }

    async fn process_all(
        &self,
        roots: Vec<QuestionNode>,
        cancel: &CancellationToken,
    ) -> Vec<QuestionNode> {
        let processor = self.processor.clone();
        let cancel = cancel.clone();

        for_each_node(roots, move |mut node| {
            let processor = processor.clone();
            let cancel = cancel.clone();
            async move {
                let sources = std::mem::take(&mut node.sources);
                node.sources = processor
                    .process_all(&node.id, &node.text, sources, &cancel)
                    .await;
                node
            }
        })
        .await
    }
}

/// Bookkeeping for one `execute` call.
struct Run<'a> {
    phase: Phase,
    started: Instant,
    events: Option<&'a EventCollector>,
}

impl Run<'_> {
    fn enter(&mut self, next: Phase) {
        info!(from = self.phase.as_str(), to = next.as_str(), "phase transition");
        if let Some(events) = self.events {
            events.phase_changed(self.phase, next);
        }
        self.phase = next;
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn done(mut self, tree: Vec<QuestionNode>, report: ResearchReport) -> RunOutcome {
        self.enter(Phase::Done);
        let duration_ms = self.elapsed_ms();
        metrics::record_request("done", duration_ms);
        if let Some(events) = self.events {
            events.completed(report.stats, report.degraded, duration_ms);
        }
        info!(duration_ms, degraded = report.degraded, "research request completed");
        RunOutcome {
            phase: self.phase,
            tree,
            result: Ok(report),
        }
    }

    fn fail(mut self, tree: Vec<QuestionNode>, err: ResearchError) -> RunOutcome {
        if matches!(err, ResearchError::Cancelled) {
            return self.cancel(tree);
        }
        self.enter(Phase::Failed);
        let duration_ms = self.elapsed_ms();
        metrics::record_request("failed", duration_ms);
        match err {
            ResearchError::Validation(_) => info!(error = %err, "research request rejected"),
            _ => error!(error = %err, duration_ms, "research request failed"),
        }
        RunOutcome {
            phase: self.phase,
            tree,
            result: Err(err),
        }
    }

    fn cancel(mut self, mut tree: Vec<QuestionNode>) -> RunOutcome {
        let sealed: usize = tree
            .iter_mut()
            .map(|root| root.seal_unfinished(ErrorKind::Cancelled, "request cancelled"))
            .sum();
        self.enter(Phase::Cancelled);
        let duration_ms = self.elapsed_ms();
        metrics::record_request("cancelled", duration_ms);
        let stats = tree_stats(&tree);
        warn!(
            sealed,
            questions = stats.questions,
            analyzed = stats.analyzed,
            duration_ms,
            "research request cancelled"
        );
        RunOutcome {
            phase: self.phase,
            tree,
            result: Err(ResearchError::Cancelled),
        }
    }
}

/// Apply `work` to every node of the forest, one spawned task per node.
///
/// Nodes are detached from their children, handed to their task by value and
/// reassembled in the original shape once every task has joined. A task that
/// panics leaves its node as it was before the task started.
async fn for_each_node<F, Fut>(roots: Vec<QuestionNode>, work: F) -> Vec<QuestionNode>
where
    F: Fn(QuestionNode) -> Fut,
    Fut: Future<Output = QuestionNode> + Send + 'static,
{
    let mut detached = Vec::new();
    for root in roots {
        detach(root, &mut detached);
    }

    let handles: Vec<_> = detached
        .into_iter()
        .map(|(node, child_count)| {
            let fallback = node.clone();
            (tokio::spawn(work(node)), fallback, child_count)
        })
        .collect();

    let mut finished = Vec::with_capacity(handles.len());
    for (handle, fallback, child_count) in handles {
        let node = match handle.await {
            Ok(node) => node,
            Err(join_err) => {
                error!(question_id = %fallback.id, error = %join_err, "node task aborted");
                fallback
            }
        };
        finished.push((node, child_count));
    }

    let mut nodes = finished.into_iter();
    let mut roots = Vec::new();
    while let Some(root) = reattach(&mut nodes) {
        roots.push(root);
    }
    roots
}

/// Pre-order flattening; each entry remembers how many children it had.
fn detach(mut node: QuestionNode, out: &mut Vec<(QuestionNode, usize)>) {
    let children = std::mem::take(&mut node.children);
    out.push((node, children.len()));
    for child in children {
        detach(child, out);
    }
}

fn reattach<I>(nodes: &mut I) -> Option<QuestionNode>
where
    I: Iterator<Item = (QuestionNode, usize)>,
{
    let (mut node, child_count) = nodes.next()?;
    for _ in 0..child_count {
        if let Some(child) = reattach(nodes) {
            node.children.push(child);
        }
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forest() -> Vec<QuestionNode> {
        let mut first = QuestionNode::new("1", "a", 0);
        let mut child = QuestionNode::new("1.1", "b", 1);
        child.children.push(QuestionNode::new("1.1.1", "c", 2));
        first.children.push(child);
        first.children.push(QuestionNode::new("1.2", "d", 1));
        vec![first, QuestionNode::new("2", "e", 0)]
    }

    #[tokio::test]
    async fn for_each_node_preserves_shape() {
        let visited = for_each_node(forest(), |mut node| async move {
            node.text = format!("{}!", node.text);
            node
        })
        .await;

        assert_eq!(visited.len(), 2);
        let mut ids = Vec::new();
        for root in &visited {
            root.walk(&mut |node| {
                assert!(node.text.ends_with('!'));
                ids.push(node.id.clone());
            });
        }
        assert_eq!(ids, vec!["1", "1.1", "1.1.1", "1.2", "2"]);
    }

    #[tokio::test]
    async fn panicking_node_task_keeps_original_node() {
        let visited = for_each_node(forest(), |mut node| async move {
            if node.id == "1.1" {
                panic!("node task crashed");
            }
            node.text.push('!');
            node
        })
        .await;

        let crashed = &visited[0].children[0];
        assert_eq!(crashed.text, "b");
        assert_eq!(crashed.children[0].text, "c!");
    }
}
