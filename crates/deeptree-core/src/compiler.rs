//! Bottom-up report compilation over a fully processed question tree.

use std::fmt::Write as _;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::capabilities::{DynTextGenerator, GenerationParams, Purpose};
use crate::error::ResearchError;
use crate::model::{
    Coverage, NodeFinding, QuestionNode, ResearchReport, SourceFinding, SourceStatus, tree_stats,
};
use crate::policy::CallPolicy;
use crate::text::truncate_chars;

const SYNTHESIS_TEMPERATURE: f32 = 0.7;

#[derive(Clone)]
pub struct ReportCompiler {
    generator: DynTextGenerator,
    policy: CallPolicy,
    summary_chars: usize,
}

impl ReportCompiler {
    pub fn new(generator: DynTextGenerator, policy: CallPolicy, summary_chars: usize) -> Self {
        Self {
            generator,
            policy,
            summary_chars,
        }
    }

    /// Merge findings bottom-up and synthesize the report.
    ///
    /// A failed synthesis call degrades to locally rendered text; only
    /// cancellation (or a tree with open records) is an error.
    #[instrument(skip(self, tree, cancel), fields(roots = tree.len()))]
    pub async fn compile(
        &self,
        topic: &str,
        tree: &[QuestionNode],
        cancel: &CancellationToken,
    ) -> Result<ResearchReport, ResearchError> {
        if !tree.iter().all(QuestionNode::all_sources_terminal) {
            return Err(ResearchError::Systemic(
                "report compilation requires every source to be terminal".into(),
            ));
        }

        let findings: Vec<NodeFinding> = tree.iter().map(merge_findings).collect();
        let digest = render_digest(topic, &findings);
        let mut degraded = false;

        let analysis = match self
            .synthesize(
                "report_analysis",
                Purpose::ReportAnalysis,
                analysis_prompt(topic, &digest),
                cancel,
            )
            .await
        {
            Ok(analysis) => analysis,
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(err) => {
                warn!(error = %err, "structured analysis failed; using findings digest");
                degraded = true;
                digest.clone()
            }
        };

        let detailed_analysis = match self
            .synthesize(
                "report_narrative",
                Purpose::ReportNarrative,
                narrative_prompt(topic, &analysis, &findings),
                cancel,
            )
            .await
        {
            Ok(narrative) => narrative,
            Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
            Err(err) => {
                warn!(error = %err, "narrative synthesis failed; rendering local report");
                degraded = true;
                render_fallback_report(topic, &findings, &analysis)
            }
        };

        let mut stats = tree_stats(tree);
        stats.insufficient = findings.iter().map(NodeFinding::insufficient_count).sum();
        info!(
            questions = stats.questions,
            analyzed = stats.analyzed,
            failed = stats.failed,
            insufficient = stats.insufficient,
            degraded,
            "report compiled"
        );

        Ok(ResearchReport {
            topic: topic.to_string(),
            tree: tree.to_vec(),
            findings,
            summary: truncate_chars(detailed_analysis.trim(), self.summary_chars),
            detailed_analysis,
            stats,
            degraded,
        })
    }

    async fn synthesize(
        &self,
        operation: &'static str,
        purpose: Purpose,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<String, ResearchError> {
        let params = GenerationParams::new(purpose).with_temperature(SYNTHESIS_TEMPERATURE);
        let text = self
            .policy
            .call(operation, cancel, || self.generator.generate(&prompt, &params))
            .await?;
        if text.trim().is_empty() {
            return Err(ResearchError::Provider(format!("{operation} returned no text")));
        }
        Ok(text)
    }
}

/// Post-order merge: children are merged before their parent, and a node's
/// coverage depends only on its own sources.
pub fn merge_findings(node: &QuestionNode) -> NodeFinding {
    let children: Vec<NodeFinding> = node.children.iter().map(merge_findings).collect();

    let sources: Vec<SourceFinding> = node
        .sources
        .iter()
        .filter(|source| source.status == SourceStatus::Analyzed)
        .filter_map(|source| {
            let analysis = source.analysis.as_ref()?;
            Some(SourceFinding {
                title: source.title.clone(),
                url: source.url.clone(),
                relevance: analysis.relevance,
                finding: analysis.finding.clone(),
                evidence: analysis.evidence.clone(),
            })
        })
        .collect();
    let failed_sources = node
        .sources
        .iter()
        .filter(|source| source.status == SourceStatus::Failed)
        .count();

    let coverage = if !sources.is_empty() {
        Coverage::Covered {
            usable_sources: sources.len(),
        }
    } else if let Some(error) = &node.retrieval_error {
        Coverage::InsufficientData {
            reason: format!("search failed: {}", error.message),
        }
    } else if node.sources.is_empty() {
        Coverage::InsufficientData {
            reason: "no sources found".into(),
        }
    } else {
        Coverage::InsufficientData {
            reason: format!("all {} sources failed", node.sources.len()),
        }
    };

    NodeFinding {
        question_id: node.id.clone(),
        question: node.text.clone(),
        depth: node.depth,
        coverage,
        sources,
        failed_sources,
        children,
    }
}

/// Plain-text rendering of the merged findings, used as synthesis input and
/// as the degraded analysis.
pub fn render_digest(topic: &str, findings: &[NodeFinding]) -> String {
    let mut out = format!("Research topic: {topic}\n");
    for finding in findings {
        write_digest_node(&mut out, finding);
    }
    out
}

fn write_digest_node(out: &mut String, node: &NodeFinding) {
    let indent = "  ".repeat(node.depth);
    let _ = writeln!(out, "\n{indent}[{}] {}", node.question_id, node.question);
    match &node.coverage {
        Coverage::Covered { usable_sources } => {
            let _ = writeln!(
                out,
                "{indent}  Coverage: {usable_sources} usable source(s), {} failed",
                node.failed_sources
            );
        }
        Coverage::InsufficientData { reason } => {
            let _ = writeln!(out, "{indent}  Insufficient data: {reason}");
        }
    }
    for source in &node.sources {
        let _ = writeln!(
            out,
            "{indent}  - (relevance {}/10) {} <{}>: {}",
            source.relevance, source.title, source.url, source.finding
        );
        if let Some(evidence) = &source.evidence {
            let _ = writeln!(out, "{indent}    Evidence: {evidence}");
        }
    }
    for child in &node.children {
        write_digest_node(out, child);
    }
}

fn analysis_prompt(topic: &str, digest: &str) -> String {
    format!(
        "Analyze the following research data.\n\
         Topic: {topic}\n\n\
         Questions and findings:\n{digest}\n\
         Provide a structured analysis covering:\n\
         - Main themes and patterns\n\
         - Conflicting information\n\
         - Data gaps, including questions marked as insufficient data\n\
         - Credibility of sources\n\
         Be accurate and thorough, weigh arguments over authority, and consider \
         contrarian ideas alongside the conventional view."
    )
}

fn narrative_prompt(topic: &str, analysis: &str, findings: &[NodeFinding]) -> String {
    let main_questions = findings
        .iter()
        .map(|finding| format!("{}. {}", finding.question_id, finding.question))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Based on the analysis below, write a comprehensive research report.\n\
         Topic: {topic}\n\n\
         Main questions:\n{main_questions}\n\n\
         Analysis:\n{analysis}\n\n\
         Structure the report with these sections:\n\
         1. Executive Summary\n\
         2. Key Findings for each main question\n\
         3. Detailed Analysis with source attributions\n\
         4. Conclusions and Implications\n\
         State plainly where a question had insufficient data."
    )
}

/// Report assembled without the generator.
pub fn render_fallback_report(topic: &str, findings: &[NodeFinding], analysis: &str) -> String {
    let evidence: usize = findings.iter().map(NodeFinding::evidence_count).sum();
    let insufficient: usize = findings.iter().map(NodeFinding::insufficient_count).sum();

    let mut out = format!("# Research report: {topic}\n\n## Executive Summary\n\n");
    let _ = writeln!(
        out,
        "{} main question(s) investigated with {evidence} usable source(s); {insufficient} question(s) had insufficient data.",
        findings.len()
    );

    out.push_str("\n## Key Findings\n");
    for finding in findings {
        let _ = writeln!(out, "\n### {}. {}\n", finding.question_id, finding.question);
        match &finding.coverage {
            Coverage::InsufficientData { reason } if finding.evidence_count() == 0 => {
                let _ = writeln!(out, "Insufficient data: {reason}.");
            }
            _ => write_key_findings(&mut out, finding),
        }
    }

    out.push_str("\n## Detailed Analysis\n\n");
    out.push_str(analysis.trim());
    out.push_str("\n\n## Conclusions\n\n");
    if insufficient > 0 {
        out.push_str(
            "Some questions could not be answered from the retrieved sources and need further research.\n",
        );
    } else {
        out.push_str("Every question was supported by at least one analyzed source.\n");
    }
    out
}

fn write_key_findings(out: &mut String, node: &NodeFinding) {
    for source in &node.sources {
        let _ = writeln!(out, "- {} ({})", source.finding, source.url);
    }
    for child in &node.children {
        write_key_findings(out, child);
    }
}
