//! Human-readable renderings of a finished report.

use std::fmt::Write as _;

use crate::model::{QuestionNode, ResearchReport, SourceStatus};

/// Markdown outline of the question tree with per-source status.
pub fn render_outline(report: &ResearchReport) -> String {
    let mut out = format!("# {}\n", report.topic);
    for root in &report.tree {
        write_node(&mut out, root);
    }
    let stats = report.stats;
    let _ = write!(
        out,
        "\n{} questions, {} sources ({} analyzed, {} failed), {} with insufficient data",
        stats.questions, stats.sources, stats.analyzed, stats.failed, stats.insufficient
    );
    if report.degraded {
        out.push_str(", degraded synthesis");
    }
    out.push('\n');
    out
}

fn write_node(out: &mut String, node: &QuestionNode) {
    let indent = "  ".repeat(node.depth);
    let _ = writeln!(out, "{indent}- [{}] {}", node.id, node.text);
    if let Some(error) = &node.retrieval_error {
        let _ = writeln!(out, "{indent}    ! search failed: {error}");
    }
    if let Some(error) = &node.expansion_error {
        let _ = writeln!(out, "{indent}    ! not expanded: {error}");
    }
    for source in &node.sources {
        let marker = match source.status {
            SourceStatus::Analyzed => "ok",
            SourceStatus::Failed => "failed",
            SourceStatus::Pending | SourceStatus::Fetched => "open",
        };
        let relevance = source
            .analysis
            .as_ref()
            .map(|analysis| format!(" relevance {}/10", analysis.relevance))
            .unwrap_or_default();
        let _ = writeln!(out, "{indent}    * ({marker}{relevance}) {}", source.url);
    }
    for child in &node.children {
        write_node(out, child);
    }
}

/// Narrative followed by the outline.
pub fn render_text(report: &ResearchReport) -> String {
    format!(
        "{}\n\n---\n{}",
        report.detailed_analysis.trim(),
        render_outline(report)
    )
}
