//! Request, question tree, source record and report types.
//!
//! The tree is an owned recursive structure: every node exclusively owns its
//! children and its sources, so a node can be moved into the task that works
//! on it and moved back once that task joins.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorDetail, ErrorKind, ResearchError};

/// Default `depth` applied by the API when the request omits it.
pub const DEFAULT_DEPTH: usize = 2;
/// Default `max_questions` applied by the API when the request omits it.
pub const DEFAULT_MAX_QUESTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchQuery {
    pub topic: String,
    pub depth: usize,
    pub max_questions: usize,
}

impl ResearchQuery {
    pub fn new(topic: impl Into<String>, depth: usize, max_questions: usize) -> Self {
        Self {
            topic: topic.into(),
            depth,
            max_questions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Fetched,
    Analyzed,
    Failed,
}

impl SourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceStatus::Analyzed | SourceStatus::Failed)
    }

    /// Pending → Fetched → Analyzed, or Pending/Fetched → Failed.
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        matches!(
            (self, next),
            (SourceStatus::Pending, SourceStatus::Fetched)
                | (SourceStatus::Fetched, SourceStatus::Analyzed)
                | (SourceStatus::Pending, SourceStatus::Failed)
                | (SourceStatus::Fetched, SourceStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Fetched => "fetched",
            SourceStatus::Analyzed => "analyzed",
            SourceStatus::Failed => "failed",
        }
    }
}

/// Relevance judgment produced for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAnalysis {
    /// 0 (irrelevant) to 10 (directly answers the question).
    pub relevance: u8,
    pub finding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub extracted_content: Option<String>,
    pub analysis: Option<SourceAnalysis>,
    pub status: SourceStatus,
    pub error: Option<ErrorDetail>,
}

impl SourceRecord {
    pub fn pending(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
            extracted_content: None,
            analysis: None,
            status: SourceStatus::Pending,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_fetched(&mut self, content: String) -> Result<(), ResearchError> {
        self.advance(SourceStatus::Fetched)?;
        self.extracted_content = Some(content);
        Ok(())
    }

    pub fn mark_analyzed(&mut self, analysis: SourceAnalysis) -> Result<(), ResearchError> {
        self.advance(SourceStatus::Analyzed)?;
        self.analysis = Some(analysis);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: ErrorDetail) -> Result<(), ResearchError> {
        self.advance(SourceStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Copy of the record's search metadata with a terminal failure attached.
    pub fn failed_copy(&self, error: ErrorDetail) -> Self {
        Self {
            status: SourceStatus::Failed,
            error: Some(error),
            ..Self::pending(&self.title, &self.url, &self.snippet)
        }
    }

    fn advance(&mut self, next: SourceStatus) -> Result<(), ResearchError> {
        if !self.status.can_transition_to(next) {
            return Err(ResearchError::Systemic(format!(
                "illegal source transition {} -> {} for {}",
                self.status.as_str(),
                next.as_str(),
                self.url
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionNode {
    pub id: String,
    pub text: String,
    pub depth: usize,
    pub children: Vec<QuestionNode>,
    pub sources: Vec<SourceRecord>,
    /// Sub-question generation failed; the node was kept as a leaf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion_error: Option<ErrorDetail>,
    /// Source search failed; the node carries no sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_error: Option<ErrorDetail>,
}

impl QuestionNode {
    pub fn new(id: impl Into<String>, text: impl Into<String>, depth: usize) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            depth,
            children: Vec::new(),
            sources: Vec::new(),
            expansion_error: None,
            retrieval_error: None,
        }
    }

    pub fn child_id(&self, index: usize) -> String {
        format!("{}.{}", self.id, index + 1)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(QuestionNode::node_count).sum::<usize>()
    }

    /// Pre-order walk over this subtree.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a QuestionNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    pub fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut QuestionNode)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }

    pub fn all_sources_terminal(&self) -> bool {
        self.sources.iter().all(SourceRecord::is_terminal)
            && self.children.iter().all(QuestionNode::all_sources_terminal)
    }

    /// Fail every record in the subtree that has not reached a terminal status.
    /// Returns how many records were sealed.
    pub fn seal_unfinished(&mut self, kind: ErrorKind, reason: &str) -> usize {
        let mut sealed = 0;
        self.walk_mut(&mut |node| {
            for source in node.sources.iter_mut().filter(|s| !s.is_terminal()) {
                if source.mark_failed(ErrorDetail::new(kind, reason)).is_ok() {
                    sealed += 1;
                }
            }
        });
        sealed
    }
}

/// Count nodes and records in a root sequence.
pub fn tree_stats(roots: &[QuestionNode]) -> ReportStats {
    let mut stats = ReportStats::default();
    for root in roots {
        root.walk(&mut |node| {
            stats.questions += 1;
            stats.sources += node.sources.len();
            for source in &node.sources {
                match source.status {
                    SourceStatus::Analyzed => stats.analyzed += 1,
                    SourceStatus::Failed => stats.failed += 1,
                    _ => {}
                }
            }
        });
    }
    stats
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStats {
    pub questions: usize,
    pub sources: usize,
    pub analyzed: usize,
    pub failed: usize,
    /// Questions reported as having insufficient data.
    pub insufficient: usize,
}

/// Whether a question has usable evidence of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Coverage {
    Covered { usable_sources: usize },
    InsufficientData { reason: String },
}

impl Coverage {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, Coverage::InsufficientData { .. })
    }
}

/// One analyzed source as it appears in the merged findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFinding {
    pub title: String,
    pub url: String,
    pub relevance: u8,
    pub finding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// Per-question merged findings, built bottom-up from sources and sub-questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFinding {
    pub question_id: String,
    pub question: String,
    pub depth: usize,
    pub coverage: Coverage,
    /// Analyzed sources in retrieval order.
    pub sources: Vec<SourceFinding>,
    pub failed_sources: usize,
    pub children: Vec<NodeFinding>,
}

impl NodeFinding {
    /// Usable sources in this subtree.
    pub fn evidence_count(&self) -> usize {
        self.sources.len()
            + self
                .children
                .iter()
                .map(NodeFinding::evidence_count)
                .sum::<usize>()
    }

    pub fn insufficient_count(&self) -> usize {
        usize::from(self.coverage.is_insufficient())
            + self
                .children
                .iter()
                .map(NodeFinding::insufficient_count)
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub topic: String,
    pub tree: Vec<QuestionNode>,
    pub findings: Vec<NodeFinding>,
    pub summary: String,
    pub detailed_analysis: String,
    pub stats: ReportStats,
    /// A synthesis stage fell back to a locally rendered text.
    pub degraded: bool,
}
