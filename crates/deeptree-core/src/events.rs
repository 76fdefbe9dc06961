//! Progress events for one research request.
//!
//! The orchestrator emits a phase change for every state machine transition
//! plus per-node and per-source progress; consumers (CLI progress output,
//! tests) read them from the unbounded receiver.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ErrorDetail;
use crate::model::{ReportStats, SourceStatus};

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    ExpandingQuestions,
    Retrieving,
    Processing,
    Compiling,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::ExpandingQuestions => "expanding_questions",
            Phase::Retrieving => "retrieving",
            Phase::Processing => "processing",
            Phase::Compiling => "compiling",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    PhaseChanged {
        timestamp: u64,
        from: Phase,
        to: Phase,
    },
    TreeExpanded {
        timestamp: u64,
        roots: usize,
        questions: usize,
    },
    NodeRetrieved {
        timestamp: u64,
        question_id: String,
        sources: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
    },
    SourceFinished {
        timestamp: u64,
        question_id: String,
        url: String,
        status: SourceStatus,
        duration_ms: u64,
    },
    Completed {
        timestamp: u64,
        stats: ReportStats,
        degraded: bool,
        duration_ms: u64,
    },
}

impl ResearchEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            ResearchEvent::PhaseChanged { timestamp, .. }
            | ResearchEvent::TreeExpanded { timestamp, .. }
            | ResearchEvent::NodeRetrieved { timestamp, .. }
            | ResearchEvent::SourceFinished { timestamp, .. }
            | ResearchEvent::Completed { timestamp, .. } => *timestamp,
        }
    }
}

/// Sending half handed to the orchestrator. Cloning is cheap; a closed
/// receiver only downgrades emission to a debug log.
#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<ResearchEvent>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResearchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn phase_changed(&self, from: Phase, to: Phase) {
        self.send(ResearchEvent::PhaseChanged {
            timestamp: current_timestamp(),
            from,
            to,
        });
    }

    pub fn tree_expanded(&self, roots: usize, questions: usize) {
        self.send(ResearchEvent::TreeExpanded {
            timestamp: current_timestamp(),
            roots,
            questions,
        });
    }

    pub fn node_retrieved(&self, question_id: &str, sources: usize, error: Option<ErrorDetail>) {
        self.send(ResearchEvent::NodeRetrieved {
            timestamp: current_timestamp(),
            question_id: question_id.to_string(),
            sources,
            error,
        });
    }

    pub fn source_finished(
        &self,
        question_id: &str,
        url: &str,
        status: SourceStatus,
        duration_ms: u64,
    ) {
        self.send(ResearchEvent::SourceFinished {
            timestamp: current_timestamp(),
            question_id: question_id.to_string(),
            url: url.to_string(),
            status,
            duration_ms,
        });
    }

    pub fn completed(&self, stats: ReportStats, degraded: bool, duration_ms: u64) {
        self.send(ResearchEvent::Completed {
            timestamp: current_timestamp(),
            stats,
            degraded,
            duration_ms,
        });
    }

    fn send(&self, event: ResearchEvent) {
        if let Err(err) = self.sender.send(event) {
            tracing::debug!(error = %err, "event receiver dropped");
        }
    }
}

/// Unix timestamp in milliseconds.
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (collector, mut receiver) = EventCollector::new();

        collector.phase_changed(Phase::Initializing, Phase::ExpandingQuestions);
        collector.node_retrieved("1", 2, None);
        drop(collector);

        let first = receiver.recv().await.unwrap();
        assert!(matches!(
            first,
            ResearchEvent::PhaseChanged {
                to: Phase::ExpandingQuestions,
                ..
            }
        ));
        match receiver.recv().await.unwrap() {
            ResearchEvent::NodeRetrieved {
                question_id,
                sources,
                ..
            } => {
                assert_eq!(question_id, "1");
                assert_eq!(sources, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn closed_receiver_is_not_an_error() {
        let (collector, receiver) = EventCollector::new();
        drop(receiver);
        collector.completed(ReportStats::default(), false, 1);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ResearchEvent::PhaseChanged {
            timestamp: 1,
            from: Phase::Retrieving,
            to: Phase::Processing,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase_changed");
        assert_eq!(json["to"], "processing");
    }
}
