use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::capabilities::{DynSearchProvider, SearchHit};
use crate::error::ResearchError;
use crate::model::SourceRecord;
use crate::policy::CallPolicy;

/// Candidates requested per wanted result, to leave room for filtering.
pub const SEARCH_OVERSAMPLE: usize = 2;

#[derive(Clone)]
pub struct SourceRetriever {
    search: DynSearchProvider,
    policy: CallPolicy,
    min_snippet_chars: usize,
}

impl SourceRetriever {
    pub fn new(search: DynSearchProvider, policy: CallPolicy, min_snippet_chars: usize) -> Self {
        Self {
            search,
            policy,
            min_snippet_chars,
        }
    }

    /// Pending records for `question`, at most `num_results`, in search order.
    /// An empty result is valid; only a provider failure is an error.
    #[instrument(skip(self, cancel))]
    pub async fn retrieve(
        &self,
        question: &str,
        num_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceRecord>, ResearchError> {
        if num_results == 0 {
            return Ok(Vec::new());
        }

        let limit = num_results.saturating_mul(SEARCH_OVERSAMPLE);
        let hits = self
            .policy
            .call("search", cancel, || self.search.search(question, limit))
            .await
            .map_err(|err| match err {
                ResearchError::Cancelled | ResearchError::Search(_) => err,
                other => ResearchError::Search(other.to_string()),
            })?;

        let received = hits.len();
        let sources = filter_hits(hits, num_results, self.min_snippet_chars);
        debug!(received, kept = sources.len(), "search results filtered");
        Ok(sources)
    }
}

/// Drop blank URLs and thin snippets, de-duplicate by URL keeping the first
/// occurrence, then cap to `num_results`.
pub fn filter_hits(
    hits: Vec<SearchHit>,
    num_results: usize,
    min_snippet_chars: usize,
) -> Vec<SourceRecord> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|hit| {
            let url = hit.link.trim();
            !url.is_empty() && hit.snippet.trim().chars().count() >= min_snippet_chars
        })
        .filter(|hit| seen.insert(hit.link.trim().to_string()))
        .take(num_results)
        .map(|hit| SourceRecord::pending(hit.title.trim(), hit.link.trim(), hit.snippet.trim()))
        .collect()
}
