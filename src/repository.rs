use crate::cache::CacheStore;
use crate::config::{AppConfig, RepoId};
use crate::github::{PageRequest, PullRequestSource, SourceError};
use crate::types::{PrState, PullRequest};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// An immutable, shareable set of pull request snapshots.
pub type PullRequestSet = Arc<[PullRequest]>;

/// Incomplete listings live in the cache for `ttl / PARTIAL_TTL_DIVISOR`.
const PARTIAL_TTL_DIVISOR: u32 = 2;

#[derive(Clone, Debug)]
pub struct FetchSettings {
    pub page_size: u32,
    pub max_pages: Option<u32>,
    pub cache_ttl: Duration,
    pub page_timeout: Duration,
    pub fetch_deadline: Duration,
}

impl FetchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            page_size: config.pr_page_size,
            max_pages: config.max_github_api_pages,
            cache_ttl: config.cache_ttl(),
            page_timeout: config.page_timeout(),
            fetch_deadline: config.fetch_deadline(),
        }
    }

    fn partial_ttl(&self) -> Duration {
        self.cache_ttl / PARTIAL_TTL_DIVISOR
    }
}

/// Why the page loop stopped.
enum Pagination {
    Complete,
    PageLimit(u32),
    Interrupted(SourceError),
}

/// Builds the cache key for a repository and a set of states.
///
/// States are deduplicated and sorted, so `[MERGED, OPEN]` and `[OPEN, MERGED]` share a key.
pub fn cache_key(repo_id: &RepoId, states: &[PrState]) -> String {
    let states: BTreeSet<&str> = states.iter().map(PrState::as_str).collect();
    let states: Vec<&str> = states.into_iter().collect();
    format!("prs_{}_{}_{}", repo_id.owner, repo_id.repo, states.join("_"))
}

/// Assembles the complete pull request listing of one repository from a paged source.
pub struct PullRequestRepository {
    source: Arc<dyn PullRequestSource>,
    cache: CacheStore<PullRequestSet>,
    repo_id: RepoId,
    settings: FetchSettings,
}

impl PullRequestRepository {
    pub fn new(
        source: Arc<dyn PullRequestSource>,
        cache: CacheStore<PullRequestSet>,
        repo_id: RepoId,
        settings: FetchSettings,
    ) -> Self {
        Self {
            source,
            cache,
            repo_id,
            settings,
        }
    }

    pub fn repo_id(&self) -> &RepoId {
        &self.repo_id
    }

    /// Returns every pull request in the requested states.
    ///
    /// A failure part-way through pagination still yields the pages fetched so far
    /// (cached with a reduced TTL). `None` means nothing at all could be fetched, which
    /// is distinct from an empty listing.
    pub async fn fetch_all(&self, force_refresh: bool, states: &[PrState]) -> Option<PullRequestSet> {
        let key = cache_key(&self.repo_id, states);

        if force_refresh {
            tracing::info!(key = %key, "Force refresh requested, bypassing cache");
        } else if let Some(prs) = self.cache.get(&key).await {
            tracing::debug!(key = %key, count = prs.len(), "Returning cached pull requests");
            return Some(prs);
        }

        let states: Vec<PrState> = states
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        tracing::info!(
            owner = %self.repo_id.owner,
            repo = %self.repo_id.repo,
            states = ?states,
            "Fetching pull requests"
        );

        let (prs, outcome) = self.paginate(&states).await;
        let prs: PullRequestSet = prs.into();

        match outcome {
            Pagination::Complete => {
                tracing::info!(repo = %self.repo_id, count = prs.len(), "Finished fetching pull requests");
                self.cache
                    .set(key, prs.clone(), self.settings.cache_ttl)
                    .await;
                Some(prs)
            }
            Pagination::PageLimit(max_pages) => {
                tracing::warn!(
                    repo = %self.repo_id,
                    count = prs.len(),
                    "Hit max_github_api_pages ({}) before the last page. Data may be incomplete.",
                    max_pages
                );
                self.cache
                    .set(key, prs.clone(), self.settings.partial_ttl())
                    .await;
                Some(prs)
            }
            Pagination::Interrupted(e) if prs.is_empty() => {
                tracing::error!(repo = %self.repo_id, "Failed to fetch pull requests: {}", e);
                None
            }
            Pagination::Interrupted(e) => {
                tracing::warn!(
                    repo = %self.repo_id,
                    count = prs.len(),
                    "Pagination stopped early, keeping partial results: {}",
                    e
                );
                self.cache
                    .set(key, prs.clone(), self.settings.partial_ttl())
                    .await;
                Some(prs)
            }
        }
    }

    /// Walks the cursor chain one page at a time; each request needs the previous cursor.
    async fn paginate(&self, states: &[PrState]) -> (Vec<PullRequest>, Pagination) {
        let deadline = Instant::now() + self.settings.fetch_deadline;
        let mut prs = Vec::new();
        let mut after: Option<String> = None;
        let mut page_number: u32 = 0;

        let outcome = loop {
            page_number += 1;

            let request = PageRequest {
                repo: &self.repo_id,
                page_size: self.settings.page_size,
                after: after.as_deref(),
                states,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            let limit = self.settings.page_timeout.min(remaining);

            let page = match tokio::time::timeout(limit, self.source.fetch_page(request)).await {
                Ok(Ok(page)) => page,
                Ok(Err(e)) => {
                    tracing::error!(page = page_number, "Error fetching page: {}", e);
                    break Pagination::Interrupted(e);
                }
                Err(_) => {
                    tracing::error!(page = page_number, "Page request exceeded its deadline");
                    break Pagination::Interrupted(SourceError::Timeout(limit));
                }
            };

            let fetched = page.nodes.len();
            prs.extend(page.nodes);

            tracing::info!(
                page = page_number,
                fetched,
                total = prs.len(),
                has_next_page = page.page_info.has_next_page,
                "Fetched pull request page"
            );

            if !page.page_info.has_next_page {
                break Pagination::Complete;
            }

            let Some(cursor) = page.page_info.end_cursor else {
                break Pagination::Interrupted(SourceError::Shape(
                    "hasNextPage without endCursor".to_string(),
                ));
            };

            if let Some(max_pages) = self.settings.max_pages {
                if page_number >= max_pages {
                    break Pagination::PageLimit(max_pages);
                }
            }

            after = Some(cursor);
        };

        (prs, outcome)
    }
}
