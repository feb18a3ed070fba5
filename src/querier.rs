//! Service layer for querying pull request metrics.
//!
//! This module implements `MetricsQuerier`, which acts as the main entry point for retrieving
//! metrics. It handles:
//! 1. Fetching the repository's pull requests through the cache-backed repository.
//! 2. Falling back to the last good listing when GitHub cannot be reached at all.
//! 3. Narrowing the listing with request filters and computing metrics over the result.

use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::filter::{FilterOptions, PrFilter};
use crate::github::{GitHubGraphQl, PullRequestSource};
use crate::metrics::{self, MetricsReport};
use crate::repository::{FetchSettings, PullRequestRepository, PullRequestSet};
use crate::types::{PrState, PullRequest};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Serialize, Clone)]
pub struct MetricsResponse {
    pub metrics: MetricsReport,
    /// The filtered pull requests, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_list: Option<Vec<PullRequest>>,
}

pub struct MetricsQuerier {
    repository: PullRequestRepository,
    states: Vec<PrState>,
    last_good: RwLock<Option<PullRequestSet>>,
}

impl MetricsQuerier {
    /// Initializes a new MetricsQuerier backed by the GitHub GraphQL API.
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let source = Arc::new(GitHubGraphQl::new(config)?);
        Ok(Self::with_source(config, source))
    }

    /// Initializes a MetricsQuerier over an arbitrary pull request source.
    pub fn with_source(config: &AppConfig, source: Arc<dyn PullRequestSource>) -> Self {
        let cache = CacheStore::new(config.cache_max_capacity);
        let repository = PullRequestRepository::new(
            source,
            cache,
            config.repo_id(),
            FetchSettings::from_config(config),
        );

        Self {
            repository,
            states: config.pr_states.clone(),
            last_good: RwLock::new(None),
        }
    }

    /// Returns the repository's pull requests, or the last good listing if fetching fails
    /// outright. `None` only when nothing has ever been fetched.
    pub async fn pull_requests(&self, force_refresh: bool) -> Option<PullRequestSet> {
        if let Some(prs) = self.repository.fetch_all(force_refresh, &self.states).await {
            *self.last_good.write().await = Some(prs.clone());
            return Some(prs);
        }

        let stale = self.last_good.read().await.clone();
        match &stale {
            Some(prs) => tracing::warn!(
                repo = %self.repository.repo_id(),
                count = prs.len(),
                "Returning stale pull request data after failed fetch"
            ),
            None => tracing::error!(
                repo = %self.repository.repo_id(),
                "No pull request data available"
            ),
        }
        stale
    }

    /// Computes metrics over the pull requests matching `filter`.
    pub async fn metrics(
        &self,
        filter: &PrFilter,
        force_refresh: bool,
        include_pr_list: bool,
    ) -> Option<MetricsResponse> {
        let prs = self.pull_requests(force_refresh).await?;
        let filtered = filter.apply(&prs);
        let metrics = metrics::compute_metrics(filtered.iter().copied());

        let pr_list = include_pr_list.then(|| filtered.into_iter().cloned().collect());

        Some(MetricsResponse { metrics, pr_list })
    }

    pub async fn filter_options(&self) -> Option<FilterOptions> {
        let prs = self.pull_requests(false).await?;
        Some(FilterOptions::from_prs(&prs))
    }

    /// Fetches once so the first request is served from the cache.
    pub async fn warm_up(&self) {
        match self.pull_requests(false).await {
            Some(prs) => tracing::info!(count = prs.len(), "Initial pull request fetch complete"),
            None => tracing::error!("Initial pull request fetch failed"),
        }
    }
}
