//! Application configuration and environment variable parsing.
//!
//! This module handles loading configuration settings from the environment (e.g., .env file).
//! It defines the `AppConfig` struct which governs which repository is tracked, how its
//! pull requests are paginated, and how long fetched data stays cached.

use crate::types::PrState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration as StdDuration;

/// A unique identifier for a GitHub repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    /// The owner of the repository (e.g., "facebook").
    pub owner: String,
    /// The name of the repository (e.g., "react").
    pub repo: String,
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Application configuration loaded from environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Token used to authenticate against the GitHub GraphQL API.
    pub github_token: String,

    /// Owner of the tracked repository.
    pub github_repo_owner: String,

    /// Name of the tracked repository.
    pub github_repo_name: String,

    /// Base URI of the GitHub API. Point this at a GitHub Enterprise host to use GHE.
    #[serde(default = "default_api_url")]
    pub github_api_url: String,

    /// Pull request states to fetch.
    /// Expected format: comma-separated, case-insensitive. Example: "OPEN,MERGED"
    #[serde(
        default = "default_pr_states",
        deserialize_with = "deserialize_pr_states"
    )]
    pub pr_states: Vec<PrState>,

    /// Number of pull requests requested per GraphQL page.
    #[serde(default = "default_page_size")]
    pub pr_page_size: u32,

    /// Optional hard limit on the number of pages fetched per refresh.
    pub max_github_api_pages: Option<u32>,

    /// Time to live for a complete pull request listing, in seconds.
    /// Incomplete listings are cached for half of this.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Maximum number of entries to keep in the cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_max_capacity: u64,

    /// Deadline for a single page request, in seconds.
    #[serde(default = "default_page_timeout")]
    pub page_timeout_seconds: u64,

    /// Deadline for the whole pagination loop, in seconds.
    #[serde(default = "default_fetch_deadline")]
    pub fetch_deadline_seconds: u64,

    /// Port the HTTP server binds to.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_pr_states() -> Vec<PrState> {
    vec![PrState::Open, PrState::Merged, PrState::Closed]
}

fn default_page_size() -> u32 {
    50
}

fn default_cache_ttl() -> u64 {
    15 * 60
}

fn default_cache_capacity() -> u64 {
    100
}

fn default_page_timeout() -> u64 {
    30
}

fn default_fetch_deadline() -> u64 {
    300
}

fn default_port() -> u16 {
    3000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn repo_id(&self) -> RepoId {
        RepoId {
            owner: self.github_repo_owner.clone(),
            repo: self.github_repo_name.clone(),
        }
    }

    pub fn cache_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.cache_ttl_seconds)
    }

    pub fn page_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.page_timeout_seconds)
    }

    pub fn fetch_deadline(&self) -> StdDuration {
        StdDuration::from_secs(self.fetch_deadline_seconds)
    }
}

fn deserialize_pr_states<'de, D>(deserializer: D) -> Result<Vec<PrState>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(parse_pr_states(&s))
}

/// Falls back to the default states when no entry is recognised.
fn parse_pr_states(s: &str) -> Vec<PrState> {
    let states: Vec<PrState> = s
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            match part.parse::<PrState>() {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!("Ignoring PR_STATES entry '{}': {}", part, e);
                    None
                }
            }
        })
        .collect();

    if states.is_empty() {
        let defaults = default_pr_states();
        tracing::warn!(
            "PR_STATES '{}' has no recognised states, using {:?}",
            s,
            defaults
        );
        return defaults;
    }
    states
}
