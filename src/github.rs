use crate::config::{AppConfig, RepoId};
use crate::types::{Author, Commit, PrState, PullRequest, Review, ReviewState, TimelineItem};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

const PULL_REQUEST_QUERY: &str = r#"
query GetPullRequests($owner: String!, $name: String!, $first: Int!, $after: String, $states: [PullRequestState!]) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: $first, after: $after, states: $states, orderBy: {field: CREATED_AT, direction: DESC}) {
      pageInfo {
        endCursor
        hasNextPage
      }
      nodes {
        id
        number
        title
        state
        url
        createdAt
        closedAt
        mergedAt
        isDraft
        author { login ... on User { name } }
        baseRefName
        headRefName
        additions
        deletions
        changedFiles
        reviews(first: 50) {
          nodes {
            author { login ... on User { name } }
            createdAt
            state
            comments { totalCount }
          }
        }
        comments { totalCount }
        commits(first: 1) {
          nodes {
            commit {
              authoredDate
              committedDate
            }
          }
        }
        timelineItems(last: 50, itemTypes: [READY_FOR_REVIEW_EVENT, CONVERT_TO_DRAFT_EVENT, PULL_REQUEST_REVIEW]) {
          nodes {
            __typename
            ... on ReadyForReviewEvent { createdAt }
            ... on ConvertToDraftEvent { createdAt }
            ... on PullRequestReview {
              author { login ... on User { name } }
              createdAt
              state
            }
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("GitHub request failed: {0}")]
    Transport(#[from] octocrab::Error),

    #[error("GitHub API returned errors: {0}")]
    Upstream(String),

    #[error("Unexpected response shape: {0}")]
    Shape(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Parameters for one page of the pull request listing.
#[derive(Clone, Copy, Debug)]
pub struct PageRequest<'a> {
    pub repo: &'a RepoId,
    pub page_size: u32,
    pub after: Option<&'a str>,
    pub states: &'a [PrState],
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub end_cursor: Option<String>,
    #[serde(default)]
    pub has_next_page: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PullRequestPage {
    pub nodes: Vec<PullRequest>,
    pub page_info: PageInfo,
}

/// A cursor-paged source of pull request snapshots.
#[async_trait]
pub trait PullRequestSource: Send + Sync {
    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<PullRequestPage, SourceError>;
}

/// Pull request source backed by the GitHub GraphQL API.
pub struct GitHubGraphQl {
    octocrab: Octocrab,
}

impl GitHubGraphQl {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let octocrab = Octocrab::builder()
            .base_uri(config.github_api_url.as_str())?
            .personal_token(config.github_token.clone())
            .build()?;

        Ok(Self { octocrab })
    }

    pub fn from_octocrab(octocrab: Octocrab) -> Self {
        Self { octocrab }
    }
}

#[async_trait]
impl PullRequestSource for GitHubGraphQl {
    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<PullRequestPage, SourceError> {
        tracing::debug!(
            owner = %request.repo.owner,
            repo = %request.repo.repo,
            after = request.after.unwrap_or("start"),
            "Requesting pull request page"
        );

        let payload = json!({
            "query": PULL_REQUEST_QUERY,
            "variables": {
                "owner": request.repo.owner,
                "name": request.repo.repo,
                "first": request.page_size,
                "after": request.after,
                "states": request.states,
            }
        });

        let response: GraphQlResponse = self.octocrab.graphql(&payload).await?;
        response.into_page()
    }
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<ResponseData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct ResponseData {
    repository: Option<RepositoryNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    pull_requests: Option<PullRequestConnection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestConnection {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Option<PullRequestNode>>,
}

#[derive(Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<Option<T>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TotalCount {
    #[serde(default)]
    total_count: u64,
}

#[derive(Deserialize)]
struct ActorNode {
    login: String,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestNode {
    id: String,
    number: u64,
    #[serde(default)]
    title: String,
    state: PrState,
    url: Option<String>,
    created_at: Option<String>,
    closed_at: Option<String>,
    merged_at: Option<String>,
    #[serde(default)]
    is_draft: bool,
    author: Option<ActorNode>,
    base_ref_name: Option<String>,
    head_ref_name: Option<String>,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    changed_files: u64,
    reviews: Option<Connection<ReviewNode>>,
    comments: Option<TotalCount>,
    commits: Option<Connection<CommitNode>>,
    timeline_items: Option<Connection<TimelineNode>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewNode {
    author: Option<ActorNode>,
    created_at: Option<String>,
    state: ReviewState,
    comments: Option<TotalCount>,
}

#[derive(Deserialize)]
struct CommitNode {
    commit: Option<CommitDates>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitDates {
    authored_date: Option<String>,
    committed_date: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "__typename")]
enum TimelineNode {
    #[serde(rename_all = "camelCase")]
    ReadyForReviewEvent { created_at: Option<String> },
    #[serde(rename_all = "camelCase")]
    ConvertToDraftEvent { created_at: Option<String> },
    #[serde(rename_all = "camelCase")]
    PullRequestReview {
        author: Option<ActorNode>,
        created_at: Option<String>,
        state: ReviewState,
    },
    #[serde(other)]
    Unrecognized,
}

impl GraphQlResponse {
    fn into_page(self) -> Result<PullRequestPage, SourceError> {
        if !self.errors.is_empty() {
            let messages: Vec<String> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(SourceError::Upstream(messages.join("; ")));
        }

        let connection = self
            .data
            .and_then(|data| data.repository)
            .and_then(|repository| repository.pull_requests)
            .ok_or_else(|| {
                SourceError::Shape("missing data.repository.pullRequests".to_string())
            })?;

        Ok(PullRequestPage {
            nodes: connection
                .nodes
                .into_iter()
                .flatten()
                .map(PullRequest::from)
                .collect(),
            page_info: connection.page_info,
        })
    }
}

fn parse_timestamp(raw: Option<String>, field: &str, pr_number: u64) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(pr_number, field, value = %raw, "Ignoring unparseable timestamp: {}", e);
            None
        }
    }
}

fn count(total: Option<TotalCount>) -> u64 {
    total.map_or(0, |t| t.total_count)
}

impl From<ActorNode> for Author {
    fn from(actor: ActorNode) -> Self {
        Author {
            login: actor.login,
            name: actor.name,
        }
    }
}

impl From<PullRequestNode> for PullRequest {
    fn from(node: PullRequestNode) -> Self {
        let number = node.number;

        let reviews = node
            .reviews
            .map(|c| c.nodes)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .map(|review| Review {
                author: review.author.map(Author::from),
                state: review.state,
                created_at: parse_timestamp(review.created_at, "review.createdAt", number),
                comment_count: count(review.comments),
            })
            .collect();

        let commits = node
            .commits
            .map(|c| c.nodes)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter_map(|node| node.commit)
            .map(|commit| Commit {
                authored_date: parse_timestamp(commit.authored_date, "commit.authoredDate", number),
                committed_date: parse_timestamp(
                    commit.committed_date,
                    "commit.committedDate",
                    number,
                ),
            })
            .collect();

        let timeline_items = node
            .timeline_items
            .map(|c| c.nodes)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter_map(|item| match item {
                TimelineNode::ReadyForReviewEvent { created_at } => {
                    Some(TimelineItem::ReadyForReview {
                        created_at: parse_timestamp(created_at, "timeline.createdAt", number),
                    })
                }
                TimelineNode::ConvertToDraftEvent { created_at } => {
                    Some(TimelineItem::ConvertToDraft {
                        created_at: parse_timestamp(created_at, "timeline.createdAt", number),
                    })
                }
                TimelineNode::PullRequestReview {
                    author,
                    created_at,
                    state,
                } => Some(TimelineItem::Review {
                    author: author.map(Author::from),
                    state,
                    created_at: parse_timestamp(created_at, "timeline.createdAt", number),
                }),
                TimelineNode::Unrecognized => {
                    tracing::warn!(pr_number = number, "Skipping unrecognized timeline item");
                    None
                }
            })
            .collect();

        PullRequest {
            id: node.id,
            number,
            title: node.title,
            url: node.url,
            state: node.state,
            is_draft: node.is_draft,
            created_at: parse_timestamp(node.created_at, "createdAt", number),
            closed_at: parse_timestamp(node.closed_at, "closedAt", number),
            merged_at: parse_timestamp(node.merged_at, "mergedAt", number),
            author: node.author.map(Author::from),
            base_ref_name: node.base_ref_name,
            head_ref_name: node.head_ref_name,
            additions: node.additions,
            deletions: node.deletions,
            changed_files: node.changed_files,
            total_comment_count: count(node.comments),
            reviews,
            timeline_items,
            commits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(value: serde_json::Value) -> Result<PullRequestPage, SourceError> {
        let response: GraphQlResponse = serde_json::from_value(value).unwrap();
        response.into_page()
    }

    #[test]
    fn test_page_conversion() {
        let page = parse(json!({
            "data": { "repository": { "pullRequests": {
                "pageInfo": { "endCursor": "Y3Vyc29y", "hasNextPage": true },
                "nodes": [{
                    "id": "PR_1",
                    "number": 7,
                    "title": "Add widgets",
                    "state": "MERGED",
                    "url": "https://github.com/acme/widgets/pull/7",
                    "createdAt": "2024-03-01T10:00:00Z",
                    "closedAt": "2024-03-02T10:00:00Z",
                    "mergedAt": "2024-03-02T10:00:00Z",
                    "isDraft": false,
                    "author": { "login": "alice", "name": "Alice" },
                    "baseRefName": "main",
                    "headRefName": "feature/widgets",
                    "additions": 10,
                    "deletions": 4,
                    "changedFiles": 2,
                    "reviews": { "nodes": [{
                        "author": { "login": "bob", "name": null },
                        "createdAt": "2024-03-01T15:00:00Z",
                        "state": "APPROVED",
                        "comments": { "totalCount": 3 }
                    }]},
                    "comments": { "totalCount": 5 },
                    "commits": { "nodes": [{ "commit": {
                        "authoredDate": "2024-02-28T09:00:00Z",
                        "committedDate": "2024-02-28T09:30:00Z"
                    }}]},
                    "timelineItems": { "nodes": [
                        { "__typename": "ReadyForReviewEvent", "createdAt": "2024-03-01T11:00:00Z" },
                        { "__typename": "PullRequestReview", "author": { "login": "bob" },
                          "createdAt": "2024-03-01T15:00:00Z", "state": "APPROVED" }
                    ]}
                }, null]
            }}}
        }))
        .unwrap();

        assert!(page.page_info.has_next_page);
        assert_eq!(page.page_info.end_cursor.as_deref(), Some("Y3Vyc29y"));
        assert_eq!(page.nodes.len(), 1);

        let pr = &page.nodes[0];
        assert_eq!(pr.number, 7);
        assert_eq!(pr.state, PrState::Merged);
        assert_eq!(
            pr.created_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(pr.author_login(), Some("alice"));
        assert_eq!(pr.total_comment_count, 5);
        assert_eq!(pr.reviews.len(), 1);
        assert_eq!(pr.reviews[0].comment_count, 3);
        assert_eq!(pr.reviews[0].state, ReviewState::Approved);
        assert_eq!(pr.commits.len(), 1);
        assert_eq!(pr.timeline_items.len(), 2);
        assert!(matches!(
            pr.timeline_items[0],
            TimelineItem::ReadyForReview { created_at: Some(_) }
        ));
    }

    #[test]
    fn test_unrecognized_timeline_items_are_skipped() {
        let page = parse(json!({
            "data": { "repository": { "pullRequests": {
                "pageInfo": { "endCursor": null, "hasNextPage": false },
                "nodes": [{
                    "id": "PR_2",
                    "number": 8,
                    "state": "OPEN",
                    "createdAt": "2024-03-01T10:00:00Z",
                    "timelineItems": { "nodes": [
                        { "__typename": "LabeledEvent" },
                        { "__typename": "ConvertToDraftEvent", "createdAt": "2024-03-01T12:00:00Z" }
                    ]}
                }]
            }}}
        }))
        .unwrap();

        let pr = &page.nodes[0];
        assert_eq!(pr.timeline_items.len(), 1);
        assert!(matches!(
            pr.timeline_items[0],
            TimelineItem::ConvertToDraft { .. }
        ));
    }

    #[test]
    fn test_unparseable_timestamp_becomes_none() {
        let page = parse(json!({
            "data": { "repository": { "pullRequests": {
                "pageInfo": { "hasNextPage": false },
                "nodes": [{
                    "id": "PR_3",
                    "number": 9,
                    "state": "CLOSED",
                    "createdAt": "2024-03-01T10:00:00Z",
                    "closedAt": "not a date"
                }]
            }}}
        }))
        .unwrap();

        assert!(page.nodes[0].created_at.is_some());
        assert_eq!(page.nodes[0].closed_at, None);
    }

    #[test]
    fn test_graphql_errors_are_upstream_failures() {
        let result = parse(json!({
            "data": null,
            "errors": [{ "message": "Bad credentials" }, { "message": "Try again" }]
        }));

        match result {
            Err(SourceError::Upstream(message)) => {
                assert_eq!(message, "Bad credentials; Try again")
            }
            other => panic!("expected upstream error, got {:?}", other.map(|p| p.nodes.len())),
        }
    }

    #[test]
    fn test_missing_repository_is_shape_failure() {
        let result = parse(json!({ "data": { "repository": null } }));
        assert!(matches!(result, Err(SourceError::Shape(_))));
    }
}
