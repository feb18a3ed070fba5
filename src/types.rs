use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a pull request as reported by GitHub.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    #[default]
    #[serde(alias = "open")]
    Open,
    #[serde(alias = "closed")]
    Closed,
    #[serde(alias = "merged")]
    Merged,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Open => "OPEN",
            PrState::Closed => "CLOSED",
            PrState::Merged => "MERGED",
        }
    }
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(PrState::Open),
            "CLOSED" => Ok(PrState::Closed),
            "MERGED" => Ok(PrState::Merged),
            other => Err(format!("unknown pull request state '{}'", other)),
        }
    }
}

/// State of a submitted review.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

impl ReviewState {
    /// Whether the review carries a verdict. Plain comments and pending drafts do not.
    pub fn is_verdict(&self) -> bool {
        matches!(
            self,
            ReviewState::Approved | ReviewState::ChangesRequested | ReviewState::Dismissed
        )
    }
}

/// A GitHub actor (user or bot).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub login: String,
    pub name: Option<String>,
}

impl Author {
    /// The name shown for this actor: the profile name when set, otherwise the login.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => &self.login,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub author: Option<Author>,
    pub state: ReviewState,
    pub created_at: Option<DateTime<Utc>>,
    /// Comments attached to this review, separate from the PR conversation thread.
    pub comment_count: u64,
}

/// An entry from the bounded tail of a pull request's timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimelineItem {
    ReadyForReview {
        created_at: Option<DateTime<Utc>>,
    },
    ConvertToDraft {
        created_at: Option<DateTime<Utc>>,
    },
    Review {
        author: Option<Author>,
        state: ReviewState,
        created_at: Option<DateTime<Utc>>,
    },
}

impl TimelineItem {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TimelineItem::ReadyForReview { created_at }
            | TimelineItem::ConvertToDraft { created_at }
            | TimelineItem::Review { created_at, .. } => *created_at,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub authored_date: Option<DateTime<Utc>>,
    pub committed_date: Option<DateTime<Utc>>,
}

/// Read-only snapshot of a pull request taken at fetch time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub number: u64,
    pub title: String,
    pub url: Option<String>,
    pub state: PrState,
    pub is_draft: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub author: Option<Author>,
    /// Target branch.
    pub base_ref_name: Option<String>,
    /// Source branch.
    pub head_ref_name: Option<String>,
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
    /// Size of the general conversation thread.
    pub total_comment_count: u64,
    pub reviews: Vec<Review>,
    pub timeline_items: Vec<TimelineItem>,
    pub commits: Vec<Commit>,
}

impl PullRequest {
    pub fn author_login(&self) -> Option<&str> {
        self.author.as_ref().map(|author| author.login.as_str())
    }

    pub fn approvals(&self) -> impl Iterator<Item = &Review> {
        self.reviews
            .iter()
            .filter(|review| review.state == ReviewState::Approved)
    }
}
