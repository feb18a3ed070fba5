use crate::types::{PullRequest, ReviewState, TimelineItem};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle timestamps derived from a pull request's redundant event history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalTimeline {
    /// When the PR last became ready for review, if it currently is.
    pub ready_at: Option<DateTime<Utc>>,
    pub first_review_at: Option<DateTime<Utc>>,
    pub last_approval_at: Option<DateTime<Utc>>,
    /// Earliest commit date in the fetched window, or the PR creation time.
    /// Absent only when the PR has neither.
    pub first_commit_at: Option<DateTime<Utc>>,
}

/// Resolves the canonical timeline. A missing creation time only removes the fallbacks
/// that depend on it.
pub fn resolve_timeline(pr: &PullRequest) -> CanonicalTimeline {
    CanonicalTimeline {
        ready_at: ready_at(pr),
        first_review_at: first_review_at(pr),
        last_approval_at: last_approval_at(pr),
        first_commit_at: first_commit_at(pr).or(pr.created_at),
    }
}

/// The last ready-for-review event wins unless a later convert-to-draft undid it.
/// A PR that never logged a ready event and is not a draft has been ready since creation.
fn ready_at(pr: &PullRequest) -> Option<DateTime<Utc>> {
    let last_ready = last_event(pr, |item| matches!(item, TimelineItem::ReadyForReview { .. }));
    let last_draft = last_event(pr, |item| matches!(item, TimelineItem::ConvertToDraft { .. }));

    match (last_ready, last_draft) {
        (Some(ready), None) => Some(ready),
        (Some(ready), Some(draft)) if ready > draft => Some(ready),
        (None, _) if !pr.is_draft => pr.created_at,
        _ => None,
    }
}

fn last_event(pr: &PullRequest, kind: impl Fn(&TimelineItem) -> bool) -> Option<DateTime<Utc>> {
    pr.timeline_items
        .iter()
        .filter(|item| kind(*item))
        .filter_map(TimelineItem::created_at)
        .max()
}

/// Earliest review verdict. The explicit review list is authoritative; the timeline is a
/// bounded tail and is only consulted when the list has no verdict at all.
fn first_review_at(pr: &PullRequest) -> Option<DateTime<Utc>> {
    first_verdict_in_reviews(pr).or_else(|| first_verdict_in_timeline(pr))
}

fn first_verdict_in_reviews(pr: &PullRequest) -> Option<DateTime<Utc>> {
    pr.reviews
        .iter()
        .filter(|review| review.state.is_verdict())
        .filter_map(|review| review.created_at)
        .min()
}

fn first_verdict_in_timeline(pr: &PullRequest) -> Option<DateTime<Utc>> {
    pr.timeline_items
        .iter()
        .filter_map(|item| match item {
            TimelineItem::Review {
                state, created_at, ..
            } if state.is_verdict() => *created_at,
            _ => None,
        })
        .min()
}

// Explicit review list only; the timeline is not used as a fallback here.
fn last_approval_at(pr: &PullRequest) -> Option<DateTime<Utc>> {
    pr.reviews
        .iter()
        .filter(|review| review.state == ReviewState::Approved)
        .filter_map(|review| review.created_at)
        .max()
}

fn first_commit_at(pr: &PullRequest) -> Option<DateTime<Utc>> {
    pr.commits
        .iter()
        .flat_map(|commit| [commit.authored_date, commit.committed_date])
        .flatten()
        .min()
}
