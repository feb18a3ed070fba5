use crate::timeline::{resolve_timeline, CanonicalTimeline};
use crate::types::{PrState, PullRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

const MILLIS_PER_HOUR: f64 = 60.0 * 60.0 * 1000.0;

/// Derived metrics for a single pull request. Durations are in hours; `None` means the
/// metric does not apply to this PR (never zero as a stand-in).
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricRecord {
    pub pr_number: u64,
    pub title: String,
    pub state: PrState,
    pub timeline: CanonicalTimeline,
    pub time_in_draft_hours: Option<f64>,
    pub time_to_first_review_hours: Option<f64>,
    pub cycle_time_hours: Option<f64>,
    pub review_time_hours: Option<f64>,
    pub merge_time_hours: Option<f64>,
    pub size: PrSize,
    /// Conversation comments plus comments attached to reviews.
    pub review_depth: u64,
    /// Distinct approvers, in review order.
    pub approvers: Vec<String>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct PrSize {
    pub lines_changed: u64,
    pub files_changed: u64,
}

/// Counts of the input set by state. `open + merged + closed == count`.
#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
pub struct StateSummary {
    pub count: usize,
    pub open: usize,
    pub merged: usize,
    /// Closed without being merged.
    pub closed: usize,
}

impl StateSummary {
    fn record(&mut self, pr: &PullRequest) {
        self.count += 1;
        match pr.state {
            PrState::Open => self.open += 1,
            PrState::Merged => self.merged += 1,
            PrState::Closed if pr.merged_at.is_some() => self.merged += 1,
            PrState::Closed => self.closed += 1,
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ReviewerCount {
    pub reviewer: String,
    pub approvals: u64,
}

/// Mean of each metric over the PRs where it is present.
#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct MetricAverages {
    pub time_in_draft_hours: Option<f64>,
    pub time_to_first_review_hours: Option<f64>,
    pub cycle_time_hours: Option<f64>,
    pub review_time_hours: Option<f64>,
    pub merge_time_hours: Option<f64>,
    pub lines_changed: Option<f64>,
    pub review_depth: Option<f64>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct MetricFailure {
    pub pr_number: u64,
    pub message: String,
}

/// The public response structure for pull request metrics.
#[derive(Debug, Serialize, Clone, Default)]
pub struct MetricsReport {
    pub summary: StateSummary,
    pub per_pr: Vec<MetricRecord>,
    /// Approval counts per reviewer, highest first.
    pub reviewer_contribution: Vec<ReviewerCount>,
    pub averages: MetricAverages,
    pub errors: Vec<MetricFailure>,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("size overflows: {additions} additions + {deletions} deletions")]
    SizeOverflow { additions: u64, deletions: u64 },

    #[error("review comment count overflows")]
    ReviewDepthOverflow,
}

/// Computes per-PR metrics and batch aggregates.
///
/// A PR that cannot be processed is reported in `errors` and skipped; it still counts
/// toward the state summary.
pub fn compute_metrics<'a, I>(prs: I) -> MetricsReport
where
    I: IntoIterator<Item = &'a PullRequest>,
{
    let mut report = MetricsReport::default();
    let mut contribution: HashMap<String, u64> = HashMap::new();

    for pr in prs {
        report.summary.record(pr);

        match pr_metrics(pr) {
            Ok(record) => {
                for reviewer in approval_credits(pr) {
                    *contribution.entry(reviewer.to_string()).or_default() += 1;
                }
                report.per_pr.push(record);
            }
            Err(e) => {
                tracing::warn!(pr_number = pr.number, "Skipping metrics for PR: {}", e);
                report.errors.push(MetricFailure {
                    pr_number: pr.number,
                    message: e.to_string(),
                });
            }
        }
    }

    report.reviewer_contribution = rank_reviewers(contribution);
    report.averages = averages(&report.per_pr);

    tracing::debug!(
        count = report.summary.count,
        computed = report.per_pr.len(),
        errors = report.errors.len(),
        "Metrics calculated"
    );

    report
}

fn pr_metrics(pr: &PullRequest) -> Result<MetricRecord, MetricsError> {
    let timeline = resolve_timeline(pr);
    let created_at = pr.created_at;

    let time_in_draft_hours = match (created_at, timeline.ready_at) {
        (Some(created_at), Some(ready_at)) if ready_at > created_at => {
            hours_between(created_at, ready_at)
        }
        _ => None,
    };

    let time_to_first_review_hours = match (timeline.ready_at, timeline.first_review_at) {
        (Some(ready_at), Some(first_review_at)) => hours_between(ready_at, first_review_at),
        _ => None,
    };

    let cycle_time_hours = match (created_at, pr.merged_at) {
        (Some(created_at), Some(merged_at)) => hours_between(created_at, merged_at),
        _ => None,
    };

    let review_time_hours = timeline.first_review_at.and_then(|first_review_at| {
        let review_end = timeline
            .last_approval_at
            .or_else(|| pr.merged_at.filter(|merged_at| *merged_at >= first_review_at))?;
        hours_between(first_review_at, review_end)
    });

    let merge_time_hours = match (timeline.last_approval_at, pr.merged_at) {
        (Some(last_approval_at), Some(merged_at)) => hours_between(last_approval_at, merged_at),
        _ => None,
    };

    let lines_changed = pr
        .additions
        .checked_add(pr.deletions)
        .ok_or(MetricsError::SizeOverflow {
            additions: pr.additions,
            deletions: pr.deletions,
        })?;

    let review_depth = pr
        .reviews
        .iter()
        .try_fold(pr.total_comment_count, |sum, review| {
            sum.checked_add(review.comment_count)
        })
        .ok_or(MetricsError::ReviewDepthOverflow)?;

    let mut approvers: Vec<String> = Vec::new();
    for reviewer in approval_credits(pr) {
        if !approvers.iter().any(|known| known == reviewer) {
            approvers.push(reviewer.to_string());
        }
    }

    Ok(MetricRecord {
        pr_number: pr.number,
        title: pr.title.clone(),
        state: pr.state,
        timeline,
        time_in_draft_hours,
        time_to_first_review_hours,
        cycle_time_hours,
        review_time_hours,
        merge_time_hours,
        size: PrSize {
            lines_changed,
            files_changed: pr.changed_files,
        },
        review_depth,
        approvers,
    })
}

/// One credit per APPROVED review, attributed to the reviewer's display name.
/// Repeat approvals on the same PR each count.
fn approval_credits(pr: &PullRequest) -> impl Iterator<Item = &str> {
    pr.approvals()
        .filter_map(|review| review.author.as_ref())
        .map(|author| author.display_name())
}

fn rank_reviewers(contribution: HashMap<String, u64>) -> Vec<ReviewerCount> {
    let mut ranked: Vec<ReviewerCount> = contribution
        .into_iter()
        .map(|(reviewer, approvals)| ReviewerCount {
            reviewer,
            approvals,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.approvals
            .cmp(&a.approvals)
            .then_with(|| a.reviewer.cmp(&b.reviewer))
    });
    ranked
}

fn averages(records: &[MetricRecord]) -> MetricAverages {
    MetricAverages {
        time_in_draft_hours: mean(records.iter().filter_map(|r| r.time_in_draft_hours)),
        time_to_first_review_hours: mean(
            records.iter().filter_map(|r| r.time_to_first_review_hours),
        ),
        cycle_time_hours: mean(records.iter().filter_map(|r| r.cycle_time_hours)),
        review_time_hours: mean(records.iter().filter_map(|r| r.review_time_hours)),
        merge_time_hours: mean(records.iter().filter_map(|r| r.merge_time_hours)),
        lines_changed: mean(records.iter().map(|r| r.size.lines_changed as f64)),
        review_depth: mean(records.iter().map(|r| r.review_depth as f64)),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Elapsed hours from `start` to `end`; `None` when `end` precedes `start`.
fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let millis = (end - start).num_milliseconds();
    (millis >= 0).then(|| millis as f64 / MILLIS_PER_HOUR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Author, Review, ReviewState, TimelineItem};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap()
    }

    fn at(hours: i64) -> DateTime<Utc> {
        t0() + Duration::hours(hours)
    }

    fn author(login: &str, name: Option<&str>) -> Option<Author> {
        Some(Author {
            login: login.to_string(),
            name: name.map(str::to_string),
        })
    }

    fn review(login: &str, state: ReviewState, hours: i64) -> Review {
        Review {
            author: author(login, None),
            state,
            created_at: Some(at(hours)),
            comment_count: 0,
        }
    }

    fn pr(number: u64) -> PullRequest {
        PullRequest {
            number,
            title: format!("PR {}", number),
            created_at: Some(t0()),
            ..Default::default()
        }
    }

    fn single(pr: &PullRequest) -> MetricRecord {
        let report = compute_metrics([pr]);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        report.per_pr.into_iter().next().unwrap()
    }

    #[test]
    fn test_empty_input() {
        let report = compute_metrics(&[] as &[PullRequest]);

        assert_eq!(report.summary, StateSummary::default());
        assert!(report.per_pr.is_empty());
        assert!(report.reviewer_contribution.is_empty());
        assert_eq!(report.averages, MetricAverages::default());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_never_drafted_pr_approved_then_merged() {
        let pr = PullRequest {
            state: PrState::Merged,
            merged_at: Some(at(30)),
            reviews: vec![review("bob", ReviewState::Approved, 5)],
            ..pr(1)
        };

        let record = single(&pr);

        assert_eq!(record.time_in_draft_hours, None);
        assert_eq!(record.time_to_first_review_hours, Some(5.0));
        assert_eq!(record.timeline.last_approval_at, Some(at(5)));
        // The review window ends at the last approval, which is also the first review.
        assert_eq!(record.review_time_hours, Some(0.0));
        assert_eq!(record.merge_time_hours, Some(25.0));
        assert_eq!(record.cycle_time_hours, Some(30.0));
    }

    #[test]
    fn test_drafted_pr_with_changes_requested() {
        let pr = PullRequest {
            state: PrState::Merged,
            is_draft: false,
            merged_at: Some(at(20)),
            timeline_items: vec![TimelineItem::ReadyForReview {
                created_at: Some(at(2)),
            }],
            reviews: vec![
                review("carol", ReviewState::ChangesRequested, 10),
                review("carol", ReviewState::Approved, 12),
            ],
            ..pr(2)
        };

        let record = single(&pr);

        assert_eq!(record.time_in_draft_hours, Some(2.0));
        assert_eq!(record.time_to_first_review_hours, Some(8.0));
        assert_eq!(record.review_time_hours, Some(2.0));
        assert_eq!(record.merge_time_hours, Some(8.0));
        assert_eq!(record.cycle_time_hours, Some(20.0));
    }

    #[test]
    fn test_comment_only_review_has_no_review_metrics() {
        let pr = PullRequest {
            state: PrState::Merged,
            merged_at: Some(at(6)),
            reviews: vec![review("dave", ReviewState::Commented, 1)],
            ..pr(3)
        };

        let record = single(&pr);

        assert_eq!(record.timeline.first_review_at, None);
        assert_eq!(record.time_to_first_review_hours, None);
        assert_eq!(record.review_time_hours, None);
        assert_eq!(record.merge_time_hours, None);
        assert_eq!(record.cycle_time_hours, Some(6.0));
    }

    #[test]
    fn test_review_time_ends_at_merge_without_approval() {
        let pr = PullRequest {
            state: PrState::Merged,
            merged_at: Some(at(9)),
            reviews: vec![review("erin", ReviewState::ChangesRequested, 3)],
            ..pr(4)
        };

        let record = single(&pr);

        assert_eq!(record.review_time_hours, Some(6.0));
        assert_eq!(record.merge_time_hours, None);
    }

    #[test]
    fn test_review_after_merge_has_no_review_time() {
        let pr = PullRequest {
            state: PrState::Merged,
            merged_at: Some(at(2)),
            reviews: vec![review("erin", ReviewState::Dismissed, 5)],
            ..pr(5)
        };

        assert_eq!(single(&pr).review_time_hours, None);
    }

    #[test]
    fn test_review_before_ready_is_not_time_to_first_review() {
        let pr = PullRequest {
            timeline_items: vec![TimelineItem::ReadyForReview {
                created_at: Some(at(4)),
            }],
            reviews: vec![review("frank", ReviewState::ChangesRequested, 1)],
            ..pr(6)
        };

        let record = single(&pr);

        assert_eq!(record.time_in_draft_hours, Some(4.0));
        assert_eq!(record.time_to_first_review_hours, None);
    }

    #[test]
    fn test_still_draft_pr_has_no_draft_or_review_wait() {
        let pr = PullRequest {
            is_draft: true,
            reviews: vec![review("gina", ReviewState::ChangesRequested, 1)],
            ..pr(7)
        };

        let record = single(&pr);

        assert_eq!(record.time_in_draft_hours, None);
        assert_eq!(record.time_to_first_review_hours, None);
    }

    #[test]
    fn test_merge_before_creation_is_omitted() {
        let pr = PullRequest {
            state: PrState::Merged,
            merged_at: Some(at(-1)),
            ..pr(8)
        };

        assert_eq!(single(&pr).cycle_time_hours, None);
    }

    #[test]
    fn test_size_and_review_depth() {
        let mut first = review("hank", ReviewState::Commented, 1);
        first.comment_count = 4;
        let mut second = review("ivy", ReviewState::Approved, 2);
        second.comment_count = 1;
        let pr = PullRequest {
            additions: 120,
            deletions: 30,
            changed_files: 7,
            total_comment_count: 3,
            reviews: vec![first, second],
            ..pr(9)
        };

        let record = single(&pr);

        assert_eq!(
            record.size,
            PrSize {
                lines_changed: 150,
                files_changed: 7
            }
        );
        assert_eq!(record.review_depth, 8);
    }

    #[test]
    fn test_reviewer_contribution_counts_every_approval() {
        let prs = vec![
            PullRequest {
                reviews: vec![
                    Review {
                        author: author("jo", Some("Jo March")),
                        ..review("jo", ReviewState::Approved, 1)
                    },
                    Review {
                        author: author("jo", Some("Jo March")),
                        ..review("jo", ReviewState::Approved, 3)
                    },
                    review("kim", ReviewState::ChangesRequested, 2),
                ],
                ..pr(10)
            },
            PullRequest {
                reviews: vec![
                    review("kim", ReviewState::Approved, 1),
                    review("lee", ReviewState::Approved, 1),
                    review("kim", ReviewState::Commented, 1),
                ],
                ..pr(11)
            },
        ];

        let report = compute_metrics(&prs);

        assert_eq!(
            report.reviewer_contribution,
            vec![
                ReviewerCount {
                    reviewer: "Jo March".to_string(),
                    approvals: 2
                },
                ReviewerCount {
                    reviewer: "kim".to_string(),
                    approvals: 1
                },
                ReviewerCount {
                    reviewer: "lee".to_string(),
                    approvals: 1
                },
            ]
        );
        assert_eq!(report.per_pr[0].approvers, vec!["Jo March".to_string()]);
        assert_eq!(
            report.per_pr[1].approvers,
            vec!["kim".to_string(), "lee".to_string()]
        );
    }

    #[test]
    fn test_reviewer_contribution_grows_with_approvals() {
        let mut pr = pr(12);
        let mut previous = 0;
        for hour in 0..4 {
            pr.reviews.push(review("mo", ReviewState::Approved, hour));
            let report = compute_metrics([&pr]);
            let count = report.reviewer_contribution[0].approvals;
            assert!(count > previous);
            previous = count;
        }
        assert_eq!(previous, 4);
    }

    #[test]
    fn test_summary_partitions_states() {
        let prs = vec![
            PullRequest {
                state: PrState::Open,
                ..pr(1)
            },
            PullRequest {
                state: PrState::Merged,
                merged_at: Some(at(1)),
                ..pr(2)
            },
            PullRequest {
                state: PrState::Closed,
                ..pr(3)
            },
            PullRequest {
                state: PrState::Closed,
                merged_at: Some(at(1)),
                ..pr(4)
            },
            PullRequest {
                state: PrState::Open,
                created_at: None,
                ..pr(5)
            },
        ];

        let summary = compute_metrics(&prs).summary;

        assert_eq!(
            summary,
            StateSummary {
                count: 5,
                open: 2,
                merged: 2,
                closed: 1
            }
        );
        assert_eq!(summary.open + summary.merged + summary.closed, summary.count);
    }

    #[test]
    fn test_bad_pr_does_not_abort_batch() {
        let prs = vec![
            pr(1),
            PullRequest {
                additions: u64::MAX,
                deletions: 1,
                ..pr(2)
            },
            pr(3),
        ];

        let report = compute_metrics(&prs);

        let computed: Vec<u64> = report.per_pr.iter().map(|r| r.pr_number).collect();
        assert_eq!(computed, vec![1, 3]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].pr_number, 2);
        assert!(report.errors[0].message.starts_with("size overflows"));
        assert_eq!(report.summary.count, 3);
    }

    #[test]
    fn test_missing_creation_time_omits_only_creation_metrics() {
        let mut approval = review("bob", ReviewState::Approved, 4);
        approval.comment_count = 2;
        let pr = PullRequest {
            state: PrState::Merged,
            created_at: None,
            merged_at: Some(at(9)),
            additions: 10,
            deletions: 5,
            changed_files: 2,
            total_comment_count: 3,
            reviews: vec![approval],
            ..pr(42)
        };

        let report = compute_metrics([&pr]);

        assert!(report.errors.is_empty(), "{:?}", report.errors);
        let record = &report.per_pr[0];
        assert_eq!(record.timeline.ready_at, None);
        assert_eq!(record.timeline.first_commit_at, None);
        assert_eq!(record.time_in_draft_hours, None);
        assert_eq!(record.time_to_first_review_hours, None);
        assert_eq!(record.cycle_time_hours, None);
        assert_eq!(record.review_time_hours, Some(0.0));
        assert_eq!(record.merge_time_hours, Some(5.0));
        assert_eq!(record.size.lines_changed, 15);
        assert_eq!(record.review_depth, 5);
        assert_eq!(record.approvers, vec!["bob".to_string()]);
        assert_eq!(
            report.reviewer_contribution,
            vec![ReviewerCount {
                reviewer: "bob".to_string(),
                approvals: 1
            }]
        );
    }

    #[test]
    fn test_averages_skip_absent_metrics() {
        let prs = vec![
            PullRequest {
                state: PrState::Merged,
                merged_at: Some(at(10)),
                additions: 10,
                ..pr(1)
            },
            PullRequest {
                state: PrState::Merged,
                merged_at: Some(at(20)),
                additions: 30,
                ..pr(2)
            },
            PullRequest {
                state: PrState::Open,
                additions: 20,
                ..pr(3)
            },
        ];

        let averages = compute_metrics(&prs).averages;

        assert_eq!(averages.cycle_time_hours, Some(15.0));
        assert_eq!(averages.lines_changed, Some(20.0));
        assert_eq!(averages.merge_time_hours, None);
    }

    #[test]
    fn test_hours_between_is_fractional() {
        let end = t0() + Duration::minutes(90);
        assert_eq!(hours_between(t0(), end), Some(1.5));
        assert_eq!(hours_between(end, t0()), None);
    }
}
