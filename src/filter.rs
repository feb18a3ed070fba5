use crate::types::{PrState, PullRequest};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Request-time narrowing of the fetched pull request set. Every criterion is optional
/// and all present criteria must hold.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PrFilter {
    /// Author login, case-insensitive.
    pub author: Option<String>,
    /// Login of someone who approved the PR, case-insensitive.
    pub approver: Option<String>,
    pub target_branch: Option<String>,
    pub status: Option<PrState>,
    pub exclude_author: Option<String>,
    /// Either an exact branch name or a `prefix/**` pattern.
    pub exclude_branch_pattern: Option<String>,
    /// Inclusive lower bound on the creation date (UTC).
    pub start_date: Option<NaiveDate>,
    /// Inclusive upper bound on the creation date (UTC).
    pub end_date: Option<NaiveDate>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn same_login(login: Option<&str>, wanted: &str) -> bool {
    login.is_some_and(|login| login.eq_ignore_ascii_case(wanted))
}

impl PrFilter {
    pub fn apply<'a>(&self, prs: &'a [PullRequest]) -> Vec<&'a PullRequest> {
        let filtered: Vec<&PullRequest> = prs.iter().filter(|pr| self.matches(pr)).collect();
        tracing::debug!(before = prs.len(), after = filtered.len(), "Filtered pull requests");
        filtered
    }

    pub fn matches(&self, pr: &PullRequest) -> bool {
        self.matches_dates(pr)
            && self.matches_people(pr)
            && self.matches_branch(pr)
            && self.status.map_or(true, |status| pr.state == status)
    }

    fn matches_dates(&self, pr: &PullRequest) -> bool {
        if self.start_date.is_none() && self.end_date.is_none() {
            return true;
        }
        let Some(created) = pr.created_at.map(|ts| ts.date_naive()) else {
            return false;
        };
        self.start_date.map_or(true, |start| created >= start)
            && self.end_date.map_or(true, |end| created <= end)
    }

    fn matches_people(&self, pr: &PullRequest) -> bool {
        if let Some(author) = non_empty(&self.author) {
            if !same_login(pr.author_login(), author) {
                return false;
            }
        }
        if let Some(excluded) = non_empty(&self.exclude_author) {
            if same_login(pr.author_login(), excluded) {
                return false;
            }
        }
        if let Some(approver) = non_empty(&self.approver) {
            let approved = pr.approvals().any(|review| {
                same_login(review.author.as_ref().map(|a| a.login.as_str()), approver)
            });
            if !approved {
                return false;
            }
        }
        true
    }

    fn matches_branch(&self, pr: &PullRequest) -> bool {
        let base = pr.base_ref_name.as_deref();

        if let Some(target) = non_empty(&self.target_branch) {
            if base != Some(target) {
                return false;
            }
        }

        match (non_empty(&self.exclude_branch_pattern), base) {
            (Some(pattern), Some(base)) => match pattern.strip_suffix("/**") {
                Some(prefix) => !base.starts_with(prefix),
                None => base != pattern,
            },
            _ => true,
        }
    }
}

/// Distinct values available for filtering, sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FilterOptions {
    pub authors: Vec<String>,
    pub branches: Vec<String>,
    pub approvers: Vec<String>,
}

impl FilterOptions {
    pub fn from_prs(prs: &[PullRequest]) -> Self {
        let mut authors = BTreeSet::new();
        let mut branches = BTreeSet::new();
        let mut approvers = BTreeSet::new();

        for pr in prs {
            if let Some(login) = pr.author_login() {
                authors.insert(login.to_string());
            }
            if let Some(branch) = &pr.base_ref_name {
                branches.insert(branch.clone());
            }
            for review in pr.approvals() {
                if let Some(author) = &review.author {
                    approvers.insert(author.login.clone());
                }
            }
        }

        Self {
            authors: authors.into_iter().collect(),
            branches: branches.into_iter().collect(),
            approvers: approvers.into_iter().collect(),
        }
    }
}
