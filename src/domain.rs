use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use uuid::Uuid;

// Domain data structures shared across modules.

const VOTE_REJECTED: i32 = -10;
const VOTE_WAITING_FOR_AUTHOR: i32 = -5;

pub fn server_url(account: &str) -> String {
    format!("https://dev.azure.com/{account}/")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectReference {
    pub id: Uuid,
    pub name: String,
    pub account: String,
    pub url: Option<String>,
}

impl ProjectReference {
    /// Where the project lives, for log lines.
    pub fn location(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("{}{}", server_url(&self.account), self.name))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub project_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PullRequest {
    pub id: i32,
    pub title: String,
    pub author: String,
    pub created: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub repository: Repository,
    pub web_url: String,
    pub votes: Vec<i32>,
    pub is_draft: bool,
}

impl PullRequest {
    /// At least one reviewer voted in favour and nobody voted against.
    pub fn is_approved(&self) -> bool {
        self.votes.iter().any(|vote| *vote > 0) && !self.votes.iter().any(|vote| *vote < 0)
    }

    pub fn is_rejected(&self) -> bool {
        self.votes.contains(&VOTE_REJECTED)
    }

    pub fn is_waiting_for_author(&self) -> bool {
        self.votes.contains(&VOTE_WAITING_FOR_AUTHOR)
    }

    pub fn display_title(&self) -> String {
        let mut title = self.title.clone();
        if self.is_draft {
            title.push_str(" [Draft]");
        }
        if self.is_rejected() {
            title.push_str(" [Rejected]");
        }
        if self.is_waiting_for_author() {
            title.push_str(" [Waiting for author]");
        }
        title
    }
}

pub fn pull_request_web_url(server_url: &str, repository: &Repository, id: i32) -> String {
    format!(
        "{server_url}{}/_git/{}/pullrequest/{id}",
        repository.project_name, repository.name
    )
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetrievalStatus {
    #[default]
    Unstarted,
    Ongoing,
    Succeeded,
    FailedDueToConnection,
    FailedDueToAuth,
    FailedReasonUnknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorStatus {
    /// The first update has not completed yet.
    AwaitingFirstUpdate,
    /// No projects are configured.
    NoProjects,
    UpdateSuccessful,
    /// The server hosting one or more projects could not be contacted.
    CouldNotReachServer,
    /// The server rejected our credentials for one or more projects.
    AuthorisationError,
    /// Something unexpected went wrong; polling carries on regardless.
    UnrecognisedError,
}

impl MonitorStatus {
    pub fn label(&self) -> &'static str {
        match self {
            MonitorStatus::AwaitingFirstUpdate => "Awaiting first update",
            MonitorStatus::NoProjects => "No projects configured",
            MonitorStatus::UpdateSuccessful => "Up to date",
            MonitorStatus::CouldNotReachServer => "Could not reach server",
            MonitorStatus::AuthorisationError => "Authorisation error",
            MonitorStatus::UnrecognisedError => "Unrecognised error",
        }
    }
}

/// A project the user asked to monitor.
///
/// Two entries naming the same account and project are the same target even
/// when their repository patterns differ, so a pattern edit never forces the
/// monitor to rebuild the project.
#[derive(Clone, Debug)]
pub struct MonitoredProjectSettings {
    pub account: String,
    pub id: Uuid,
    pub repo_name_pattern: Option<String>,
}

impl PartialEq for MonitoredProjectSettings {
    fn eq(&self, other: &Self) -> bool {
        self.account == other.account && self.id == other.id
    }
}

impl Eq for MonitoredProjectSettings {}

impl Hash for MonitoredProjectSettings {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.account.hash(state);
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn pull_request(votes: Vec<i32>, is_draft: bool) -> PullRequest {
        PullRequest {
            id: 7,
            title: "Add retries".into(),
            author: "Dana".into(),
            created: Utc::now(),
            completed: None,
            repository: Repository {
                id: Uuid::nil(),
                name: "repo-a".into(),
                project_name: "Widgets".into(),
            },
            web_url: String::new(),
            votes,
            is_draft,
        }
    }

    #[test]
    fn server_urls_embed_account() {
        assert_eq!(server_url("acme"), "https://dev.azure.com/acme/");
    }

    #[test]
    fn approval_requires_a_positive_vote_and_no_negative_vote() {
        assert!(!pull_request(vec![], false).is_approved());
        assert!(!pull_request(vec![0, 0], false).is_approved());
        assert!(pull_request(vec![10], false).is_approved());
        assert!(pull_request(vec![5, 0], false).is_approved());
        assert!(!pull_request(vec![10, -5], false).is_approved());
        assert!(!pull_request(vec![10, -10], false).is_approved());
    }

    #[test]
    fn display_title_appends_postfixes_in_order() {
        assert_eq!(pull_request(vec![], false).display_title(), "Add retries");
        assert_eq!(
            pull_request(vec![-10, -5], true).display_title(),
            "Add retries [Draft] [Rejected] [Waiting for author]"
        );
    }

    #[test]
    fn web_url_points_at_repository_pull_request_page() {
        let pr = pull_request(vec![], false);
        assert_eq!(
            pull_request_web_url("https://dev.azure.com/acme/", &pr.repository, 42),
            "https://dev.azure.com/acme/Widgets/_git/repo-a/pullrequest/42"
        );
    }

    #[test]
    fn monitored_project_equality_ignores_pattern() {
        let id = Uuid::new_v4();
        let a = MonitoredProjectSettings {
            account: "acme".into(),
            id,
            repo_name_pattern: Some("repo-.*".into()),
        };
        let b = MonitoredProjectSettings {
            repo_name_pattern: None,
            ..a.clone()
        };
        let c = MonitoredProjectSettings {
            account: "other".into(),
            ..a.clone()
        };

        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
