use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};

use tracing::{error, info};

use crate::{
    connection::{ConnectionError, FailureKind, ServerConnection, log_unrecognised},
    domain::{ProjectReference, PullRequest, Repository, RetrievalStatus},
    filter::{self, RepositoryFilter},
    notify::{Dispatcher, Event, Handler, lock},
};

/// The live pull requests of a project, split by approval.
///
/// Both maps sit behind one lock so no reader can catch an id in both.
#[derive(Default)]
struct PullRequestSets {
    approved: BTreeMap<i32, PullRequest>,
    unapproved: BTreeMap<i32, PullRequest>,
}

pub struct Project {
    reference: ProjectReference,
    connection: Arc<dyn ServerConnection>,
    pull_requests: Mutex<PullRequestSets>,
    completed: Mutex<Vec<PullRequest>>,
    repositories: Mutex<Vec<Repository>>,
    repository_filter: Mutex<Option<RepositoryFilter>>,
    pull_request_status: Mutex<RetrievalStatus>,
    completed_status: Mutex<RetrievalStatus>,
    repository_status: Mutex<RetrievalStatus>,
    repositories_updated: Event,
}

impl Project {
    pub fn new(
        reference: ProjectReference,
        connection: Arc<dyn ServerConnection>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            reference,
            connection,
            pull_requests: Mutex::new(PullRequestSets::default()),
            completed: Mutex::new(Vec::new()),
            repositories: Mutex::new(Vec::new()),
            repository_filter: Mutex::new(None),
            pull_request_status: Mutex::new(RetrievalStatus::Unstarted),
            completed_status: Mutex::new(RetrievalStatus::Unstarted),
            repository_status: Mutex::new(RetrievalStatus::Unstarted),
            repositories_updated: Event::new(dispatcher),
        }
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }

    pub fn reference(&self) -> &ProjectReference {
        &self.reference
    }

    pub fn pull_request_status(&self) -> RetrievalStatus {
        *lock(&self.pull_request_status)
    }

    pub fn repository_status(&self) -> RetrievalStatus {
        *lock(&self.repository_status)
    }

    pub fn completed_status(&self) -> RetrievalStatus {
        *lock(&self.completed_status)
    }

    pub fn approved_count(&self) -> usize {
        lock(&self.pull_requests).approved.len()
    }

    pub fn unapproved_count(&self) -> usize {
        lock(&self.pull_requests).unapproved.len()
    }

    pub fn approved(&self) -> Vec<PullRequest> {
        lock(&self.pull_requests).approved.values().cloned().collect()
    }

    pub fn unapproved(&self) -> Vec<PullRequest> {
        lock(&self.pull_requests).unapproved.values().cloned().collect()
    }

    /// Every live pull request, newest first.
    pub fn active_by_created_desc(&self) -> Vec<PullRequest> {
        let sets = lock(&self.pull_requests);
        let mut all: Vec<PullRequest> = sets
            .approved
            .values()
            .chain(sets.unapproved.values())
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created.cmp(&a.created));
        all
    }

    /// The last completed pull requests retrieved, most recently completed first.
    pub fn completed(&self) -> Vec<PullRequest> {
        lock(&self.completed).clone()
    }

    /// Stored repositories that pass the current filter.
    pub fn repositories(&self) -> Vec<Repository> {
        let filter = self.repository_filter();
        lock(&self.repositories)
            .iter()
            .filter(|repo| filter::includes(filter.as_ref(), repo))
            .cloned()
            .collect()
    }

    pub fn repository_filter(&self) -> Option<RepositoryFilter> {
        lock(&self.repository_filter).clone()
    }

    pub fn set_repository_filter(&self, filter: Option<RepositoryFilter>) {
        *lock(&self.repository_filter) = filter;
        self.repositories_updated.raise();
    }

    pub fn on_repositories_updated(&self, handler: Handler) {
        self.repositories_updated.subscribe(handler);
    }

    /// Fetches the open pull requests and reconciles them into the approved
    /// and unapproved sets. Returns straight away when a retrieval is already
    /// running.
    pub fn retrieve_pull_requests(&self) -> RetrievalStatus {
        if !begin(&self.pull_request_status, false) {
            return self.pull_request_status();
        }

        info!(
            project = %self.reference.name,
            url = %self.reference.location(),
            "beginning retrieval of pull requests"
        );

        let outcome = self
            .connection
            .list_active_pull_requests(&self.reference)
            .map(|active| {
                let visible = self.ensure_active_prs_are_present(active);
                self.remove_stale_pull_requests(&visible);
            });

        let status = self.conclude("refreshing pull requests", outcome.err());
        if status == RetrievalStatus::Succeeded {
            info!(
                project = %self.reference.name,
                approved = self.approved_count(),
                unapproved = self.unapproved_count(),
                "pull requests successfully refreshed"
            );
        }
        *lock(&self.pull_request_status) = status;
        status
    }

    /// Adds the pull requests in repositories passing the current filter to
    /// the approved or unapproved set, returning the ids that were added.
    pub fn ensure_active_prs_are_present(&self, active: Vec<PullRequest>) -> Vec<i32> {
        let filter = self.repository_filter();
        let mut visible = Vec::new();
        let mut released = Vec::new();
        {
            let mut sets = lock(&self.pull_requests);
            let sets = &mut *sets;
            for pull_request in active
                .into_iter()
                .filter(|pr| filter::includes(filter.as_ref(), &pr.repository))
            {
                let id = pull_request.id;
                let (target, other) = if pull_request.is_approved() {
                    (&mut sets.approved, &mut sets.unapproved)
                } else {
                    (&mut sets.unapproved, &mut sets.approved)
                };
                released.extend(target.insert(id, pull_request));
                released.extend(other.remove(&id));
                visible.push(id);
            }
        }

        for pull_request in &released {
            self.connection.release_pull_request(pull_request);
        }
        visible
    }

    /// Drops and releases every tracked pull request missing from `visible`.
    pub fn remove_stale_pull_requests(&self, visible: &[i32]) {
        let visible: HashSet<i32> = visible.iter().copied().collect();
        let mut released = Vec::new();
        {
            let mut sets = lock(&self.pull_requests);
            let stale: Vec<i32> = sets
                .approved
                .keys()
                .chain(sets.unapproved.keys())
                .filter(|id| !visible.contains(*id))
                .copied()
                .collect();
            for id in stale {
                released.extend(sets.unapproved.remove(&id));
                released.extend(sets.approved.remove(&id));
            }
        }

        for pull_request in &released {
            self.connection.release_pull_request(pull_request);
        }
    }

    /// Fetches the project's repositories once per session.
    pub fn retrieve_repositories(&self) -> RetrievalStatus {
        if !begin(&self.repository_status, true) {
            return self.repository_status();
        }

        info!(
            project = %self.reference.name,
            url = %self.reference.location(),
            "beginning retrieval of repositories"
        );

        let outcome = self
            .connection
            .list_repositories(&self.reference)
            .map(|repositories| {
                *lock(&self.repositories) = repositories;
            });

        let status = self.conclude("retrieving repositories", outcome.err());
        if status == RetrievalStatus::Succeeded {
            info!(
                project = %self.reference.name,
                count = lock(&self.repositories).len(),
                "repositories successfully retrieved"
            );
        }
        *lock(&self.repository_status) = status;
        self.repositories_updated.raise();
        status
    }

    pub fn retrieve_completed_pull_requests(&self) -> RetrievalStatus {
        if !begin(&self.completed_status, false) {
            return self.completed_status();
        }

        let filter = self.repository_filter();
        let outcome = self
            .connection
            .list_completed_pull_requests(&self.reference)
            .map(|completed| {
                let mut completed: Vec<PullRequest> = completed
                    .into_iter()
                    .filter(|pr| filter::includes(filter.as_ref(), &pr.repository))
                    .collect();
                completed.sort_by(|a, b| {
                    b.completed
                        .unwrap_or(b.created)
                        .cmp(&a.completed.unwrap_or(a.created))
                });
                *lock(&self.completed) = completed;
            });

        let status = self.conclude("retrieving completed pull requests", outcome.err());
        *lock(&self.completed_status) = status;
        status
    }

    fn conclude(&self, action: &str, err: Option<ConnectionError>) -> RetrievalStatus {
        let errors: Vec<ConnectionError> = err.into_iter().collect();
        let project = &self.reference.name;
        let url = self.reference.location();
        match FailureKind::classify(&errors) {
            None => RetrievalStatus::Succeeded,
            Some(kind @ FailureKind::Connection) => {
                info!(%project, %url, "{action} failed because the server cannot be contacted");
                kind.status()
            }
            Some(kind @ FailureKind::Auth) => {
                info!(%project, %url, "{action} failed due to an authorisation problem");
                kind.status()
            }
            Some(kind @ FailureKind::Unknown) => {
                error!(%project, %url, "{action} failed due to one or more unrecognised errors");
                log_unrecognised(&errors);
                kind.status()
            }
        }
    }
}

/// Moves `status` to `Ongoing` unless a retrieval is already running (or,
/// with `once`, already succeeded). Returns whether the caller may proceed.
fn begin(status: &Mutex<RetrievalStatus>, once: bool) -> bool {
    let mut status = lock(status);
    match *status {
        RetrievalStatus::Ongoing => false,
        RetrievalStatus::Succeeded if once => false,
        _ => {
            *status = RetrievalStatus::Ongoing;
            true
        }
    }
}
