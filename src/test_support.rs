use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, Receiver, Sender},
};

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::{
    connection::{ConnectionError, ServerConnection},
    domain::{ProjectReference, PullRequest, Repository},
    notify::lock,
};

type Responder<T> = Box<dyn Fn() -> Result<Vec<T>, ConnectionError> + Send + Sync>;

fn ok<T: Clone + Send + Sync + 'static>(items: Vec<T>) -> Responder<T> {
    Box::new(move || Ok(items.clone()))
}

/// Holds `list_active_pull_requests` until the test lets it go.
struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

pub struct GateHandle {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

#[derive(Default)]
pub struct CallCounts {
    pub projects: AtomicUsize,
    pub repositories: AtomicUsize,
    pub active: AtomicUsize,
    pub completed: AtomicUsize,
}

/// Scripted in-memory stand-in for the hosting service.
pub struct FakeConnection {
    projects: Mutex<Responder<ProjectReference>>,
    repositories: Mutex<Responder<Repository>>,
    active: Mutex<Responder<PullRequest>>,
    completed: Mutex<Responder<PullRequest>>,
    gate: Mutex<Option<Gate>>,
    released: Mutex<Vec<i32>>,
    pub calls: CallCounts,
}

impl Default for FakeConnection {
    fn default() -> Self {
        Self {
            projects: Mutex::new(ok(Vec::new())),
            repositories: Mutex::new(ok(Vec::new())),
            active: Mutex::new(ok(Vec::new())),
            completed: Mutex::new(ok(Vec::new())),
            gate: Mutex::new(None),
            released: Mutex::new(Vec::new()),
            calls: CallCounts::default(),
        }
    }
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_projects(&self, projects: Vec<ProjectReference>) {
        *lock(&self.projects) = ok(projects);
    }

    pub fn fail_projects(&self, make: fn() -> ConnectionError) {
        *lock(&self.projects) = Box::new(move || Err(make()));
    }

    pub fn set_repositories(&self, repositories: Vec<Repository>) {
        *lock(&self.repositories) = ok(repositories);
    }

    pub fn fail_repositories(&self, make: fn() -> ConnectionError) {
        *lock(&self.repositories) = Box::new(move || Err(make()));
    }

    pub fn set_active(&self, pull_requests: Vec<PullRequest>) {
        *lock(&self.active) = ok(pull_requests);
    }

    pub fn fail_active(&self, make: fn() -> ConnectionError) {
        *lock(&self.active) = Box::new(move || Err(make()));
    }

    pub fn set_completed(&self, pull_requests: Vec<PullRequest>) {
        *lock(&self.completed) = ok(pull_requests);
    }

    pub fn gate_active(&self) -> GateHandle {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *lock(&self.gate) = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn released(&self) -> Vec<i32> {
        lock(&self.released).clone()
    }

    pub fn active_calls(&self) -> usize {
        self.calls.active.load(Ordering::SeqCst)
    }
}

impl ServerConnection for FakeConnection {
    fn list_projects(&self) -> Result<Vec<ProjectReference>, ConnectionError> {
        self.calls.projects.fetch_add(1, Ordering::SeqCst);
        (*lock(&self.projects))()
    }

    fn list_repositories(
        &self,
        _project: &ProjectReference,
    ) -> Result<Vec<Repository>, ConnectionError> {
        self.calls.repositories.fetch_add(1, Ordering::SeqCst);
        (*lock(&self.repositories))()
    }

    fn list_active_pull_requests(
        &self,
        _project: &ProjectReference,
    ) -> Result<Vec<PullRequest>, ConnectionError> {
        self.calls.active.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.gate).take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        (*lock(&self.active))()
    }

    fn list_completed_pull_requests(
        &self,
        _project: &ProjectReference,
    ) -> Result<Vec<PullRequest>, ConnectionError> {
        self.calls.completed.fetch_add(1, Ordering::SeqCst);
        (*lock(&self.completed))()
    }

    fn release_pull_request(&self, pull_request: &PullRequest) {
        lock(&self.released).push(pull_request.id);
    }
}

pub fn project_reference(account: &str, name: &str) -> ProjectReference {
    ProjectReference {
        id: Uuid::new_v4(),
        name: name.to_owned(),
        account: account.to_owned(),
        url: None,
    }
}

pub fn repository(name: &str) -> Repository {
    Repository {
        id: Uuid::new_v4(),
        name: name.to_owned(),
        project_name: "Widgets".into(),
    }
}

pub fn pull_request(id: i32, repository: &Repository, approved: bool) -> PullRequest {
    PullRequest {
        id,
        title: format!("Pull request {id}"),
        author: "Dana".into(),
        created: Utc
            .with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .single()
            .unwrap_or_default()
            + chrono::Duration::minutes(i64::from(id)),
        completed: None,
        repository: repository.clone(),
        web_url: format!("https://dev.azure.com/acme/Widgets/_git/{}/pullrequest/{id}", repository.name),
        votes: if approved { vec![10] } else { vec![0] },
        is_draft: false,
    }
}
