use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex, Weak,
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    cache::ConnectionCache,
    domain::{MonitorStatus, MonitoredProjectSettings, RetrievalStatus},
    filter::RepositoryFilter,
    notify::{Dispatcher, Event, Handler, lock},
    project::Project,
    settings::MonitorSettings,
};

type ProjectKey = (String, Uuid);

/// Result of asking to begin an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateSlot {
    /// The update may run; carries its number.
    Started(u64),
    /// The numbered update is still running.
    Busy(u64),
}

#[derive(Default)]
struct UpdateCounters {
    started: u64,
    completed: u64,
    /// Bumped on every restart; an update begun under an older value is stale.
    generation: u64,
}

/// Fires `tick` straight away and then once per interval until stopped.
struct PollTimer {
    stop: Sender<()>,
}

impl PollTimer {
    fn start(interval: Duration, tick: impl Fn() + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            loop {
                tick();
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self { stop: tx }
    }

    fn stop(self) {
        let _ = self.stop.send(());
    }
}

/// Polls every configured project and keeps an overall status.
pub struct Monitor {
    settings: Arc<dyn MonitorSettings>,
    cache: Arc<ConnectionCache>,
    projects: Mutex<BTreeMap<ProjectKey, Arc<Project>>>,
    status: Mutex<MonitorStatus>,
    counters: Mutex<UpdateCounters>,
    timer: Mutex<Option<PollTimer>>,
    update_completed: Event,
}

impl Monitor {
    pub fn new(
        settings: Arc<dyn MonitorSettings>,
        cache: Arc<ConnectionCache>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Arc<Self> {
        let status = if settings.projects().is_empty() {
            MonitorStatus::NoProjects
        } else {
            MonitorStatus::AwaitingFirstUpdate
        };

        let monitor = Arc::new(Self {
            settings: settings.clone(),
            cache,
            projects: Mutex::new(BTreeMap::new()),
            status: Mutex::new(status),
            counters: Mutex::new(UpdateCounters::default()),
            timer: Mutex::new(None),
            update_completed: Event::new(dispatcher),
        });

        let weak = Arc::downgrade(&monitor);
        settings.on_changed(Arc::new(move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.restart();
            }
        }));

        monitor
    }

    pub fn status(&self) -> MonitorStatus {
        *lock(&self.status)
    }

    pub fn projects(&self) -> Vec<Arc<Project>> {
        lock(&self.projects).values().cloned().collect()
    }

    pub fn approved_count(&self) -> usize {
        self.projects().iter().map(|p| p.approved_count()).sum()
    }

    pub fn unapproved_count(&self) -> usize {
        self.projects().iter().map(|p| p.unapproved_count()).sum()
    }

    /// Total live pull requests, known only after a successful update.
    pub fn pull_request_count(&self) -> Option<usize> {
        (self.status() == MonitorStatus::UpdateSuccessful)
            .then(|| self.approved_count() + self.unapproved_count())
    }

    pub fn on_update_completed(&self, handler: Handler) {
        self.update_completed.subscribe(handler);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.timer).is_some()
    }

    pub fn start(self: &Arc<Self>) {
        let projects = self.settings.projects();
        if projects.is_empty() {
            info!("not starting monitor as zero projects are configured");
            return;
        }

        let interval = self.settings.poll_interval();
        info!(?interval, "starting monitor");

        let weak: Weak<Self> = Arc::downgrade(self);
        let projects = Arc::new(projects);
        let timer = PollTimer::start(interval, move || {
            let weak = weak.clone();
            let projects = projects.clone();
            thread::spawn(move || {
                if let Some(monitor) = weak.upgrade() {
                    monitor.update(&projects);
                }
            });
        });

        if let Some(previous) = lock(&self.timer).replace(timer) {
            previous.stop();
        }
    }

    pub fn stop(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            info!("stopping monitor");
            timer.stop();
        }
    }

    fn restart(self: &Arc<Self>) {
        info!("settings changed; restarting");
        lock(&self.counters).generation += 1;
        self.stop();
        if self.settings.projects().is_empty() {
            lock(&self.projects).clear();
            *lock(&self.status) = MonitorStatus::NoProjects;
            self.update_completed.raise();
            return;
        }
        self.start();
    }

    /// One timer tick: runs a full update unless the previous one is still
    /// going, in which case the tick is dropped.
    pub fn update(&self, monitored: &[MonitoredProjectSettings]) {
        let number = match self.try_begin_update() {
            UpdateSlot::Started(number) => number,
            UpdateSlot::Busy(running) => {
                info!(
                    "postponing update #{} as update {running} is still running",
                    running + 1
                );
                return;
            }
        };

        info!(update = number, "beginning update");
        let started = Instant::now();
        let generation = lock(&self.counters).generation;

        let status = self.do_update(monitored);
        {
            let counters = lock(&self.counters);
            if counters.generation != generation {
                drop(counters);
                info!(update = number, "discarding update as settings changed while it ran");
                let configured = configured_keys(&self.settings.projects());
                lock(&self.projects).retain(|key, _| configured.contains(key));
                self.complete_update();
                return;
            }
            *lock(&self.status) = status;
        }

        let elapsed = format!("{:.3} s", started.elapsed().as_secs_f64());
        match status {
            MonitorStatus::CouldNotReachServer => info!(
                update = number,
                %elapsed,
                "update failed because the server hosting one or more projects could not be contacted"
            ),
            MonitorStatus::AuthorisationError => info!(
                update = number,
                %elapsed,
                "update failed due to an authorisation problem with one or more projects"
            ),
            MonitorStatus::UnrecognisedError => error!(
                update = number,
                %elapsed,
                "update failed due to one or more errors (logged above)"
            ),
            MonitorStatus::NoProjects => warn!(
                update = number,
                "update should not have been started as no projects are configured"
            ),
            MonitorStatus::UpdateSuccessful => info!(
                update = number,
                %elapsed,
                pull_requests = self.approved_count() + self.unapproved_count(),
                "update completed successfully"
            ),
            MonitorStatus::AwaitingFirstUpdate => {}
        }

        self.complete_update();
        self.update_completed.raise();
    }

    pub fn try_begin_update(&self) -> UpdateSlot {
        let mut counters = lock(&self.counters);
        if counters.completed == counters.started {
            counters.started += 1;
            UpdateSlot::Started(counters.started)
        } else {
            UpdateSlot::Busy(counters.started)
        }
    }

    pub fn complete_update(&self) {
        let mut counters = lock(&self.counters);
        counters.completed = counters.started;
    }

    pub fn do_update(&self, monitored: &[MonitoredProjectSettings]) -> MonitorStatus {
        let synced = self.sync_monitored_projects(monitored);
        if synced != MonitorStatus::UpdateSuccessful {
            return synced;
        }

        let projects = self.projects();
        if projects.is_empty() {
            return MonitorStatus::NoProjects;
        }

        thread::scope(|scope| {
            for project in &projects {
                scope.spawn(move || project.retrieve_pull_requests());
            }
        });

        aggregate(projects.iter().map(|p| p.pull_request_status()))
    }

    /// Resolves every configured project, stopping at the first account whose
    /// projects cannot be retrieved, then forgets projects no longer configured.
    pub fn sync_monitored_projects(&self, monitored: &[MonitoredProjectSettings]) -> MonitorStatus {
        for settings in monitored {
            let collection = self.cache.get(&settings.account);
            if collection.retrieval_status() != RetrievalStatus::Succeeded {
                collection.retrieve_projects();
            }

            match collection.retrieval_status() {
                RetrievalStatus::FailedDueToConnection => return MonitorStatus::CouldNotReachServer,
                RetrievalStatus::FailedDueToAuth => return MonitorStatus::AuthorisationError,
                RetrievalStatus::FailedReasonUnknown => return MonitorStatus::UnrecognisedError,
                _ => {}
            }

            let key: ProjectKey = (settings.account.clone(), settings.id);
            let existing = lock(&self.projects).get(&key).cloned();
            let project = match existing {
                Some(project) => project,
                None => match collection.project(settings.id) {
                    Ok(Some(project)) => {
                        lock(&self.projects).insert(key, project.clone());
                        project
                    }
                    Ok(None) => {
                        warn!(account = %settings.account, project = %settings.id, "configured project not found");
                        continue;
                    }
                    Err(err) => {
                        warn!(account = %settings.account, project = %settings.id, error = %err, "configured project unavailable");
                        continue;
                    }
                },
            };

            if let Some(pattern) = settings.repo_name_pattern.as_deref().filter(|p| !p.is_empty()) {
                match RepositoryFilter::new(pattern) {
                    Ok(filter) => project.set_repository_filter(Some(filter)),
                    Err(err) => {
                        error!(project = %project.name(), error = %err, "invalid repository name pattern");
                        return MonitorStatus::UnrecognisedError;
                    }
                }
            }
        }

        let configured = configured_keys(monitored);
        lock(&self.projects).retain(|key, _| configured.contains(key));

        MonitorStatus::UpdateSuccessful
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn configured_keys(monitored: &[MonitoredProjectSettings]) -> HashSet<ProjectKey> {
    monitored
        .iter()
        .map(|settings| (settings.account.clone(), settings.id))
        .collect()
}

/// Connection problems outrank auth problems, which outrank anything else.
/// A project that never started counts as an unrecognised failure.
fn aggregate(statuses: impl IntoIterator<Item = RetrievalStatus>) -> MonitorStatus {
    let statuses: Vec<RetrievalStatus> = statuses.into_iter().collect();
    if statuses.contains(&RetrievalStatus::FailedDueToConnection) {
        MonitorStatus::CouldNotReachServer
    } else if statuses.contains(&RetrievalStatus::FailedDueToAuth) {
        MonitorStatus::AuthorisationError
    } else if statuses
        .iter()
        .any(|s| matches!(s, RetrievalStatus::FailedReasonUnknown | RetrievalStatus::Unstarted))
    {
        MonitorStatus::UnrecognisedError
    } else {
        MonitorStatus::UpdateSuccessful
    }
}
