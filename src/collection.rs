use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    connection::{FailureKind, ServerConnection, log_unrecognised},
    domain::RetrievalStatus,
    notify::{Dispatcher, Event, Handler, lock},
    project::Project,
};

/// The projects hosted by one account.
pub trait ProjectCollection: Send + Sync {
    fn retrieval_status(&self) -> RetrievalStatus;

    /// Fetches the project list unless it was already fetched successfully.
    /// Observers registered with [`ProjectCollection::on_retrieval_completed`]
    /// hear about every call, including the no-op one after a success.
    fn retrieve_projects(&self) -> RetrievalStatus;

    /// Fails until projects have been retrieved successfully.
    fn project(&self, id: Uuid) -> Result<Option<Arc<Project>>, CollectionError>;

    fn projects(&self) -> Vec<Arc<Project>>;

    fn on_retrieval_completed(&self, handler: Handler);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectionError {
    #[error("Cannot get any project until projects have been successfully retrieved")]
    NotRetrieved,
}

pub struct TeamProjectCollection {
    server_url: String,
    connection: Arc<dyn ServerConnection>,
    dispatcher: Arc<dyn Dispatcher>,
    projects: Mutex<BTreeMap<Uuid, Arc<Project>>>,
    status: Mutex<RetrievalStatus>,
    retrieval_completed: Event,
}

impl TeamProjectCollection {
    pub fn new(
        server_url: &str,
        connection: Arc<dyn ServerConnection>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            server_url: server_url.to_owned(),
            connection,
            retrieval_completed: Event::new(dispatcher.clone()),
            dispatcher,
            projects: Mutex::new(BTreeMap::new()),
            status: Mutex::new(RetrievalStatus::Unstarted),
        }
    }
}

impl ProjectCollection for TeamProjectCollection {
    fn retrieval_status(&self) -> RetrievalStatus {
        *lock(&self.status)
    }

    fn retrieve_projects(&self) -> RetrievalStatus {
        {
            let mut status = lock(&self.status);
            if *status == RetrievalStatus::Succeeded {
                drop(status);
                self.retrieval_completed.raise();
                return RetrievalStatus::Succeeded;
            }
            *status = RetrievalStatus::Ongoing;
        }

        info!(url = %self.server_url, "triggering one-time retrieval of projects");

        let errors: Vec<_> = match self.connection.list_projects() {
            Ok(references) => {
                let mut projects = lock(&self.projects);
                for reference in references {
                    projects.entry(reference.id).or_insert_with(|| {
                        Arc::new(Project::new(
                            reference,
                            self.connection.clone(),
                            self.dispatcher.clone(),
                        ))
                    });
                }
                info!(
                    url = %self.server_url,
                    count = projects.len(),
                    "projects successfully retrieved"
                );
                Vec::new()
            }
            Err(err) => vec![err],
        };

        let status = match FailureKind::classify(&errors) {
            None => RetrievalStatus::Succeeded,
            Some(kind @ FailureKind::Connection) => {
                info!(url = %self.server_url, "retrieving projects failed because the server cannot be contacted");
                kind.status()
            }
            Some(kind @ FailureKind::Auth) => {
                info!(url = %self.server_url, "retrieving projects failed because of an authentication or authorisation error");
                kind.status()
            }
            Some(kind @ FailureKind::Unknown) => {
                error!(url = %self.server_url, "retrieving projects failed due to one or more unrecognised errors");
                log_unrecognised(&errors);
                kind.status()
            }
        };

        *lock(&self.status) = status;
        self.retrieval_completed.raise();
        status
    }

    fn project(&self, id: Uuid) -> Result<Option<Arc<Project>>, CollectionError> {
        if self.retrieval_status() != RetrievalStatus::Succeeded {
            return Err(CollectionError::NotRetrieved);
        }
        Ok(lock(&self.projects).get(&id).cloned())
    }

    fn projects(&self) -> Vec<Arc<Project>> {
        lock(&self.projects).values().cloned().collect()
    }

    fn on_retrieval_completed(&self, handler: Handler) {
        self.retrieval_completed.subscribe(handler);
    }
}

/// Stand-in for an unconfigured account. Never touches the network and
/// never leaves `Unstarted`.
pub struct NullProjectCollection {
    retrieval_completed: Event,
}

impl NullProjectCollection {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            retrieval_completed: Event::new(dispatcher),
        }
    }
}

impl ProjectCollection for NullProjectCollection {
    fn retrieval_status(&self) -> RetrievalStatus {
        RetrievalStatus::Unstarted
    }

    fn retrieve_projects(&self) -> RetrievalStatus {
        self.retrieval_completed.raise();
        RetrievalStatus::Unstarted
    }

    fn project(&self, _id: Uuid) -> Result<Option<Arc<Project>>, CollectionError> {
        Ok(None)
    }

    fn projects(&self) -> Vec<Arc<Project>> {
        Vec::new()
    }

    fn on_retrieval_completed(&self, handler: Handler) {
        self.retrieval_completed.subscribe(handler);
    }
}
