mod azure;
mod cache;
mod collection;
mod connection;
mod domain;
mod filter;
mod monitor;
mod notify;
mod project;
mod settings;
#[cfg(test)]
mod test_support;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use azure::build_client;
use cache::{AzureCollectionFactory, ConnectionCache};
use connection::ConnectionError;
use collection::ProjectCollection;
use domain::{MonitorStatus, PullRequest, RetrievalStatus};
use monitor::Monitor;
use notify::{ChannelDispatcher, Dispatcher};
use settings::{FileSettings, MonitorSettings, SettingsError, SettingsStore};

const RECENTLY_COMPLETED: usize = 5;

/// Watches Azure DevOps pull requests and reports how many await approval.
#[derive(Parser)]
#[command(name = "pr-monitor", version)]
struct Cli {
    /// Settings file (defaults to ~/.pr-monitor/settings.json)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Run a single update, print the pull requests and exit
    #[arg(long)]
    once: bool,

    /// Azure DevOps organisation to monitor
    #[arg(long)]
    account: Option<String>,

    /// Id of the project to monitor
    #[arg(long)]
    project: Option<Uuid>,

    /// Only count pull requests in repositories whose name matches
    #[arg(long)]
    repo_pattern: Option<String>,

    /// Seconds between polls
    #[arg(long)]
    poll_interval: Option<u64>,
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] ConnectionError),
    #[error("Update finished with status: {0}")]
    Update(&'static str),
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pr_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "pr-monitor stopped");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), RunError> {
    let (dispatcher, queue) = ChannelDispatcher::new();
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);

    let store = match &cli.settings {
        Some(path) => SettingsStore::at(path),
        None => SettingsStore::initialize()?,
    };
    info!(path = %store.path().display(), "loading settings");
    let settings = Arc::new(FileSettings::load(store, dispatcher.clone())?);
    apply_overrides(&settings, &cli)?;
    let current = settings.snapshot();
    info!(
        account = %current.account,
        project = %current.project_id,
        poll_interval_seconds = current.poll_interval_seconds,
        "settings loaded"
    );

    let client = build_client(settings.request_timeout())?;
    let factory = AzureCollectionFactory::new(client, settings.token(), dispatcher.clone());
    let cache = Arc::new(ConnectionCache::new(Box::new(factory), dispatcher.clone()));
    watch_project_list(cache.get(&current.account), current.account);
    let monitor = Monitor::new(settings.clone(), cache, dispatcher);

    if cli.once {
        monitor.update(&settings.projects());
        queue.pump();
        report(&monitor);
        report_projects(&monitor);
        queue.pump();
        return match monitor.status() {
            MonitorStatus::UpdateSuccessful => Ok(()),
            status => Err(RunError::Update(status.label())),
        };
    }

    let reporter = Arc::downgrade(&monitor);
    monitor.on_update_completed(Arc::new(move || {
        if let Some(monitor) = reporter.upgrade() {
            report(&monitor);
        }
    }));
    monitor.start();
    if !monitor.is_running() {
        return Err(RunError::Update(MonitorStatus::NoProjects.label()));
    }

    // Notifications from worker threads run here, one at a time.
    while queue.run_next() {}
    Ok(())
}

fn apply_overrides(settings: &FileSettings, cli: &Cli) -> Result<(), SettingsError> {
    if let Some(account) = &cli.account {
        settings.set_account(account)?;
    }
    if let Some(project) = cli.project {
        settings.set_project_id(project)?;
    }
    if let Some(pattern) = &cli.repo_pattern {
        settings.set_repo_name_pattern(pattern)?;
    }
    if let Some(seconds) = cli.poll_interval {
        settings.set_poll_interval_seconds(seconds)?;
    }
    Ok(())
}

/// Logs how many projects the account holds once its project list arrives.
fn watch_project_list(collection: Arc<dyn ProjectCollection>, account: String) {
    let watched = Arc::downgrade(&collection);
    collection.on_retrieval_completed(Arc::new(move || {
        if let Some(collection) = watched.upgrade() {
            info!(
                %account,
                status = ?collection.retrieval_status(),
                projects = collection.projects().len(),
                "project list retrieval finished"
            );
        }
    }));
}

fn report(monitor: &Monitor) {
    let status = monitor.status();
    match monitor.pull_request_count() {
        Some(total) => println!(
            "{}: {total} open, {} approved, {} awaiting approval",
            status.label(),
            monitor.approved_count(),
            monitor.unapproved_count()
        ),
        None => println!("{}", status.label()),
    }

    let newest = monitor
        .projects()
        .iter()
        .filter_map(|project| project.active_by_created_desc().into_iter().next())
        .max_by_key(|pull_request| pull_request.created);
    if let Some(pull_request) = newest {
        println!("  newest: {}", describe(&pull_request));
    }
}

fn describe(pull_request: &PullRequest) -> String {
    format!(
        "!{} {} [{}] by {}",
        pull_request.id,
        pull_request.display_title(),
        pull_request.repository.name,
        pull_request.author
    )
}

fn report_projects(monitor: &Monitor) {
    for project in monitor.projects() {
        let watched = Arc::downgrade(&project);
        project.on_repositories_updated(Arc::new(move || {
            if let Some(project) = watched.upgrade() {
                debug!(
                    project = %project.name(),
                    status = ?project.repository_status(),
                    "repository list updated"
                );
            }
        }));

        project.retrieve_repositories();
        let repositories = match project.repository_status() {
            RetrievalStatus::Succeeded => project.repositories().len().to_string(),
            _ => "?".to_owned(),
        };
        println!(
            "\n{} ({repositories} repositories) {}",
            project.name(),
            project.reference().location()
        );
        if let Some(filter) = project.repository_filter() {
            println!("  repositories matching /{}/", filter.pattern());
        }

        for (heading, pull_requests) in [
            ("awaiting approval", project.unapproved()),
            ("approved", project.approved()),
        ] {
            if pull_requests.is_empty() {
                continue;
            }
            println!("  {heading}:");
            for pull_request in &pull_requests {
                println!("  {}\n    {}", describe(pull_request), pull_request.web_url);
            }
        }

        project.retrieve_completed_pull_requests();
        if project.completed_status() != RetrievalStatus::Succeeded {
            continue;
        }
        let completed = project.completed();
        if completed.is_empty() {
            continue;
        }
        println!("  recently completed:");
        for pull_request in completed.iter().take(RECENTLY_COMPLETED) {
            let when = pull_request
                .completed
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!(
                "  !{} {} [{}] {when}",
                pull_request.id,
                pull_request.display_title(),
                pull_request.repository.name
            );
        }
    }
}
