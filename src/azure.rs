use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{
    StatusCode,
    blocking::{Client, RequestBuilder},
    header::ACCEPT,
};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::warn;
use uuid::Uuid;

use crate::{
    connection::{ConnectionError, ServerConnection},
    domain::{ProjectReference, PullRequest, Repository, pull_request_web_url},
};

const API_VERSION: &str = "7.0";
const USER_AGENT_HEADER: &str = "pr-monitor/0.1";
const PULL_REQUEST_PAGE_SIZE: usize = 500;
const MAX_PULL_REQUEST_PAGES: usize = 20;

pub fn build_client(timeout: Duration) -> Result<Client, ConnectionError> {
    Client::builder()
        .user_agent(USER_AGENT_HEADER)
        .timeout(timeout)
        .build()
        .map_err(ConnectionError::from)
}

/// REST connection to one Azure DevOps organisation.
pub struct AzureDevOpsConnection {
    client: Client,
    account: String,
    server_url: String,
    token: Option<String>,
}

impl AzureDevOpsConnection {
    pub fn with_server_url(
        client: Client,
        account: &str,
        server_url: String,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            account: account.to_owned(),
            server_url,
            token: token.filter(|token| !token.is_empty()),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self
            .client
            .get(format!("{}{path}", self.server_url))
            .query(&[("api-version", API_VERSION)])
            .header(ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.basic_auth("", Some(token)),
            None => request,
        }
    }

    fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ConnectionError> {
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() || status == StatusCode::NON_AUTHORITATIVE_INFORMATION {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let body = response.text()?;
        serde_json::from_str(&body).map_err(|err| ConnectionError::Decode(err.to_string()))
    }

    fn pull_request_page(
        &self,
        project: &ProjectReference,
        status: &str,
        skip: usize,
    ) -> Result<Vec<PullRequest>, ConnectionError> {
        let request = self
            .get(&format!("{}/_apis/git/pullrequests", project.id))
            .query(&[("searchCriteria.status", status)])
            .query(&[("$top", PULL_REQUEST_PAGE_SIZE), ("$skip", skip)]);
        let response: ListResponse<PullRequestPayload> = self.fetch(request)?;
        Ok(response
            .value
            .into_iter()
            .map(|item| item.into_pull_request(&self.server_url))
            .collect())
    }
}

impl ServerConnection for AzureDevOpsConnection {
    fn list_projects(&self) -> Result<Vec<ProjectReference>, ConnectionError> {
        let response: ListResponse<ProjectPayload> = self.fetch(self.get("_apis/projects"))?;
        Ok(response
            .value
            .into_iter()
            .map(|item| ProjectReference {
                id: item.id,
                name: item.name,
                account: self.account.clone(),
                url: item.url,
            })
            .collect())
    }

    fn list_repositories(
        &self,
        project: &ProjectReference,
    ) -> Result<Vec<Repository>, ConnectionError> {
        let request = self.get(&format!("{}/_apis/git/repositories", project.id));
        let response: ListResponse<RepositoryPayload> = self.fetch(request)?;
        Ok(response
            .value
            .into_iter()
            .map(RepositoryPayload::into_repository)
            .collect())
    }

    fn list_active_pull_requests(
        &self,
        project: &ProjectReference,
    ) -> Result<Vec<PullRequest>, ConnectionError> {
        collect_pages(PULL_REQUEST_PAGE_SIZE, MAX_PULL_REQUEST_PAGES, |skip| {
            self.pull_request_page(project, "active", skip)
        })
    }

    fn list_completed_pull_requests(
        &self,
        project: &ProjectReference,
    ) -> Result<Vec<PullRequest>, ConnectionError> {
        self.pull_request_page(project, "completed", 0)
    }
}

/// Requests pages until one comes back short. Every live pull request has to
/// be seen, since anything missing is treated as closed.
fn collect_pages<T>(
    page_size: usize,
    max_pages: usize,
    mut fetch_page: impl FnMut(usize) -> Result<Vec<T>, ConnectionError>,
) -> Result<Vec<T>, ConnectionError> {
    let mut all = Vec::new();
    for _ in 0..max_pages {
        let page = fetch_page(all.len())?;
        let full = page.len() >= page_size;
        all.extend(page);
        if !full {
            return Ok(all);
        }
    }
    warn!(
        count = all.len(),
        "stopped paging after {max_pages} full pages; results may be incomplete"
    );
    Ok(all)
}

fn classify_status(status: StatusCode, body: &str) -> ConnectionError {
    match status {
        StatusCode::UNAUTHORIZED => ConnectionError::Unauthorized,
        StatusCode::FORBIDDEN => ConnectionError::Forbidden,
        // Azure DevOps answers unauthenticated API calls with a sign-in page.
        StatusCode::NON_AUTHORITATIVE_INFORMATION => ConnectionError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ConnectionError::Timeout(format!("HTTP {}", status.as_u16()))
        }
        _ => ConnectionError::Status {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        },
    }
}

impl From<reqwest::Error> for ConnectionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectionError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ConnectionError::Unreachable(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ConnectionError::Decode(err.to_string())
        } else {
            match err.status() {
                Some(status) => classify_status(status, &err.to_string()),
                None => ConnectionError::Other(err.to_string()),
            }
        }
    }
}

// Response payloads ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
    id: Uuid,
    name: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    id: Uuid,
    name: String,
    project: ProjectNamePayload,
}

impl RepositoryPayload {
    fn into_repository(self) -> Repository {
        Repository {
            id: self.id,
            name: self.name,
            project_name: self.project.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProjectNamePayload {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestPayload {
    pull_request_id: i32,
    title: String,
    created_by: IdentityPayload,
    creation_date: DateTime<Utc>,
    closed_date: Option<DateTime<Utc>>,
    status: String,
    #[serde(default)]
    is_draft: Option<bool>,
    #[serde(default)]
    reviewers: Option<Vec<ReviewerPayload>>,
    repository: RepositoryPayload,
}

impl PullRequestPayload {
    fn into_pull_request(self, server_url: &str) -> PullRequest {
        let repository = self.repository.into_repository();
        let completed = if self.status.eq_ignore_ascii_case("completed") {
            self.closed_date
        } else {
            None
        };
        PullRequest {
            id: self.pull_request_id,
            title: self.title,
            author: self.created_by.display_name,
            created: self.creation_date,
            completed,
            web_url: pull_request_web_url(server_url, &repository, self.pull_request_id),
            repository,
            votes: self
                .reviewers
                .unwrap_or_default()
                .into_iter()
                .map(|reviewer| reviewer.vote)
                .collect(),
            is_draft: self.is_draft.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityPayload {
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ReviewerPayload {
    vote: i32,
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------
