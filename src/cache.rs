use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use reqwest::blocking::Client;
use tracing::info;

use crate::{
    azure::AzureDevOpsConnection,
    collection::{NullProjectCollection, ProjectCollection, TeamProjectCollection},
    domain::server_url,
    notify::{Dispatcher, lock},
};

pub trait ProjectCollectionFactory: Send + Sync {
    fn create(&self, account: &str, server_url: &str) -> Arc<dyn ProjectCollection>;
}

/// Builds collections that talk to Azure DevOps over REST.
pub struct AzureCollectionFactory {
    client: Client,
    token: Option<String>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl AzureCollectionFactory {
    pub fn new(client: Client, token: Option<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            client,
            token,
            dispatcher,
        }
    }
}

impl ProjectCollectionFactory for AzureCollectionFactory {
    fn create(&self, account: &str, server_url: &str) -> Arc<dyn ProjectCollection> {
        info!(%account, %server_url, "creating server connection");
        let connection = AzureDevOpsConnection::with_server_url(
            self.client.clone(),
            account,
            server_url.to_owned(),
            self.token.clone(),
        );
        Arc::new(TeamProjectCollection::new(
            server_url,
            Arc::new(connection),
            self.dispatcher.clone(),
        ))
    }
}

/// One project collection per account for the life of the process.
pub struct ConnectionCache {
    factory: Box<dyn ProjectCollectionFactory>,
    servers: Mutex<HashMap<String, Arc<dyn ProjectCollection>>>,
    null: Arc<NullProjectCollection>,
}

impl ConnectionCache {
    pub fn new(factory: Box<dyn ProjectCollectionFactory>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            factory,
            servers: Mutex::new(HashMap::new()),
            null: Arc::new(NullProjectCollection::new(dispatcher)),
        }
    }

    /// A blank account yields the shared null collection and never reaches
    /// the factory.
    pub fn get(&self, account: &str) -> Arc<dyn ProjectCollection> {
        let account = account.trim();
        if account.is_empty() {
            return self.null.clone();
        }

        let mut servers = lock(&self.servers);
        servers
            .entry(account.to_owned())
            .or_insert_with(|| self.factory.create(account, &server_url(account)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;
    use crate::{domain::RetrievalStatus, notify::InlineDispatcher, test_support::FakeConnection};

    struct CountingFactory {
        created: Arc<Mutex<Vec<String>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ProjectCollectionFactory for CountingFactory {
        fn create(&self, account: &str, server_url: &str) -> Arc<dyn ProjectCollection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.created).push(format!("{account} {server_url}"));
            Arc::new(TeamProjectCollection::new(
                server_url,
                FakeConnection::new(),
                Arc::new(InlineDispatcher),
            ))
        }
    }

    fn cache() -> (ConnectionCache, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(Mutex::new(Vec::new()));
        let factory = CountingFactory {
            created: created.clone(),
            calls: calls.clone(),
        };
        (
            ConnectionCache::new(Box::new(factory), Arc::new(InlineDispatcher)),
            calls,
            created,
        )
    }

    #[test]
    fn repeated_lookups_create_once() {
        let (cache, calls, created) = cache();

        let first = cache.get("acme");
        for _ in 0..5 {
            let again = cache.get("acme");
            assert!(Arc::ptr_eq(&first, &again));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *lock(&created),
            vec!["acme https://dev.azure.com/acme/".to_owned()]
        );
    }

    #[test]
    fn different_accounts_get_different_collections() {
        let (cache, calls, _) = cache();

        let acme = cache.get("acme");
        let globex = cache.get("globex");

        assert!(!Arc::ptr_eq(&acme, &globex));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn blank_account_returns_null_collection() {
        let (cache, calls, _) = cache();

        for account in ["", "   "] {
            let collection = cache.get(account);
            assert_eq!(collection.retrieve_projects(), RetrievalStatus::Unstarted);
            assert_eq!(collection.retrieval_status(), RetrievalStatus::Unstarted);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_lookups_create_once() {
        let (cache, calls, _) = cache();
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.get("acme"))
            })
            .collect();
        for handle in handles {
            handle.join().expect("lookup thread");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
