//! ---
//! certmgr_section: "04-provisioning-core"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Cluster resource operations used by the certificate installer."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors surfaced by a [`ResourceManager`] backend.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The Kubernetes API rejected or failed the call.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// The named service does not exist.
    #[error("service {0} not found")]
    ServiceNotFound(String),
    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// The three cluster operations the installer needs.
///
/// Implementations hold no state between calls that callers rely on.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Create or replace the TLS secret `name` with the given PEM key and certificate.
    async fn create_tls_secret(&self, name: &str, key: &str, cert: &str)
        -> Result<(), ResourceError>;

    /// Snapshot the names of the running instances backing `service`.
    async fn list_instances_for_service(&self, service: &str)
        -> Result<Vec<String>, ResourceError>;

    /// Terminate the instance `name`.
    async fn delete_instance(&self, name: &str) -> Result<(), ResourceError>;
}

/// Key and certificate stored in a TLS secret.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredTlsSecret {
    pub key: String,
    pub cert: String,
}

impl std::fmt::Debug for StoredTlsSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTlsSecret")
            .field("key", &"<redacted>")
            .field("cert_len", &self.cert.len())
            .finish()
    }
}

/// Call recorded by [`InMemoryResourceManager`], in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceCall {
    CreateTlsSecret(String),
    ListInstances(String),
    DeleteInstance(String),
}

/// Entries kept in the call and deletion histories before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

#[derive(Debug)]
struct InMemoryState {
    secrets: HashMap<String, StoredTlsSecret>,
    services: HashMap<String, Vec<String>>,
    history_limit: usize,
    deleted: VecDeque<String>,
    calls: VecDeque<ResourceCall>,
    fail_store: Option<String>,
    fail_list: Option<String>,
    fail_delete: HashMap<String, String>,
}

impl Default for InMemoryState {
    fn default() -> Self {
        Self {
            secrets: HashMap::new(),
            services: HashMap::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            deleted: VecDeque::new(),
            calls: VecDeque::new(),
            fail_store: None,
            fail_list: None,
            fail_delete: HashMap::new(),
        }
    }
}

impl InMemoryState {
    fn record_call(&mut self, call: ResourceCall) {
        push_bounded(&mut self.calls, call, self.history_limit);
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, entry: T, limit: usize) {
    while history.len() >= limit.max(1) {
        history.pop_front();
    }
    history.push_back(entry);
}

/// Process-local backend for tests and clusterless runs.
///
/// Deleted instances stay listed under their service, the way a workload
/// controller recreates terminated pods. Call and deletion histories keep
/// only the most recent entries.
#[derive(Debug, Default)]
pub struct InMemoryResourceManager {
    state: Mutex<InMemoryState>,
}

impl InMemoryResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` entries in the call and deletion histories.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.state.lock().history_limit = limit;
        self
    }

    /// Builder variant of [`InMemoryResourceManager::set_instances`].
    pub fn with_instances<I, S>(self, service: &str, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_instances(service, instances);
        self
    }

    /// Replace the instances backing `service`.
    pub fn set_instances<I, S>(&self, service: &str, instances: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().services.insert(
            service.to_owned(),
            instances.into_iter().map(Into::into).collect(),
        );
    }

    pub fn secret(&self, name: &str) -> Option<StoredTlsSecret> {
        self.state.lock().secrets.get(name).cloned()
    }

    pub fn deleted_instances(&self) -> Vec<String> {
        self.state.lock().deleted.iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ResourceCall> {
        self.state.lock().calls.iter().cloned().collect()
    }

    /// Make every subsequent secret write fail with `message`.
    pub fn fail_secret_writes(&self, message: impl Into<String>) {
        self.state.lock().fail_store = Some(message.into());
    }

    /// Make every subsequent instance listing fail with `message`.
    pub fn fail_listing(&self, message: impl Into<String>) {
        self.state.lock().fail_list = Some(message.into());
    }

    /// Make deleting `instance` fail with `message`.
    pub fn fail_delete_of(&self, instance: &str, message: impl Into<String>) {
        self.state
            .lock()
            .fail_delete
            .insert(instance.to_owned(), message.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_store = None;
        state.fail_list = None;
        state.fail_delete.clear();
    }
}

#[async_trait]
impl ResourceManager for InMemoryResourceManager {
    async fn create_tls_secret(
        &self,
        name: &str,
        key: &str,
        cert: &str,
    ) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record_call(ResourceCall::CreateTlsSecret(name.to_owned()));
        if let Some(message) = &state.fail_store {
            return Err(ResourceError::Backend(message.clone()));
        }
        state.secrets.insert(
            name.to_owned(),
            StoredTlsSecret {
                key: key.to_owned(),
                cert: cert.to_owned(),
            },
        );
        Ok(())
    }

    async fn list_instances_for_service(
        &self,
        service: &str,
    ) -> Result<Vec<String>, ResourceError> {
        let mut state = self.state.lock();
        state.record_call(ResourceCall::ListInstances(service.to_owned()));
        if let Some(message) = &state.fail_list {
            return Err(ResourceError::Backend(message.clone()));
        }
        Ok(state.services.get(service).cloned().unwrap_or_default())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.record_call(ResourceCall::DeleteInstance(name.to_owned()));
        if let Some(message) = state.fail_delete.get(name) {
            return Err(ResourceError::Backend(message.clone()));
        }
        let limit = state.history_limit;
        push_bounded(&mut state.deleted, name.to_owned(), limit);
        Ok(())
    }
}
