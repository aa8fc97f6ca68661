//! ---
//! certmgr_section: "04-provisioning-core"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Kubernetes-backed resource manager."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

use crate::resources::{ResourceError, ResourceManager};

/// Field manager recorded on server-side applied objects.
pub const FIELD_MANAGER: &str = "certmgr";

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const TLS_KEY: &str = "tls.key";
const TLS_CERT: &str = "tls.crt";

/// Resource manager operating on a single namespace through kube-rs.
#[derive(Clone)]
pub struct KubeResourceManager {
    client: Client,
    namespace: String,
}

impl KubeResourceManager {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using the in-cluster service account or the local kubeconfig.
    pub async fn try_default(namespace: impl Into<String>) -> Result<Self, ResourceError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl std::fmt::Debug for KubeResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceManager")
            .field("namespace", &self.namespace)
            .finish()
    }
}

fn tls_secret(name: &str, namespace: &str, key: &str, cert: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_owned(),
                FIELD_MANAGER.to_owned(),
            )])),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_owned()),
        data: Some(BTreeMap::from([
            (TLS_KEY.to_owned(), ByteString(key.as_bytes().to_vec())),
            (TLS_CERT.to_owned(), ByteString(cert.as_bytes().to_vec())),
        ])),
        ..Default::default()
    }
}

/// Render a service selector as a label selector; `None` when it selects nothing.
fn label_selector(selector: Option<&BTreeMap<String, String>>) -> Option<String> {
    let selector = selector.filter(|labels| !labels.is_empty())?;
    Some(
        selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[async_trait]
impl ResourceManager for KubeResourceManager {
    async fn create_tls_secret(
        &self,
        name: &str,
        key: &str,
        cert: &str,
    ) -> Result<(), ResourceError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = tls_secret(name, &self.namespace, key, cert);
        secrets
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        info!(secret = name, namespace = %self.namespace, "tls secret applied");
        Ok(())
    }

    async fn list_instances_for_service(
        &self,
        service: &str,
    ) -> Result<Vec<String>, ResourceError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let found = services.get_opt(service).await?.ok_or_else(|| {
            ResourceError::ServiceNotFound(format!("{}/{}", self.namespace, service))
        })?;

        let selector = found.spec.as_ref().and_then(|spec| spec.selector.as_ref());
        let Some(selector) = label_selector(selector) else {
            debug!(service, "service has no selector; no instances");
            return Ok(Vec::new());
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let listed = pods.list(&ListParams::default().labels(&selector)).await?;
        let names: Vec<String> = listed
            .items
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter_map(|pod| pod.metadata.name)
            .collect();
        debug!(service, %selector, instances = names.len(), "listed service instances");
        Ok(names)
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ResourceError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        pods.delete(name, &DeleteParams::default()).await?;
        info!(pod = name, namespace = %self.namespace, "pod deleted");
        Ok(())
    }
}
