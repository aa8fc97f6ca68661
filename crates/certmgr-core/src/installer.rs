//! ---
//! certmgr_section: "04-provisioning-core"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Installs issued certificates and bounces the serving component."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
use std::fmt;
use std::sync::Arc;

use certmgr_common::InstallConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resources::{ResourceError, ResourceManager};

/// Certificate material to install.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCertsRequest {
    pub key: String,
    pub cert: String,
}

impl fmt::Debug for UpdateCertsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateCertsRequest")
            .field("key", &"<redacted>")
            .field("cert_len", &self.cert.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCertsResponse {
    pub ok: bool,
}

/// Coarse classification of an [`InstallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallErrorKind {
    Storage,
    Enumeration,
    /// Nothing to restart; the secret was written regardless.
    Precondition,
    Termination,
}

impl InstallErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallErrorKind::Storage => "storage",
            InstallErrorKind::Enumeration => "enumeration",
            InstallErrorKind::Precondition => "precondition",
            InstallErrorKind::Termination => "termination",
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to store tls secret {secret}: {source}")]
    StoreSecret {
        secret: String,
        #[source]
        source: ResourceError,
    },
    #[error("failed to list instances of service {service}: {source}")]
    ListInstances {
        service: String,
        #[source]
        source: ResourceError,
    },
    #[error("no instances exist for service {service}")]
    NoTargetInstances { service: String },
    #[error("failed to delete instance {instance}: {source}")]
    DeleteInstance {
        instance: String,
        #[source]
        source: ResourceError,
    },
}

impl InstallError {
    pub fn kind(&self) -> InstallErrorKind {
        match self {
            InstallError::StoreSecret { .. } => InstallErrorKind::Storage,
            InstallError::ListInstances { .. } => InstallErrorKind::Enumeration,
            InstallError::NoTargetInstances { .. } => InstallErrorKind::Precondition,
            InstallError::DeleteInstance { .. } => InstallErrorKind::Termination,
        }
    }
}

/// Writes certificates into the cluster and restarts the serving component.
///
/// Steps run strictly in order and stop at the first failure. Nothing is
/// rolled back: a failed restart leaves the new secret in place.
#[derive(Clone)]
pub struct CertInstaller {
    resources: Arc<dyn ResourceManager>,
    secret_name: String,
    service_name: String,
}

impl CertInstaller {
    pub fn new(resources: Arc<dyn ResourceManager>, config: &InstallConfig) -> Self {
        Self {
            resources,
            secret_name: config.secret_name.clone(),
            service_name: config.service_name.clone(),
        }
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Store the key pair and bounce every instance. Returns how many instances were restarted.
    pub async fn install(&self, key: &str, cert: &str) -> Result<usize, InstallError> {
        self.resources
            .create_tls_secret(&self.secret_name, key, cert)
            .await
            .map_err(|source| InstallError::StoreSecret {
                secret: self.secret_name.clone(),
                source,
            })?;
        debug!(secret = %self.secret_name, "tls secret stored");

        let instances = self
            .resources
            .list_instances_for_service(&self.service_name)
            .await
            .map_err(|source| InstallError::ListInstances {
                service: self.service_name.clone(),
                source,
            })?;

        if instances.is_empty() {
            warn!(service = %self.service_name, "no instances to restart after storing certificate");
            return Err(InstallError::NoTargetInstances {
                service: self.service_name.clone(),
            });
        }

        for instance in &instances {
            self.resources
                .delete_instance(instance)
                .await
                .map_err(|source| InstallError::DeleteInstance {
                    instance: instance.clone(),
                    source,
                })?;
            debug!(instance = %instance, "instance terminated");
        }

        info!(
            secret = %self.secret_name,
            service = %self.service_name,
            restarted = instances.len(),
            "certificate installed"
        );
        Ok(instances.len())
    }

    /// Synchronous install entry point shared by the request loop and the HTTP API.
    pub async fn update_certs(
        &self,
        request: UpdateCertsRequest,
    ) -> Result<UpdateCertsResponse, InstallError> {
        let UpdateCertsRequest { key, cert } = request;
        self.install(&key, &cert).await?;
        Ok(UpdateCertsResponse { ok: true })
    }
}

impl fmt::Debug for CertInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertInstaller")
            .field("secret_name", &self.secret_name)
            .field("service_name", &self.service_name)
            .finish()
    }
}
