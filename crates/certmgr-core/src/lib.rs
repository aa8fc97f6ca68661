//! ---
//! certmgr_section: "04-provisioning-core"
//! certmgr_subsection: "module"
//! certmgr_type: "source"
//! certmgr_scope: "code"
//! certmgr_description: "Certificate provisioning kernel: request loop, installer and resource backends."
//! certmgr_version: "v0.1.0"
//! certmgr_owner: "platform"
//! ---
//! The request loop publishes certificate requests, watches the authority's
//! replies and hands issued certificates to the installer, which writes them
//! through a [`ResourceManager`].

pub mod installer;
pub mod kubernetes;
pub mod requester;
pub mod resources;

pub use installer::{
    CertInstaller, InstallError, InstallErrorKind, UpdateCertsRequest, UpdateCertsResponse,
};
pub use kubernetes::KubeResourceManager;
pub use requester::{
    CertRequester, CertRequesterHandle, ClusterMode, RearmTimer, RequestTrigger, RequesterError,
    RequesterStatus,
};
pub use resources::{
    InMemoryResourceManager, ResourceCall, ResourceError, ResourceManager, StoredTlsSecret,
};
