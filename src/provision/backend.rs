use anyhow::Result;

use super::{ObservedService, ServiceSpec, Slot};

/// Outcome of an identity creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another actor created it between our existence check and the create call.
    AlreadyExists,
}

/// Narrow view of the cloud control plane the provisioner and destroyer need.
///
/// Deletions must treat an absent resource as success.
pub trait CloudBackend: Send + Sync {
    fn identity_exists(&self, project: &str, email: &str) -> Result<bool>;
    fn create_identity(&self, project: &str, account_id: &str) -> Result<CreateOutcome>;
    fn delete_identity(&self, project: &str, email: &str) -> Result<()>;

    fn describe_service(&self, slot: &Slot) -> Result<Option<ObservedService>>;
    /// Apply the full desired service definition and return its URL.
    fn apply_service(&self, slot: &Slot, spec: &ServiceSpec) -> Result<String>;
    fn delete_service(&self, slot: &Slot) -> Result<()>;

    fn public_access(&self, slot: &Slot) -> Result<bool>;
    fn set_public_access(&self, slot: &Slot, allowed: bool) -> Result<()>;
}
