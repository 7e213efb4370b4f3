//! Environment provisioning as desired-state reconciliation.
//!
//! The provisioner observes the slot, diffs it against a [`DesiredEnvironment`]
//! and applies only the actions the diff calls for. Running it twice against
//! identical inputs yields an empty plan the second time.

pub mod backend;
pub mod gcloud;
pub mod memory;

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

pub use backend::{CloudBackend, CreateOutcome};

use crate::config::{PipelineConfig, ProbeTiming};

/// The `(project, region, service)` tuple that at most one environment may occupy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Slot {
    pub project: String,
    pub region: String,
    pub service: String,
}

impl Slot {
    /// Filesystem-safe key used for lock and record files.
    pub fn key(&self) -> String {
        format!("{}--{}--{}", self.project, self.region, self.service)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.region, self.service)
    }
}

pub fn identity_email(project: &str, account_id: &str) -> String {
    format!("{account_id}@{project}.iam.gserviceaccount.com")
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceSpec {
    pub image: String,
    pub port: u16,
    pub cpu: String,
    pub memory: String,
    pub request_timeout_secs: u64,
    pub min_instances: u32,
    pub max_instances: u32,
    pub concurrency: u32,
    pub service_account: String,
    pub health_path: String,
    pub startup_probe: ProbeTiming,
    pub liveness_probe: ProbeTiming,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredEnvironment {
    pub slot: Slot,
    pub identity: String,
    pub service: ServiceSpec,
    pub public: bool,
}

impl DesiredEnvironment {
    /// Desired state for `run_id`; service and identity names carry the run suffix when configured.
    pub fn from_config(config: &PipelineConfig, run_id: &str, image: &str) -> Self {
        let deploy = &config.deploy;
        let identity = deploy.identity_name(run_id);
        Self {
            slot: Slot {
                project: deploy.project.clone(),
                region: deploy.region.clone(),
                service: deploy.service_name(run_id),
            },
            service: ServiceSpec {
                image: image.to_string(),
                port: deploy.port,
                cpu: deploy.cpu.clone(),
                memory: deploy.memory.clone(),
                request_timeout_secs: deploy.request_timeout_secs,
                min_instances: deploy.min_instances,
                max_instances: deploy.max_instances,
                concurrency: deploy.concurrency,
                service_account: identity_email(&deploy.project, &identity),
                health_path: config.probe.health_path.clone(),
                startup_probe: config.probe.startup,
                liveness_probe: config.probe.liveness,
            },
            identity,
            public: deploy.allow_unauthenticated,
        }
    }

    pub fn identity_email(&self) -> String {
        identity_email(&self.slot.project, &self.identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Presence {
    Absent,
    Present,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservedService {
    pub spec: ServiceSpec,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservedState {
    pub identity: Presence,
    pub service: Option<ObservedService>,
    pub public: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateIdentity,
    ApplyService,
    GrantPublicAccess,
    RevokePublicAccess,
}

/// The single transition for the execution identity: create only when absent.
pub fn identity_transition(observed: Presence) -> Option<Action> {
    match observed {
        Presence::Absent => Some(Action::CreateIdentity),
        Presence::Present => None,
    }
}

/// Actions that move `observed` to `desired`, in application order.
pub fn plan(desired: &DesiredEnvironment, observed: &ObservedState) -> Vec<Action> {
    let mut actions = Vec::new();
    actions.extend(identity_transition(observed.identity));

    let service_matches = observed
        .service
        .as_ref()
        .is_some_and(|svc| svc.spec == desired.service);
    if !service_matches {
        actions.push(Action::ApplyService);
    }

    match (desired.public, observed.public) {
        (true, false) => actions.push(Action::GrantPublicAccess),
        (false, true) => actions.push(Action::RevokePublicAccess),
        _ => {}
    }
    actions
}

/// The live ephemeral deployment occupying a slot.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Environment {
    pub run_id: String,
    pub slot: Slot,
    pub identity: String,
    pub identity_created: bool,
    pub image: String,
    pub url: Option<String>,
    pub public_access: bool,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl Environment {
    pub fn identity_email(&self) -> String {
        identity_email(&self.slot.project, &self.identity)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// A reconcile that stopped part way. `partial` is set when some mutation was attempted.
#[derive(Debug)]
pub struct ReconcileFailure {
    pub partial: Option<Environment>,
    pub error: anyhow::Error,
}

pub struct Provisioner<'a> {
    backend: &'a dyn CloudBackend,
}

impl<'a> Provisioner<'a> {
    pub fn new(backend: &'a dyn CloudBackend) -> Self {
        Self { backend }
    }

    pub fn observe(&self, desired: &DesiredEnvironment) -> Result<ObservedState> {
        let email = desired.identity_email();
        let identity = if self
            .backend
            .identity_exists(&desired.slot.project, &email)
            .with_context(|| format!("Failed to look up identity {email}"))?
        {
            Presence::Present
        } else {
            Presence::Absent
        };
        let service = self
            .backend
            .describe_service(&desired.slot)
            .with_context(|| format!("Failed to describe service {}", desired.slot))?;
        let public = match service {
            Some(_) => self.backend.public_access(&desired.slot)?,
            None => false,
        };
        Ok(ObservedState {
            identity,
            service,
            public,
        })
    }

    #[instrument(skip(self, desired), fields(slot = %desired.slot, image = %desired.service.image))]
    pub fn reconcile(
        &self,
        desired: &DesiredEnvironment,
        run_id: &str,
        ttl_secs: u64,
    ) -> Result<Environment, ReconcileFailure> {
        let observed = self.observe(desired).map_err(|error| ReconcileFailure {
            partial: None,
            error,
        })?;
        let actions = plan(desired, &observed);
        info!(?actions, "Reconcile plan computed");

        let mut env = Environment {
            run_id: run_id.to_string(),
            slot: desired.slot.clone(),
            identity: desired.identity.clone(),
            identity_created: false,
            image: desired.service.image.clone(),
            url: observed.service.as_ref().map(|svc| svc.url.clone()),
            public_access: observed.public,
            created_at: Utc::now(),
            ttl_secs,
        };

        for (idx, action) in actions.iter().enumerate() {
            if let Err(error) = self.apply(*action, desired, &mut env) {
                // Anything the slot held before plus whatever we touched now belongs to this run.
                let touched = idx > 0 || observed.service.is_some() || *action != Action::CreateIdentity;
                return Err(ReconcileFailure {
                    partial: touched.then_some(env),
                    error: error.context(format!("Reconcile action {action:?} failed")),
                });
            }
        }

        Ok(env)
    }

    fn apply(&self, action: Action, desired: &DesiredEnvironment, env: &mut Environment) -> Result<()> {
        let slot = &desired.slot;
        match action {
            Action::CreateIdentity => {
                match self.backend.create_identity(&slot.project, &desired.identity)? {
                    CreateOutcome::Created => {
                        info!(identity = %desired.identity, "Execution identity created");
                        env.identity_created = true;
                    }
                    CreateOutcome::AlreadyExists => {
                        warn!(identity = %desired.identity, "Execution identity appeared concurrently; reusing it");
                    }
                }
            }
            Action::ApplyService => {
                let url = self.backend.apply_service(slot, &desired.service)?;
                info!(%url, "Service applied");
                env.url = Some(url);
            }
            Action::GrantPublicAccess => {
                self.backend.set_public_access(slot, true)?;
                env.public_access = true;
            }
            Action::RevokePublicAccess => {
                self.backend.set_public_access(slot, false)?;
                env.public_access = false;
            }
        }
        Ok(())
    }
}
