use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, bail};

use super::backend::{CloudBackend, CreateOutcome};
use super::{ObservedService, ServiceSpec, Slot};

#[derive(Debug, Default)]
struct CloudState {
    identities: BTreeSet<(String, String)>,
    services: BTreeMap<Slot, ObservedService>,
    public: BTreeSet<Slot>,
    calls: Vec<String>,
    /// Pretend another actor creates the identity right before our create call.
    race_identity_create: bool,
    failing_applies: u32,
    failing_deletes: u32,
}

/// Process-local control plane used by the `simulated` backend and by tests.
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seed_identity(&self, project: &str, email: &str) {
        self.state()
            .identities
            .insert((project.to_string(), email.to_string()));
    }

    pub fn identity_count(&self) -> usize {
        self.state().identities.len()
    }

    pub fn has_identity(&self, project: &str, email: &str) -> bool {
        self.state()
            .identities
            .contains(&(project.to_string(), email.to_string()))
    }

    pub fn service(&self, slot: &Slot) -> Option<ObservedService> {
        self.state().services.get(slot).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.state().services.len()
    }

    pub fn is_public(&self, slot: &Slot) -> bool {
        self.state().public.contains(slot)
    }

    /// Mutating calls issued so far, e.g. `create_identity chat-runner`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn race_identity_create(&self) {
        self.state().race_identity_create = true;
    }

    pub fn fail_next_applies(&self, count: u32) {
        self.state().failing_applies = count;
    }

    pub fn fail_next_deletes(&self, count: u32) {
        self.state().failing_deletes = count;
    }
}

impl CloudBackend for InMemoryCloud {
    fn identity_exists(&self, project: &str, email: &str) -> Result<bool> {
        Ok(self.has_identity(project, email))
    }

    fn create_identity(&self, project: &str, account_id: &str) -> Result<CreateOutcome> {
        let email = super::identity_email(project, account_id);
        let mut state = self.state();
        state.calls.push(format!("create_identity {account_id}"));
        if state.race_identity_create {
            state.race_identity_create = false;
            state.identities.insert((project.to_string(), email));
            return Ok(CreateOutcome::AlreadyExists);
        }
        if !state.identities.insert((project.to_string(), email)) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        Ok(CreateOutcome::Created)
    }

    fn delete_identity(&self, project: &str, email: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("delete_identity {email}"));
        state
            .identities
            .remove(&(project.to_string(), email.to_string()));
        Ok(())
    }

    fn describe_service(&self, slot: &Slot) -> Result<Option<ObservedService>> {
        Ok(self.service(slot))
    }

    fn apply_service(&self, slot: &Slot, spec: &ServiceSpec) -> Result<String> {
        let mut state = self.state();
        state.calls.push(format!("apply_service {}", slot.service));
        if state.failing_applies > 0 {
            state.failing_applies -= 1;
            // A failed rollout still leaves the service object behind.
            let url = simulated_url(slot);
            state.services.entry(slot.clone()).or_insert(ObservedService {
                spec: spec.clone(),
                url,
            });
            bail!("revision failed to become ready: container did not start");
        }
        let url = simulated_url(slot);
        state.services.insert(
            slot.clone(),
            ObservedService {
                spec: spec.clone(),
                url: url.clone(),
            },
        );
        Ok(url)
    }

    fn delete_service(&self, slot: &Slot) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("delete_service {}", slot.service));
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            bail!("control plane unavailable");
        }
        state.services.remove(slot);
        state.public.remove(slot);
        Ok(())
    }

    fn public_access(&self, slot: &Slot) -> Result<bool> {
        Ok(self.is_public(slot))
    }

    fn set_public_access(&self, slot: &Slot, allowed: bool) -> Result<()> {
        let mut state = self.state();
        state
            .calls
            .push(format!("set_public_access {} {allowed}", slot.service));
        if allowed {
            if !state.services.contains_key(slot) {
                bail!("service {slot} not found");
            }
            state.public.insert(slot.clone());
        } else {
            state.public.remove(slot);
        }
        Ok(())
    }
}

fn simulated_url(slot: &Slot) -> String {
    format!("https://{}.{}.simulated.run.app", slot.service, slot.region)
}
