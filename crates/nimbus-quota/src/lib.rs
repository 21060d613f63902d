//! nimbus-quota — per-user resource admission and accounting.
//!
//! Tracks each user's instance count, CPU, and memory consumption
//! against configured limits. Reservations are atomic with respect to
//! concurrent requests for the same user: both the check and the
//! counter bump happen under one lock, so two requests that would
//! individually fit but jointly exceed the limit cannot both pass.
//!
//! Usage counters are a derived aggregate over the user's non-terminated
//! instances; [`QuotaService::rebuild`] recomputes them from the state
//! store at process start. Limits (`QuotaRecord`) are authoritative and
//! persisted.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use nimbus_state::{QuotaRecord, StateStore, UserId};

/// The quota dimension a rejection is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Instances,
    Cpu,
    Memory,
}

/// One failed dimension with its remaining headroom, so callers can
/// produce an actionable error.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DimensionHeadroom {
    pub dimension: QuotaDimension,
    pub requested: u32,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
}

/// Errors from quota operations.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Admission rejection; terminal for that request. Carries every
    /// dimension that failed.
    #[error("quota exceeded for user {user_id}: {}", describe(.failed))]
    Exceeded {
        user_id: UserId,
        failed: Vec<DimensionHeadroom>,
    },

    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),
}

pub type QuotaResult<T> = Result<T, QuotaError>;

fn describe(failed: &[DimensionHeadroom]) -> String {
    failed
        .iter()
        .map(|d| format!("{:?} (remaining {})", d.dimension, d.remaining))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Default per-user limits applied when no `QuotaRecord` is stored.
#[derive(Debug, Clone, Copy)]
pub struct DefaultLimits {
    pub max_instances: u32,
    pub max_cpu: u32,
    pub max_memory: u32,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            max_instances: 5,
            max_cpu: 16,
            max_memory: 32,
        }
    }
}

/// Current usage counters for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub used_instances: u32,
    pub used_cpu: u32,
    pub used_memory: u32,
}

/// Merged limits + usage view returned to callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuotaView {
    pub user_id: UserId,
    pub max_instances: u32,
    pub max_cpu: u32,
    pub max_memory: u32,
    pub used_instances: u32,
    pub used_cpu: u32,
    pub used_memory: u32,
}

impl QuotaView {
    pub fn available_instances(&self) -> u32 {
        self.max_instances.saturating_sub(self.used_instances)
    }

    pub fn available_cpu(&self) -> u32 {
        self.max_cpu.saturating_sub(self.used_cpu)
    }

    pub fn available_memory(&self) -> u32 {
        self.max_memory.saturating_sub(self.used_memory)
    }
}

/// Admits or rejects resource requests against per-user ceilings.
pub struct QuotaService {
    store: StateStore,
    defaults: DefaultLimits,
    usage: Mutex<HashMap<UserId, QuotaUsage>>,
}

impl QuotaService {
    pub fn new(store: StateStore, defaults: DefaultLimits) -> Self {
        Self {
            store,
            defaults,
            usage: Mutex::new(HashMap::new()),
        }
    }

    fn limits_for(&self, user_id: &str) -> QuotaResult<QuotaRecord> {
        Ok(self.store.get_quota(user_id)?.unwrap_or_else(|| {
            QuotaRecord::new(
                user_id,
                self.defaults.max_instances,
                self.defaults.max_cpu,
                self.defaults.max_memory,
            )
        }))
    }

    /// Atomically check the request against the user's headroom and, if
    /// it fits on every dimension, bump the usage counters.
    ///
    /// Equality is allowed: a request that lands exactly on the limit
    /// is admitted.
    pub async fn check_and_reserve(&self, user_id: &str, cpu: u32, memory: u32) -> QuotaResult<()> {
        let limits = self.limits_for(user_id)?;
        let mut usage = self.usage.lock().await;
        let current = usage.entry(user_id.to_string()).or_default();

        // A request large enough to overflow the sum is over any limit
        // by definition; it must not wrap and sneak past the check.
        let over =
            |used: u32, requested: u32, limit: u32| used.checked_add(requested).is_none_or(|total| total > limit);

        let mut failed = Vec::new();
        if over(current.used_instances, 1, limits.max_instances) {
            failed.push(DimensionHeadroom {
                dimension: QuotaDimension::Instances,
                requested: 1,
                limit: limits.max_instances,
                used: current.used_instances,
                remaining: limits.max_instances.saturating_sub(current.used_instances),
            });
        }
        if over(current.used_cpu, cpu, limits.max_cpu) {
            failed.push(DimensionHeadroom {
                dimension: QuotaDimension::Cpu,
                requested: cpu,
                limit: limits.max_cpu,
                used: current.used_cpu,
                remaining: limits.max_cpu.saturating_sub(current.used_cpu),
            });
        }
        if over(current.used_memory, memory, limits.max_memory) {
            failed.push(DimensionHeadroom {
                dimension: QuotaDimension::Memory,
                requested: memory,
                limit: limits.max_memory,
                used: current.used_memory,
                remaining: limits.max_memory.saturating_sub(current.used_memory),
            });
        }

        if !failed.is_empty() {
            return Err(QuotaError::Exceeded {
                user_id: user_id.to_string(),
                failed,
            });
        }

        current.used_instances += 1;
        current.used_cpu += cpu;
        current.used_memory += memory;
        debug!(%user_id, cpu, memory, "quota reserved");
        Ok(())
    }

    /// Return a reservation. Saturates at zero so duplicate releases
    /// (e.g. retried terminations) cannot underflow the counters.
    pub async fn release(&self, user_id: &str, cpu: u32, memory: u32) {
        let mut usage = self.usage.lock().await;
        let current = usage.entry(user_id.to_string()).or_default();
        current.used_instances = current.used_instances.saturating_sub(1);
        current.used_cpu = current.used_cpu.saturating_sub(cpu);
        current.used_memory = current.used_memory.saturating_sub(memory);
        debug!(%user_id, cpu, memory, "quota released");
    }

    /// Merged limits + usage for one user.
    pub async fn view(&self, user_id: &str) -> QuotaResult<QuotaView> {
        let limits = self.limits_for(user_id)?;
        let usage = self.usage.lock().await;
        let current = usage.get(user_id).copied().unwrap_or_default();
        Ok(QuotaView {
            user_id: user_id.to_string(),
            max_instances: limits.max_instances,
            max_cpu: limits.max_cpu,
            max_memory: limits.max_memory,
            used_instances: current.used_instances,
            used_cpu: current.used_cpu,
            used_memory: current.used_memory,
        })
    }

    /// Persist explicit limits for a user (administrative operation).
    pub fn set_limits(&self, quota: &QuotaRecord) -> QuotaResult<()> {
        self.store.put_quota(quota)?;
        Ok(())
    }

    /// Recompute every user's usage counters from the persisted
    /// non-terminated instance set. Called once at process start; the
    /// counters are derivable state, the instance table is the truth.
    pub async fn rebuild(&self) -> QuotaResult<()> {
        let mut fresh: HashMap<UserId, QuotaUsage> = HashMap::new();
        for instance in self.store.list_active_instances()? {
            let entry = fresh.entry(instance.user_id.clone()).or_default();
            entry.used_instances += 1;
            entry.used_cpu += instance.cpu;
            entry.used_memory += instance.memory;
        }
        let mut usage = self.usage.lock().await;
        *usage = fresh;
        debug!(users = usage.len(), "quota usage rebuilt from instance set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_state::{InstanceRecord, InstanceStatus};
    use std::sync::Arc;

    fn test_service() -> QuotaService {
        QuotaService::new(StateStore::open_in_memory().unwrap(), DefaultLimits::default())
    }

    fn active_instance(id: &str, user: &str, cpu: u32, memory: u32) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            name: "web".to_string(),
            image: "ubuntu:22.04".to_string(),
            cpu,
            memory,
            node_id: "node-01".to_string(),
            port: 8000,
            status: InstanceStatus::Running,
            created_at: 1000,
            started_at: Some(1000),
            stopped_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn reserve_within_limits_succeeds() {
        let svc = test_service();
        svc.check_and_reserve("alice", 2, 4).await.unwrap();

        let view = svc.view("alice").await.unwrap();
        assert_eq!(view.used_instances, 1);
        assert_eq!(view.used_cpu, 2);
        assert_eq!(view.used_memory, 4);
    }

    #[tokio::test]
    async fn reserve_up_to_exact_limit_is_allowed() {
        let svc = test_service();
        // Defaults: 16 cpu, 32 memory.
        svc.check_and_reserve("alice", 16, 32).await.unwrap();

        let view = svc.view("alice").await.unwrap();
        assert_eq!(view.available_cpu(), 0);
        assert_eq!(view.available_memory(), 0);
    }

    #[tokio::test]
    async fn rejection_names_every_failed_dimension() {
        let svc = test_service();
        svc.check_and_reserve("alice", 10, 20).await.unwrap();

        let err = svc.check_and_reserve("alice", 10, 20).await.unwrap_err();
        let QuotaError::Exceeded { failed, .. } = err else {
            panic!("expected Exceeded");
        };
        let dims: Vec<_> = failed.iter().map(|f| f.dimension).collect();
        assert_eq!(dims, vec![QuotaDimension::Cpu, QuotaDimension::Memory]);
        assert_eq!(failed[0].remaining, 6);
        assert_eq!(failed[1].remaining, 12);
    }

    #[tokio::test]
    async fn instance_count_limit_enforced() {
        let svc = test_service();
        for _ in 0..5 {
            svc.check_and_reserve("alice", 1, 1).await.unwrap();
        }

        let err = svc.check_and_reserve("alice", 1, 1).await.unwrap_err();
        let QuotaError::Exceeded { failed, .. } = err else {
            panic!("expected Exceeded");
        };
        assert_eq!(failed[0].dimension, QuotaDimension::Instances);
        assert_eq!(failed[0].remaining, 0);
    }

    #[tokio::test]
    async fn oversized_request_cannot_wrap_the_counters() {
        let svc = test_service();
        svc.check_and_reserve("alice", 2, 4).await.unwrap();

        // used + requested would overflow u32; must read as exceeded,
        // never as a wrapped small number.
        let err = svc
            .check_and_reserve("alice", u32::MAX, u32::MAX)
            .await
            .unwrap_err();
        let QuotaError::Exceeded { failed, .. } = err else {
            panic!("expected Exceeded");
        };
        let dims: Vec<_> = failed.iter().map(|f| f.dimension).collect();
        assert_eq!(dims, vec![QuotaDimension::Cpu, QuotaDimension::Memory]);

        // The rejected request left the counters untouched.
        let view = svc.view("alice").await.unwrap();
        assert_eq!(view.used_instances, 1);
        assert_eq!(view.used_cpu, 2);
        assert_eq!(view.used_memory, 4);
    }

    #[tokio::test]
    async fn stored_limits_override_defaults() {
        let svc = test_service();
        svc.set_limits(&QuotaRecord::new("vip", 10, 64, 128)).unwrap();

        svc.check_and_reserve("vip", 32, 64).await.unwrap();
        let view = svc.view("vip").await.unwrap();
        assert_eq!(view.max_cpu, 64);
        assert_eq!(view.available_cpu(), 32);
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let svc = test_service();
        svc.check_and_reserve("alice", 2, 4).await.unwrap();

        svc.release("alice", 2, 4).await;
        svc.release("alice", 2, 4).await; // duplicate, no underflow

        let view = svc.view("alice").await.unwrap();
        assert_eq!(view.used_instances, 0);
        assert_eq!(view.used_cpu, 0);
        assert_eq!(view.used_memory, 0);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let svc = test_service();
        svc.check_and_reserve("alice", 16, 32).await.unwrap();

        // Bob's headroom is untouched by Alice's reservations.
        svc.check_and_reserve("bob", 16, 32).await.unwrap();
    }

    #[tokio::test]
    async fn rebuild_recomputes_from_active_instances() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&active_instance("i-1", "alice", 2, 4)).unwrap();
        store.put_instance(&active_instance("i-2", "alice", 4, 8)).unwrap();
        let mut terminated = active_instance("i-3", "alice", 8, 16);
        terminated.status = InstanceStatus::Terminated;
        store.put_instance(&terminated).unwrap();

        let svc = QuotaService::new(store, DefaultLimits::default());
        svc.rebuild().await.unwrap();

        let view = svc.view("alice").await.unwrap();
        assert_eq!(view.used_instances, 2);
        assert_eq!(view.used_cpu, 6);
        assert_eq!(view.used_memory, 12);
    }

    #[tokio::test]
    async fn concurrent_reservations_cannot_jointly_overcommit() {
        let svc = Arc::new(test_service());
        // Each request asks for exactly half the cpu limit plus one, so
        // either alone fits but both together exceed it.
        let a = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.check_and_reserve("alice", 9, 8).await })
        };
        let b = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.check_and_reserve("alice", 9, 8).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);

        let view = svc.view("alice").await.unwrap();
        assert!(view.used_cpu <= view.max_cpu);
    }

    #[tokio::test]
    async fn concurrent_reservations_that_fit_both_succeed() {
        let svc = Arc::new(test_service());
        let a = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.check_and_reserve("alice", 4, 8).await })
        };
        let b = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.check_and_reserve("alice", 4, 8).await })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
    }
}
