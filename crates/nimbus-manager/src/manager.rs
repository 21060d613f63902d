//! Instance lifecycle orchestration.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nimbus_ports::PortAllocator;
use nimbus_quota::{QuotaService, QuotaView};
use nimbus_scheduler::CapacityScheduler;
use nimbus_state::{InstanceRecord, InstanceStatus, StateStore, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ManagerError, ManagerResult};
use crate::runtime::ContainerRuntime;

/// A user's request for a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub user_id: UserId,
    pub name: String,
    pub image: String,
    /// CPU cores.
    pub cpu: u32,
    /// Memory in GB.
    pub memory: u32,
}

impl CreateRequest {
    fn validate(&self) -> ManagerResult<()> {
        if self.name.trim().is_empty() {
            return Err(ManagerError::InvalidRequest("name must not be empty".into()));
        }
        if self.image.trim().is_empty() {
            return Err(ManagerError::InvalidRequest("image must not be empty".into()));
        }
        if self.cpu == 0 || self.memory == 0 {
            return Err(ManagerError::InvalidRequest(
                "cpu and memory must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long an instance may sit in `pending` across a restart
    /// before recovery writes it off as failed.
    pub pending_grace: Duration,
    /// Upper bound for a single container runtime call.
    pub runtime_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pending_grace: Duration::from_secs(120),
            runtime_timeout: Duration::from_secs(30),
        }
    }
}

/// What startup recovery found and did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryReport {
    pub restored_ports: usize,
    pub expired_pending: usize,
}

/// Per-user instance counts alongside the user's quota view.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub stopped: usize,
    pub terminated: usize,
    pub error: usize,
    pub quota: QuotaView,
}

pub struct InstanceManager {
    store: StateStore,
    scheduler: CapacityScheduler,
    ports: Arc<PortAllocator>,
    quotas: Arc<QuotaService>,
    runtime: Arc<dyn ContainerRuntime>,
    config: ManagerConfig,
    /// Serializes every state-machine mutation: admission on create,
    /// and the whole of stop/start/terminate. No two lifecycle calls
    /// can interleave between a status check and its state write.
    /// Container starts on the create path run outside this lock;
    /// the commit re-checks status under it.
    admission: Mutex<()>,
}

impl InstanceManager {
    pub fn new(
        store: StateStore,
        scheduler: CapacityScheduler,
        ports: Arc<PortAllocator>,
        quotas: Arc<QuotaService>,
        runtime: Arc<dyn ContainerRuntime>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            ports,
            quotas,
            runtime,
            config,
            admission: Mutex::new(()),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Admit and launch a new instance.
    ///
    /// On any failure past the quota reservation the reservation is
    /// rolled back; a runtime failure additionally leaves the instance
    /// behind in `error` state for inspection, holding no resources.
    pub async fn create(&self, request: CreateRequest) -> ManagerResult<InstanceRecord> {
        request.validate()?;

        let (instance, node) = {
            let _admission = self.admission.lock().await;

            self.quotas
                .check_and_reserve(&request.user_id, request.cpu, request.memory)
                .await?;

            let node = match self.scheduler.select_node(request.cpu, request.memory) {
                Ok(node) => node,
                Err(e) => {
                    self.quotas
                        .release(&request.user_id, request.cpu, request.memory)
                        .await;
                    return Err(e.into());
                }
            };

            let port = match self.ports.allocate(&node.id).await {
                Ok(port) => port,
                Err(e) => {
                    self.quotas
                        .release(&request.user_id, request.cpu, request.memory)
                        .await;
                    return Err(e.into());
                }
            };

            let instance = InstanceRecord {
                id: Uuid::new_v4().to_string(),
                user_id: request.user_id.clone(),
                name: request.name.clone(),
                image: request.image.clone(),
                cpu: request.cpu,
                memory: request.memory,
                node_id: node.id.clone(),
                port,
                status: InstanceStatus::Pending,
                created_at: unix_now(),
                started_at: None,
                stopped_at: None,
                error_message: None,
            };

            if let Err(e) = self.store.put_instance(&instance) {
                self.ports.release(&node.id, port).await;
                self.quotas
                    .release(&request.user_id, request.cpu, request.memory)
                    .await;
                return Err(e.into());
            }

            (instance, node)
        };

        info!(
            instance_id = %instance.id,
            user_id = %instance.user_id,
            node_id = %node.id,
            port = instance.port,
            cpu = instance.cpu,
            memory = instance.memory,
            "instance admitted"
        );

        let outcome = self.bounded(self.runtime.start(&instance, &node)).await;

        // The container start ran unlocked, so a terminate may have
        // raced it and already released the port and quota. Re-read
        // under the lock before committing anything.
        let _admission = self.admission.lock().await;
        let current = self
            .store
            .get_instance(&instance.id)?
            .ok_or_else(|| ManagerError::NotFound(instance.id.clone()))?;
        if current.status != InstanceStatus::Pending {
            if outcome.is_ok() {
                // The instance was terminated mid-start but its
                // container came up; tear it down best-effort.
                if let Err(reason) = self.bounded(self.runtime.remove(&current)).await {
                    warn!(instance_id = %current.id, %reason, "teardown of raced start failed");
                }
            }
            return Ok(current);
        }

        match outcome {
            Ok(()) => {
                let mut running = current;
                running.status = InstanceStatus::Running;
                running.started_at = Some(unix_now());
                self.store.put_instance(&running)?;
                info!(instance_id = %running.id, "instance running");
                Ok(running)
            }
            Err(reason) => self.fail_and_release(current, "start", reason).await,
        }
    }

    /// Stop a running instance. The node placement and port are kept
    /// so the instance can be started again in place.
    ///
    /// A runtime failure leaves the instance untouched; it keeps
    /// running as far as the control plane knows and the caller can
    /// retry.
    pub async fn stop(&self, user_id: Option<&str>, id: &str) -> ManagerResult<InstanceRecord> {
        // Held across the runtime call so the status check and the
        // state write cannot interleave with another lifecycle call.
        let _admission = self.admission.lock().await;
        let mut instance = self.owned(user_id, id)?;
        if instance.status != InstanceStatus::Running {
            return Err(ManagerError::InvalidTransition {
                id: instance.id,
                from: instance.status,
                action: "stop",
            });
        }

        if let Err(reason) = self.bounded(self.runtime.stop(&instance)).await {
            warn!(instance_id = %instance.id, %reason, "runtime stop failed");
            return Err(ManagerError::RuntimeFailure {
                id: instance.id,
                reason,
            });
        }

        instance.status = InstanceStatus::Stopped;
        instance.stopped_at = Some(unix_now());
        self.store.put_instance(&instance)?;
        info!(instance_id = %instance.id, "instance stopped");
        Ok(instance)
    }

    /// Restart a stopped instance on its original node and port. A
    /// runtime failure leaves it stopped and retryable.
    pub async fn start(&self, user_id: Option<&str>, id: &str) -> ManagerResult<InstanceRecord> {
        let _admission = self.admission.lock().await;
        let mut instance = self.owned(user_id, id)?;
        if instance.status != InstanceStatus::Stopped {
            return Err(ManagerError::InvalidTransition {
                id: instance.id,
                from: instance.status,
                action: "start",
            });
        }

        let Some(node) = self.store.get_node(&instance.node_id)? else {
            // The node left the fleet while the instance was stopped.
            return Err(ManagerError::RuntimeFailure {
                id: instance.id,
                reason: "node no longer registered".into(),
            });
        };

        if let Err(reason) = self.bounded(self.runtime.start(&instance, &node)).await {
            warn!(instance_id = %instance.id, %reason, "runtime restart failed");
            return Err(ManagerError::RuntimeFailure {
                id: instance.id,
                reason,
            });
        }

        instance.status = InstanceStatus::Running;
        instance.started_at = Some(unix_now());
        instance.stopped_at = None;
        self.store.put_instance(&instance)?;
        info!(instance_id = %instance.id, node_id = %node.id, "instance restarted");
        Ok(instance)
    }

    /// Terminate an instance and release its port and quota.
    ///
    /// Idempotent: terminating a terminated instance returns it
    /// unchanged. A runtime removal failure is logged but does not
    /// block termination — the record is the source of truth and the
    /// engine can be reconciled later.
    pub async fn terminate(&self, user_id: Option<&str>, id: &str) -> ManagerResult<InstanceRecord> {
        // A retried terminate waits here and then observes the
        // terminal status, so the port and quota release exactly once.
        let _admission = self.admission.lock().await;
        let mut instance = self.owned(user_id, id)?;

        match instance.status {
            InstanceStatus::Terminated => return Ok(instance),
            InstanceStatus::Error => {
                // Resources were already released when it failed.
                instance.status = InstanceStatus::Terminated;
                self.store.put_instance(&instance)?;
                return Ok(instance);
            }
            _ => {}
        }

        if let Err(reason) = self.bounded(self.runtime.remove(&instance)).await {
            warn!(instance_id = %instance.id, %reason, "runtime removal failed, terminating anyway");
        }

        self.ports.release(&instance.node_id, instance.port).await;
        self.quotas
            .release(&instance.user_id, instance.cpu, instance.memory)
            .await;

        instance.status = InstanceStatus::Terminated;
        if instance.stopped_at.is_none() {
            instance.stopped_at = Some(unix_now());
        }
        self.store.put_instance(&instance)?;
        info!(instance_id = %instance.id, "instance terminated");
        Ok(instance)
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Fetch one instance. With an acting user, ownership is enforced;
    /// without one the call is an operator lookup.
    pub fn get(&self, user_id: Option<&str>, id: &str) -> ManagerResult<InstanceRecord> {
        self.owned(user_id, id)
    }

    /// List instances newest first, optionally scoped to a user and
    /// filtered by status. Without a status filter, terminated
    /// instances are hidden; ask for them explicitly.
    pub fn list(
        &self,
        user_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> ManagerResult<Vec<InstanceRecord>> {
        let mut instances = match user_id {
            Some(user) => self.store.list_instances_for_user(user)?,
            None => self.store.list_instances()?,
        };
        instances.retain(|i| match status {
            Some(wanted) => i.status == wanted,
            None => i.status != InstanceStatus::Terminated,
        });
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    /// Status counts plus quota view for one user.
    pub async fn summary(&self, user_id: &str) -> ManagerResult<UserSummary> {
        let instances = self.store.list_instances_for_user(user_id)?;
        let count = |s: InstanceStatus| instances.iter().filter(|i| i.status == s).count();
        Ok(UserSummary {
            user_id: user_id.to_string(),
            total: instances.len(),
            pending: count(InstanceStatus::Pending),
            running: count(InstanceStatus::Running),
            stopped: count(InstanceStatus::Stopped),
            terminated: count(InstanceStatus::Terminated),
            error: count(InstanceStatus::Error),
            quota: self.quotas.view(user_id).await?,
        })
    }

    // ── Recovery ──────────────────────────────────────────────────

    /// Rebuild the derived aggregates from the persisted instance set.
    /// Called once at process start, before any request is served.
    ///
    /// Instances still `pending` past the grace period were orphaned by
    /// a crash mid-launch; they are written off as failed and hold no
    /// resources afterwards.
    pub async fn recover(&self) -> ManagerResult<RecoveryReport> {
        let now = unix_now();
        let mut report = RecoveryReport::default();

        for mut instance in self.store.list_active_instances()? {
            if instance.status == InstanceStatus::Pending
                && now.saturating_sub(instance.created_at) > self.config.pending_grace.as_secs()
            {
                warn!(instance_id = %instance.id, "expiring instance orphaned in pending");
                instance.status = InstanceStatus::Error;
                instance.error_message = Some("orphaned in pending across restart".into());
                self.store.put_instance(&instance)?;
                report.expired_pending += 1;
                continue;
            }
            self.ports.restore(&instance.node_id, instance.port).await?;
            report.restored_ports += 1;
        }

        self.quotas.rebuild().await?;
        info!(
            restored_ports = report.restored_ports,
            expired_pending = report.expired_pending,
            "instance state recovered"
        );
        Ok(report)
    }

    // ── Internals ─────────────────────────────────────────────────

    /// Fetch an instance and enforce ownership when an acting user is
    /// given. A foreign instance is reported as missing so ids cannot
    /// be probed across users.
    fn owned(&self, user_id: Option<&str>, id: &str) -> ManagerResult<InstanceRecord> {
        match self.store.get_instance(id)? {
            Some(instance) if user_id.is_none_or(|u| instance.user_id == u) => Ok(instance),
            _ => Err(ManagerError::NotFound(id.to_string())),
        }
    }

    /// Bound a runtime call with the configured timeout, flattening
    /// engine errors and timeouts into one reason string.
    async fn bounded(
        &self,
        call: impl Future<Output = Result<(), crate::runtime::RuntimeError>>,
    ) -> Result<(), String> {
        match tokio::time::timeout(self.config.runtime_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "runtime call exceeded {}s",
                self.config.runtime_timeout.as_secs()
            )),
        }
    }

    /// Move an instance to `error` and release everything it held.
    async fn fail_and_release(
        &self,
        mut instance: InstanceRecord,
        action: &str,
        reason: String,
    ) -> ManagerResult<InstanceRecord> {
        warn!(instance_id = %instance.id, action, %reason, "runtime failure");
        self.ports.release(&instance.node_id, instance.port).await;
        self.quotas
            .release(&instance.user_id, instance.cpu, instance.memory)
            .await;

        instance.status = InstanceStatus::Error;
        instance.error_message = Some(reason.clone());
        self.store.put_instance(&instance)?;

        Err(ManagerError::RuntimeFailure {
            id: instance.id,
            reason,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
