//! nimbus-billing — usage-based virtual billing.
//!
//! Every running instance accrues cpu, memory, and instance hours; the
//! background meter charges them once per interval. Accrual is persisted
//! per user and resets when the billing month rolls over. Amounts are
//! informational — nothing here gates admission.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use nimbus_state::{BillingRecord, InstanceStatus, StateStore};

/// Hourly rates in USD.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pricing {
    pub cpu_per_hour: f64,
    pub memory_per_hour: f64,
    pub instance_per_hour: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            cpu_per_hour: 0.02,
            memory_per_hour: 0.01,
            instance_per_hour: 0.005,
        }
    }
}

/// Errors from billing operations.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("state store error: {0}")]
    State(#[from] nimbus_state::StateError),
}

pub type BillingResult<T> = Result<T, BillingError>;

/// Accrued hours within the current billing month.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageHours {
    pub cpu_hours: f64,
    pub memory_gb_hours: f64,
    pub instance_hours: f64,
}

/// Cost per dimension, rounded to cents.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CostBreakdown {
    pub cpu_cost: f64,
    pub memory_cost: f64,
    pub instance_cost: f64,
}

/// What a user owes for the month so far.
#[derive(Debug, Clone, Serialize)]
pub struct BillingSummary {
    pub billing_month: String,
    pub usage: UsageHours,
    pub breakdown: CostBreakdown,
    pub total_amount: f64,
    pub currency: &'static str,
    pub days_remaining: i64,
    pub pricing: Pricing,
}

/// Accrues instance usage per user and prices it.
pub struct BillingService {
    store: StateStore,
    pricing: Pricing,
    /// Accrual is a read-modify-write on the store; one writer at a time.
    accrual: Mutex<()>,
}

impl BillingService {
    pub fn new(store: StateStore, pricing: Pricing) -> Self {
        Self {
            store,
            pricing,
            accrual: Mutex::new(()),
        }
    }

    /// Charge usage to a user's current month.
    pub async fn record_usage(
        &self,
        user_id: &str,
        cpu: u32,
        memory: u32,
        hours: f64,
    ) -> BillingResult<()> {
        let _guard = self.accrual.lock().await;
        let mut record = self.month_record(user_id)?;
        record.cpu_hours += f64::from(cpu) * hours;
        record.memory_gb_hours += f64::from(memory) * hours;
        record.instance_hours += hours;
        record.last_updated = Utc::now().timestamp().max(0) as u64;
        self.store.put_billing(&record)?;
        debug!(%user_id, cpu, memory, hours, "usage recorded");
        Ok(())
    }

    /// Charge every running instance for the given number of hours.
    pub async fn meter_running_instances(&self, hours: f64) -> BillingResult<usize> {
        let mut metered = 0;
        for instance in self.store.list_active_instances()? {
            if instance.status == InstanceStatus::Running {
                self.record_usage(&instance.user_id, instance.cpu, instance.memory, hours)
                    .await?;
                metered += 1;
            }
        }
        Ok(metered)
    }

    /// Month-to-date accrual, priced.
    pub async fn summary(&self, user_id: &str) -> BillingResult<BillingSummary> {
        let record = {
            let _guard = self.accrual.lock().await;
            self.month_record(user_id)?
        };
        let p = self.pricing;
        let breakdown = CostBreakdown {
            cpu_cost: cents(record.cpu_hours * p.cpu_per_hour),
            memory_cost: cents(record.memory_gb_hours * p.memory_per_hour),
            instance_cost: cents(record.instance_hours * p.instance_per_hour),
        };
        let total = record.cpu_hours * p.cpu_per_hour
            + record.memory_gb_hours * p.memory_per_hour
            + record.instance_hours * p.instance_per_hour;
        Ok(BillingSummary {
            billing_month: record.billing_month,
            usage: UsageHours {
                cpu_hours: record.cpu_hours,
                memory_gb_hours: record.memory_gb_hours,
                instance_hours: record.instance_hours,
            },
            breakdown,
            total_amount: cents(total),
            currency: "USD",
            days_remaining: days_remaining(Utc::now()),
            pricing: p,
        })
    }

    /// Background metering loop; one charge per elapsed interval until
    /// shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let hours = interval.as_secs_f64() / 3600.0;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick would charge time that never passed.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.meter_running_instances(hours).await {
                        Ok(metered) => debug!(metered, "usage metered"),
                        Err(e) => warn!(error = %e, "usage metering failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("billing meter stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Stored record if it belongs to the current month, else a fresh
    /// zeroed one — the monthly reset.
    fn month_record(&self, user_id: &str) -> BillingResult<BillingRecord> {
        let month = current_month();
        Ok(match self.store.get_billing(user_id)? {
            Some(record) if record.billing_month == month => record,
            _ => BillingRecord::open(user_id, month),
        })
    }
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

fn days_remaining(now: DateTime<Utc>) -> i64 {
    let first_of_next = if now.month() == 12 {
        NaiveDate::from_ymd_opt(now.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(now.year(), now.month() + 1, 1)
    };
    first_of_next
        .map(|d| (d - now.date_naive()).num_days())
        .unwrap_or(0)
}

fn cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nimbus_state::InstanceRecord;

    fn service() -> BillingService {
        BillingService::new(StateStore::open_in_memory().unwrap(), Pricing::default())
    }

    fn instance(id: &str, user: &str, status: InstanceStatus, cpu: u32, memory: u32) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            name: "web".to_string(),
            image: "ubuntu:22.04".to_string(),
            cpu,
            memory,
            node_id: "w-1".to_string(),
            port: 8000,
            status,
            created_at: 1000,
            started_at: Some(1000),
            stopped_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn usage_accrues_and_is_priced() {
        let svc = service();
        svc.record_usage("alice", 4, 8, 2.0).await.unwrap();

        let summary = svc.summary("alice").await.unwrap();
        assert_eq!(summary.usage.cpu_hours, 8.0);
        assert_eq!(summary.usage.memory_gb_hours, 16.0);
        assert_eq!(summary.usage.instance_hours, 2.0);
        assert_eq!(summary.breakdown.cpu_cost, 0.16);
        assert_eq!(summary.breakdown.memory_cost, 0.16);
        assert_eq!(summary.breakdown.instance_cost, 0.01);
        assert_eq!(summary.total_amount, 0.33);
        assert_eq!(summary.currency, "USD");
    }

    #[tokio::test]
    async fn month_rollover_resets_accrual() {
        let store = StateStore::open_in_memory().unwrap();
        let mut stale = BillingRecord::open("alice", "2021-03");
        stale.cpu_hours = 100.0;
        stale.instance_hours = 50.0;
        store.put_billing(&stale).unwrap();

        let svc = BillingService::new(store, Pricing::default());
        let summary = svc.summary("alice").await.unwrap();
        assert_eq!(summary.usage.cpu_hours, 0.0);
        assert_eq!(summary.total_amount, 0.0);
        assert_ne!(summary.billing_month, "2021-03");
    }

    #[tokio::test]
    async fn meter_charges_only_running_instances() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_instance(&instance("i-1", "alice", InstanceStatus::Running, 2, 4))
            .unwrap();
        store
            .put_instance(&instance("i-2", "alice", InstanceStatus::Stopped, 2, 4))
            .unwrap();
        store
            .put_instance(&instance("i-3", "bob", InstanceStatus::Running, 1, 1))
            .unwrap();

        let svc = BillingService::new(store, Pricing::default());
        assert_eq!(svc.meter_running_instances(1.0).await.unwrap(), 2);

        let alice = svc.summary("alice").await.unwrap();
        assert_eq!(alice.usage.cpu_hours, 2.0);
        assert_eq!(alice.usage.instance_hours, 1.0);
        let bob = svc.summary("bob").await.unwrap();
        assert_eq!(bob.usage.cpu_hours, 1.0);
    }

    #[tokio::test]
    async fn accrual_is_persisted_across_service_instances() {
        let store = StateStore::open_in_memory().unwrap();
        let svc = BillingService::new(store.clone(), Pricing::default());
        svc.record_usage("alice", 1, 1, 1.0).await.unwrap();

        let other = BillingService::new(store, Pricing::default());
        let summary = other.summary("alice").await.unwrap();
        assert_eq!(summary.usage.instance_hours, 1.0);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let svc = Arc::new(service());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&svc).run(Duration::from_secs(3600), rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn days_remaining_counts_to_the_first_of_next_month() {
        let august = Utc.with_ymd_and_hms(2026, 8, 29, 12, 0, 0).unwrap();
        assert_eq!(days_remaining(august), 3);

        // Year boundary.
        let december = Utc.with_ymd_and_hms(2026, 12, 30, 0, 0, 0).unwrap();
        assert_eq!(days_remaining(december), 2);
    }
}
