//! Dryad leasing.
//!
//! The job registry acquires a dryad through a [`ResourceBroker`] before
//! dispatching and releases it when the dispatch ends. [`DryadPool`] is the
//! default broker over a static set of configured dryads.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{BrokerConfig, DryadSlot};
use crate::dryad::Dryad;
use crate::error::{Result, WelesError};
use crate::spec::Capabilities;
use crate::JobId;

#[async_trait]
pub trait ResourceBroker: Send + Sync + 'static {
    /// Lease a dryad satisfying `capabilities` for `job_id`.
    async fn acquire(&self, job_id: JobId, capabilities: &Capabilities) -> Result<Dryad>;

    /// Return a leased dryad to the broker.
    async fn release(&self, dryad: &Dryad);
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub id: Uuid,
    pub job_id: JobId,
    pub since: Instant,
}

/// Pool bookkeeping for one dryad
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: DryadSlot,
    pub lease: Option<Lease>,
    pub idle_since: Instant,
}

impl SlotState {
    pub fn new(slot: DryadSlot) -> Self {
        Self {
            slot,
            lease: None,
            idle_since: Instant::now(),
        }
    }

    pub fn matches(&self, capabilities: &Capabilities) -> bool {
        capabilities
            .device_type
            .as_ref()
            .map_or(true, |t| *t == self.slot.device_type)
            && capabilities.labels.is_subset(&self.slot.labels)
    }

    pub fn is_idle(&self) -> bool {
        self.lease.is_none()
    }
}

/// Static pool of dryads leased one job at a time.
#[derive(Debug)]
pub struct DryadPool {
    slots: Mutex<Vec<SlotState>>,
    released: Notify,
    acquire_timeout: Duration,
}

impl DryadPool {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            slots: Mutex::new(config.dryads.iter().cloned().map(SlotState::new).collect()),
            released: Notify::new(),
            acquire_timeout: config.acquire_timeout,
        }
    }

    /// Add a dryad to the pool
    pub async fn add_dryad(&self, slot: DryadSlot) {
        tracing::info!(dryad = %slot.dryad, device_type = %slot.device_type, "Dryad added to pool");
        self.slots.lock().await.push(SlotState::new(slot));
        self.released.notify_waiters();
    }

    /// Snapshot of the pool
    pub async fn slots(&self) -> Vec<SlotState> {
        self.slots.lock().await.clone()
    }

    /// Number of idle dryads matching `capabilities`
    pub async fn available(&self, capabilities: &Capabilities) -> usize {
        self.slots
            .lock()
            .await
            .iter()
            .filter(|s| s.is_idle() && s.matches(capabilities))
            .count()
    }

    /// Lease the matching dryad idle the longest, if any is idle.
    async fn try_lease(&self, job_id: JobId, capabilities: &Capabilities) -> Result<Option<Dryad>> {
        let mut slots = self.slots.lock().await;
        if !slots.iter().any(|s| s.matches(capabilities)) {
            return Err(WelesError::ResourceUnavailable(format!(
                "no dryad matches device type {:?} with labels {:?}",
                capabilities.device_type, capabilities.labels
            )));
        }

        let Some(slot) = slots
            .iter_mut()
            .filter(|s| s.is_idle() && s.matches(capabilities))
            .min_by_key(|s| s.idle_since)
        else {
            return Ok(None);
        };

        let lease = Lease {
            id: Uuid::new_v4(),
            job_id,
            since: Instant::now(),
        };
        tracing::info!(job_id, dryad = %slot.slot.dryad, lease_id = %lease.id, "Dryad leased");
        slot.lease = Some(lease);
        Ok(Some(slot.slot.dryad.clone()))
    }
}

#[async_trait]
impl ResourceBroker for DryadPool {
    async fn acquire(&self, job_id: JobId, capabilities: &Capabilities) -> Result<Dryad> {
        let deadline = Instant::now()
            .checked_add(self.acquire_timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        loop {
            // Register interest before checking so a release in between is not lost.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(dryad) = self.try_lease(job_id, capabilities).await? {
                return Ok(dryad);
            }

            tracing::debug!(job_id, "All matching dryads are leased, waiting");
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(WelesError::ResourceUnavailable(format!(
                    "no matching dryad became free within {:?}",
                    self.acquire_timeout
                )));
            }
        }
    }

    async fn release(&self, dryad: &Dryad) {
        {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots
                .iter_mut()
                .find(|s| s.slot.dryad.addr == dryad.addr && s.lease.is_some())
            else {
                tracing::warn!(dryad = %dryad, "Release of a dryad that is not leased");
                return;
            };
            if let Some(lease) = slot.lease.take() {
                tracing::info!(
                    job_id = lease.job_id,
                    dryad = %dryad,
                    lease_id = %lease.id,
                    held_ms = lease.since.elapsed().as_millis() as u64,
                    "Dryad released"
                );
            }
            slot.idle_since = Instant::now();
        }
        self.released.notify_waiters();
    }
}
