//! Registration lifecycle run by every backend instance

use registry_core::{Lease, RegistryApi};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Where an instance stands with the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    /// No registration has succeeded yet
    Unregistered,
    /// Registered, no heartbeat sent since
    Registered,
    /// Last heartbeat succeeded
    Heartbeating,
    /// Last heartbeat failed and re-registration has not succeeded yet
    RenewFailed,
    /// Deregistration attempted at shutdown
    Deregistered,
}

/// RegistrationAgent keeps one instance's lease alive.
///
/// Registry failures are never fatal: a failed heartbeat triggers a full
/// re-registration and the loop carries on at the next tick.
pub struct RegistrationAgent {
    registry: Arc<dyn RegistryApi>,
    lease: Lease,
    heartbeat_interval: Duration,
    state: watch::Sender<AgentState>,
}

impl RegistrationAgent {
    pub fn new(registry: Arc<dyn RegistryApi>, lease: Lease, heartbeat_interval: Duration) -> Self {
        let (state, _) = watch::channel(AgentState::Unregistered);
        Self {
            registry,
            lease,
            heartbeat_interval,
            state,
        }
    }

    /// The lease descriptor this agent renews
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: AgentState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                "Agent for {}/{}: {:?} -> {:?}",
                self.lease.service_name, self.lease.instance_id, previous, next
            );
        }
    }

    /// Submit the full lease descriptor. Returns whether it was accepted.
    pub async fn register(&self) -> bool {
        match self.registry.register(self.lease.clone()).await {
            Ok(()) => {
                info!(
                    "Registered {} as {} at {}",
                    self.lease.service_name, self.lease.instance_id, self.lease.address
                );
                self.set_state(AgentState::Registered);
                true
            }
            Err(e) => {
                warn!(
                    "Registration of {} failed: {}; instance stays unroutable until a later attempt succeeds",
                    self.lease.service_name, e
                );
                false
            }
        }
    }

    /// One heartbeat tick, re-registering on any failure
    pub async fn renew(&self) {
        let result = self
            .registry
            .heartbeat(&self.lease.service_name, &self.lease.instance_id)
            .await;

        match result {
            Ok(()) => {
                debug!("Heartbeat sent for {}/{}", self.lease.service_name, self.lease.instance_id);
                self.set_state(AgentState::Heartbeating);
            }
            Err(e) => {
                if e.is_not_found() {
                    warn!("Lease for {} is unknown to the registry; re-registering", self.lease.service_name);
                } else {
                    warn!("Heartbeat for {} failed: {}; re-registering", self.lease.service_name, e);
                }
                self.set_state(AgentState::RenewFailed);
                self.register().await;
            }
        }
    }

    /// Best-effort removal of the lease. Failures are logged, not retried.
    pub async fn deregister(&self) {
        info!("Deregistering {}/{}", self.lease.service_name, self.lease.instance_id);
        if let Err(e) = self
            .registry
            .deregister(&self.lease.service_name, &self.lease.instance_id)
            .await
        {
            warn!(
                "Deregistration of {} failed: {}; lease will expire after {}s",
                self.lease.service_name, e, self.lease.ttl_seconds
            );
        }
        self.set_state(AgentState::Deregistered);
    }

    /// Register, then heartbeat in the background until shutdown is requested
    pub async fn start(self) -> AgentHandle {
        self.register().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_rx = self.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));

        AgentHandle {
            shutdown_tx,
            state_rx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now() + self.heartbeat_interval;
        let mut ticker = time::interval_at(start, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.renew().await,
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.deregister().await;
    }
}

/// Handle to a running agent
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<AgentState>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Stop heartbeating, deregister, and wait for the loop to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Registration agent task failed: {}", e);
        }
    }
}
