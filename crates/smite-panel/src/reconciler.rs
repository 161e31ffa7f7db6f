//! Drives every tunnel toward its submitted spec.
//!
//! Each tunnel id gets one worker task fed through a `watch` channel, so at
//! most one apply or remove runs per tunnel and a newer submission replaces
//! any queued one. Every dispatch carries a generation; a worker's result is
//! only committed while its generation is still current, which is what keeps
//! a superseded apply from ever marking a deleted tunnel active.
//!
//! Applies the reconciler schedules on its own (restore, backend reset, node
//! reconnect) go through [`Reconciler::redrive`] and never replace a remove.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use smite_core::BackoffPolicy;
use smite_core::config::{AutoResetConfig, PanelConfig, PortRange};

use crate::backend::{ApplyOutcome, BackendStatus, ForwardingEngine, ReverseBackend};
use crate::error::ReconcileError;
use crate::model::{BackendKind, NodeStatus, Tunnel, TunnelRequest, TunnelStatus};
use crate::registry::{NodeEvent, NodeRegistry};
use crate::status::{Signal, StatusChange, StatusTracker, TunnelState, aggregate};
use crate::storage::{DatabaseError, PanelDatabase, TunnelRow};
use crate::validator::{ValidationContext, ValidationError, ValidationKind, validate};

#[derive(Debug, Clone)]
enum Op {
    Apply { tunnel: Tunnel, force: bool },
    Remove { tunnel: Tunnel },
}

#[derive(Debug, Clone)]
struct Desired {
    op: Op,
    generation: u64,
}

struct Worker {
    tx: watch::Sender<Desired>,
    generation: u64,
    /// The latest op is a remove. Only a new submission may replace it.
    removing: bool,
}

/// Per-backend health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHealth {
    pub backend: BackendKind,
    pub active_tunnels: usize,
    /// False when an active tunnel's backend is not actually carrying it.
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    pub node_id: String,
    pub name: String,
    pub online: bool,
    pub active_tunnels: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub backends: Vec<BackendHealth>,
    pub nodes: Vec<NodeHealth>,
}

pub struct Reconciler {
    db: PanelDatabase,
    registry: Arc<NodeRegistry>,
    forwarding: Arc<ForwardingEngine>,
    reverse: Arc<ReverseBackend>,
    status: StatusTracker,
    port_range: PortRange,
    retry: BackoffPolicy,
    /// Serializes admission (validate + persist) against node deletion.
    admission: tokio::sync::Mutex<()>,
    workers: Mutex<HashMap<String, Worker>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        db: PanelDatabase,
        registry: Arc<NodeRegistry>,
        forwarding: Arc<ForwardingEngine>,
        reverse: Arc<ReverseBackend>,
        config: &PanelConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            registry,
            forwarding,
            reverse,
            status: StatusTracker::new(),
            port_range: config.port_range,
            retry: config.retry.clone(),
            admission: tokio::sync::Mutex::new(()),
            workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    // =========================================================================
    // Inbound operations
    // =========================================================================

    /// Validate and accept a desired spec, then schedule its reconciliation.
    ///
    /// Permanent problems are returned immediately. A rejected spec for a new
    /// id is recorded as `error`; a rejected replacement leaves the existing
    /// tunnel untouched.
    pub async fn submit_spec(
        self: &Arc<Self>,
        req: TunnelRequest,
    ) -> Result<TunnelState, ReconcileError> {
        let _admission = self.admission.lock().await;

        let existing = self.find_tunnel(&req.id).await?;
        let claims = self.claims().await?;
        let nodes = self.registry.node_ids().await;
        let ctx = ValidationContext {
            port_range: self.port_range,
            claims: &claims,
            nodes: &nodes,
        };

        let tunnel = match validate(&req, &ctx) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let err = ReconcileError::from(e);
                warn!(tunnel_id = %req.id, error = %err, "Tunnel spec rejected");
                if existing.is_none() {
                    self.status
                        .set(&req.id, TunnelStatus::Error, Some(err.to_string()));
                }
                return Err(err);
            }
        };

        let status = match self.status.get(&tunnel.id).map(|s| s.status) {
            None | Some(TunnelStatus::Error | TunnelStatus::Stopped) => {
                self.status.set(&tunnel.id, TunnelStatus::Pending, None);
                TunnelStatus::Pending
            }
            Some(current) => current,
        };
        let reason = self.status.get(&tunnel.id).and_then(|s| s.reason);
        self.db
            .upsert_tunnel(&tunnel, status, reason.as_deref())
            .await?;

        info!(tunnel_id = %tunnel.id, kind = %tunnel.kind, "Tunnel spec accepted");
        self.dispatch(Op::Apply {
            tunnel: tunnel.clone(),
            force: false,
        });

        self.status
            .get(&tunnel.id)
            .ok_or_else(|| ReconcileError::NotFound(format!("tunnel {}", tunnel.id)))
    }

    /// Stop a tunnel. Any in-flight apply is superseded and a remove is
    /// scheduled immediately; the tunnel reads `stopped` once it completes.
    pub async fn delete_tunnel(self: &Arc<Self>, tunnel_id: &str) -> Result<(), ReconcileError> {
        let _admission = self.admission.lock().await;
        let row = self
            .find_tunnel(tunnel_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("tunnel {tunnel_id}")))?;
        let tunnel = row.tunnel()?;

        let idle = !self.workers().contains_key(tunnel_id);
        if row.status() == TunnelStatus::Stopped && idle {
            debug!(tunnel_id = %tunnel_id, "Tunnel already stopped");
            return Ok(());
        }

        info!(tunnel_id = %tunnel_id, "Tunnel removal scheduled");
        self.dispatch(Op::Remove { tunnel });
        Ok(())
    }

    pub fn get_status(&self, tunnel_id: &str) -> Option<TunnelState> {
        self.status.get(tunnel_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status.subscribe()
    }

    /// Every tunnel the tracker knows about, sorted by id.
    pub fn statuses(&self) -> Vec<(String, TunnelState)> {
        self.status.snapshot()
    }

    /// Delete a node record. Refused while any tunnel that is not stopped
    /// still references it.
    pub async fn delete_node(&self, node_id: &str) -> Result<(), ReconcileError> {
        let _admission = self.admission.lock().await;
        let count = self.db.count_live_tunnels_for_node(node_id).await?;
        if count > 0 {
            return Err(ReconcileError::NodeInUse {
                node_id: node_id.to_string(),
                count,
            });
        }
        self.registry.remove(node_id).await?;
        Ok(())
    }

    /// Re-drive persisted tunnels after a restart.
    pub async fn restore(self: &Arc<Self>) -> Result<usize, ReconcileError> {
        let mut restored = 0;
        for row in self.db.list_tunnels().await? {
            let status = row.status();
            self.status.seed(&row.id, status, row.reason.clone());
            if status == TunnelStatus::Stopped {
                continue;
            }
            match row.tunnel() {
                Ok(tunnel) => {
                    if self.redrive(tunnel, false) {
                        restored += 1;
                    }
                }
                Err(e) => warn!(tunnel_id = %row.id, error = %e, "Skipping unreadable tunnel"),
            }
        }
        info!(count = restored, "Tunnels restored");
        Ok(restored)
    }

    /// Force-reapply every active tunnel of one backend. Returns how many
    /// were scheduled.
    pub async fn reset_backend(
        self: &Arc<Self>,
        backend: BackendKind,
    ) -> Result<usize, ReconcileError> {
        let mut scheduled = 0;
        for row in self.db.list_tunnels().await? {
            let Ok(tunnel) = row.tunnel() else { continue };
            let active = self
                .status
                .get(&tunnel.id)
                .is_some_and(|s| s.status == TunnelStatus::Active);
            if tunnel.backend() == backend && active && self.redrive(tunnel, true) {
                scheduled += 1;
            }
        }
        info!(backend = backend.as_str(), count = scheduled, "Backend reset");
        Ok(scheduled)
    }

    pub async fn health(&self) -> Result<HealthReport, ReconcileError> {
        let active: Vec<Tunnel> = self
            .db
            .list_tunnels()
            .await?
            .iter()
            .filter(|row| {
                self.status
                    .get(&row.id)
                    .is_some_and(|s| s.status == TunnelStatus::Active)
            })
            .filter_map(|row| row.tunnel().ok())
            .collect();

        let mut backends = Vec::new();
        for backend in [BackendKind::Forwarding, BackendKind::Reverse] {
            let tunnels: Vec<&Tunnel> = active.iter().filter(|t| t.backend() == backend).collect();
            let mut healthy = true;
            for tunnel in &tunnels {
                let carried = match backend {
                    BackendKind::Forwarding => {
                        self.forwarding.status(&tunnel.id) == BackendStatus::Running
                    }
                    BackendKind::Reverse => match tunnel.node_id.as_deref() {
                        Some(node_id) => self.registry.is_online(node_id).await,
                        None => false,
                    },
                };
                healthy &= carried;
            }
            backends.push(BackendHealth {
                backend,
                active_tunnels: tunnels.len(),
                healthy,
            });
        }

        let mut per_node: BTreeMap<&str, usize> = BTreeMap::new();
        for tunnel in &active {
            if let Some(node_id) = tunnel.node_id.as_deref() {
                *per_node.entry(node_id).or_default() += 1;
            }
        }
        let nodes = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|node| NodeHealth {
                active_tunnels: per_node.get(node.id.as_str()).copied().unwrap_or(0),
                online: node.status == NodeStatus::Online,
                node_id: node.id,
                name: node.name,
            })
            .collect();

        Ok(HealthReport { backends, nodes })
    }

    /// Stop background work and tear down local listeners.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.forwarding.shutdown().await;
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// React to node liveness: degrade a node's active tunnels when it goes
    /// offline; re-drive them and resend unconfirmed removals when it returns.
    pub fn spawn_node_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = reconciler.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(NodeEvent::Offline(node_id)) => reconciler.node_offline(&node_id).await,
                    Ok(NodeEvent::Online(node_id)) => reconciler.node_online(&node_id).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Node events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Node watch stopped");
        })
    }

    /// Run [`reset_backend`](Self::reset_backend) on each enabled schedule.
    pub fn spawn_auto_reset(self: &Arc<Self>, config: &AutoResetConfig) -> Vec<JoinHandle<()>> {
        [
            (BackendKind::Forwarding, config.forwarding.interval()),
            (BackendKind::Reverse, config.reverse.interval()),
        ]
        .into_iter()
        .filter_map(|(backend, interval)| interval.map(|i| (backend, i)))
        .map(|(backend, interval)| {
            let reconciler = Arc::clone(self);
            info!(backend = backend.as_str(), interval_secs = interval.as_secs(), "Auto reset enabled");
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = reconciler.shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = reconciler.reset_backend(backend).await {
                                warn!(backend = backend.as_str(), error = %e, "Auto reset failed");
                            }
                        }
                    }
                }
            })
        })
        .collect()
    }

    async fn node_offline(&self, node_id: &str) {
        let rows = match self.tunnels_on_node(node_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Failed to list node tunnels");
                return;
            }
        };
        let reason = offline_reason(node_id);
        for row in rows {
            let active = self
                .status
                .get(&row.id)
                .is_some_and(|s| s.status == TunnelStatus::Active);
            if !active {
                continue;
            }
            let degraded = aggregate(Signal::Agent {
                node_online: false,
                acked: true,
            });
            if self.status.set(&row.id, degraded, Some(reason.clone())) {
                self.persist_status(&row.id, degraded, Some(&reason)).await;
            }
        }
    }

    async fn node_online(self: &Arc<Self>, node_id: &str) {
        match self.tunnels_on_node(node_id).await {
            Ok(rows) => {
                for row in rows {
                    match row.tunnel() {
                        Ok(tunnel) => {
                            self.redrive(tunnel, false);
                        }
                        Err(e) => warn!(tunnel_id = %row.id, error = %e, "Skipping unreadable tunnel"),
                    }
                }
            }
            Err(e) => warn!(node_id = %node_id, error = %e, "Failed to list node tunnels"),
        }

        // Removals can wait on acks; keep them off the event loop.
        let reconciler = Arc::clone(self);
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            reconciler.resend_removals(&node_id).await;
        });
    }

    async fn resend_removals(&self, node_id: &str) {
        let pending = match self.db.list_unconfirmed_removals(node_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Failed to list unconfirmed removals");
                return;
            }
        };
        for applied in pending {
            match self.reverse.remove(&applied.tunnel_id, node_id).await {
                Ok(()) => {
                    info!(tunnel_id = %applied.tunnel_id, node_id = %node_id, "Removal confirmed");
                    if let Err(e) = self.db.delete_applied_config(&applied.tunnel_id).await {
                        warn!(tunnel_id = %applied.tunnel_id, error = %e, "Failed to drop applied config");
                    }
                }
                Err(e) => {
                    warn!(tunnel_id = %applied.tunnel_id, node_id = %node_id, error = %e, "Removal still unconfirmed");
                }
            }
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Hand `op` to the tunnel's worker, starting one if needed.
    fn dispatch(self: &Arc<Self>, op: Op) {
        self.schedule(op, false);
    }

    /// Schedule an apply the reconciler decided on by itself. Skipped, and
    /// false returned, while a remove is queued or running for the tunnel or
    /// once the tunnel is stopped.
    fn redrive(self: &Arc<Self>, tunnel: Tunnel, force: bool) -> bool {
        self.schedule(Op::Apply { tunnel, force }, true)
    }

    fn schedule(self: &Arc<Self>, op: Op, internal: bool) -> bool {
        let tunnel_id = match &op {
            Op::Apply { tunnel, .. } | Op::Remove { tunnel } => tunnel.id.clone(),
        };
        let removing = matches!(op, Op::Remove { .. });

        let mut workers = self.workers();
        let live = workers.get(&tunnel_id).filter(|w| !w.tx.is_closed());
        if internal {
            let blocked = match live {
                Some(worker) => worker.removing,
                None => self
                    .status
                    .get(&tunnel_id)
                    .is_some_and(|s| s.status == TunnelStatus::Stopped),
            };
            if blocked {
                debug!(tunnel_id = %tunnel_id, "Tunnel is being removed, not re-applying");
                return false;
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let desired = Desired { op, generation };
        if live.is_some() {
            if let Some(worker) = workers.get_mut(&tunnel_id) {
                worker.generation = generation;
                worker.removing = removing;
                worker.tx.send_replace(desired);
            }
            return true;
        }

        let (tx, rx) = watch::channel(desired);
        workers.insert(
            tunnel_id.clone(),
            Worker {
                tx,
                generation,
                removing,
            },
        );
        drop(workers);

        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            reconciler.run_worker(tunnel_id, rx).await;
        });
        true
    }

    #[instrument(skip(self, rx), fields(tunnel_id = %tunnel_id))]
    async fn run_worker(self: Arc<Self>, tunnel_id: String, mut rx: watch::Receiver<Desired>) {
        let mut attempt: u32 = 0;
        let mut current_generation = 0;

        loop {
            let desired = rx.borrow_and_update().clone();
            if desired.generation != current_generation {
                current_generation = desired.generation;
                attempt = 0;
            }

            let (tunnel, force) = match desired.op {
                Op::Remove { tunnel } => {
                    self.remove_tunnel(&tunnel).await;
                    self.commit(&tunnel.id, desired.generation, TunnelStatus::Stopped, None)
                        .await;
                    if self.retire(&tunnel_id, desired.generation) {
                        return;
                    }
                    continue;
                }
                Op::Apply { tunnel, force } => (tunnel, force),
            };

            // The state machine only re-enters apply through pending.
            let restarting = self
                .status
                .get(&tunnel.id)
                .is_some_and(|s| matches!(s.status, TunnelStatus::Error | TunnelStatus::Stopped));
            if restarting {
                let reason = (attempt > 0).then(|| format!("retrying (attempt {})", attempt + 1));
                self.commit(&tunnel.id, desired.generation, TunnelStatus::Pending, reason)
                    .await;
            }

            let result = match tunnel.backend() {
                BackendKind::Forwarding => Some(self.apply_forwarding(&tunnel, force).await),
                // An unanswered push is abandoned as soon as a newer op arrives.
                BackendKind::Reverse => tokio::select! {
                    biased;
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        None
                    }
                    result = self.apply_reverse(&tunnel, force) => Some(result),
                },
            };
            let Some(result) = result else {
                debug!("Apply superseded");
                continue;
            };
            if rx.has_changed().unwrap_or(false) {
                debug!("Apply superseded");
                continue;
            }

            match result {
                Ok(signal) => {
                    attempt = 0;
                    let committed = self
                        .commit(&tunnel.id, desired.generation, aggregate(signal), None)
                        .await;
                    if committed && aggregate(signal) == TunnelStatus::Active {
                        self.confirm_node_online(&tunnel, desired.generation).await;
                    }
                }
                Err(err) => {
                    let status = match err {
                        ReconcileError::NodeUnreachable(_) => TunnelStatus::Degraded,
                        _ => TunnelStatus::Error,
                    };
                    self.commit(&tunnel.id, desired.generation, status, Some(err.to_string()))
                        .await;

                    if err.is_retryable() && self.retry.should_retry(attempt) {
                        let delay = self.retry.delay_for_attempt(attempt);
                        attempt += 1;
                        warn!(
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %err,
                            "Apply failed, retrying"
                        );
                        if !self.wait_or_change(&mut rx, Some(delay)).await {
                            return;
                        }
                        continue;
                    }
                    warn!(error = %err, "Apply failed permanently");
                }
            }

            if !self.wait_or_change(&mut rx, None).await {
                return;
            }
        }
    }

    /// Wait for a new op, or for `delay` to pass. Returns false on shutdown
    /// or when the worker has been dropped.
    async fn wait_or_change(
        &self,
        rx: &mut watch::Receiver<Desired>,
        delay: Option<Duration>,
    ) -> bool {
        let sleep = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            changed = rx.changed() => changed.is_ok(),
            () = sleep => true,
        }
    }

    /// Record a worker's result if its generation is still current.
    async fn commit(
        &self,
        tunnel_id: &str,
        generation: u64,
        status: TunnelStatus,
        reason: Option<String>,
    ) -> bool {
        {
            let workers = self.workers();
            let current = workers
                .get(tunnel_id)
                .is_some_and(|w| w.generation == generation);
            if !current || !self.status.set(tunnel_id, status, reason.clone()) {
                return false;
            }
        }
        self.persist_status(tunnel_id, status, reason.as_deref()).await;
        true
    }

    /// A node can drop between the ack and the commit; its offline event then
    /// finds the tunnel still pending and skips it. Checking again after the
    /// commit closes that gap: either this sees the node offline, or the
    /// event sees the tunnel active.
    async fn confirm_node_online(&self, tunnel: &Tunnel, generation: u64) {
        let Some(node_id) = tunnel.node_id.as_deref() else {
            return;
        };
        if tunnel.backend() != BackendKind::Reverse || self.registry.is_online(node_id).await {
            return;
        }
        let degraded = aggregate(Signal::Agent {
            node_online: false,
            acked: true,
        });
        self.commit(&tunnel.id, generation, degraded, Some(offline_reason(node_id)))
            .await;
    }

    /// Drop the worker entry if nothing newer was dispatched.
    fn retire(&self, tunnel_id: &str, generation: u64) -> bool {
        let mut workers = self.workers();
        if workers
            .get(tunnel_id)
            .is_some_and(|w| w.generation == generation)
        {
            workers.remove(tunnel_id);
            true
        } else {
            false
        }
    }

    async fn persist_status(&self, tunnel_id: &str, status: TunnelStatus, reason: Option<&str>) {
        if let Err(e) = self.db.update_tunnel_status(tunnel_id, status, reason).await {
            warn!(tunnel_id = %tunnel_id, error = %e, "Failed to persist tunnel status");
        }
    }

    // =========================================================================
    // Backend operations
    // =========================================================================

    async fn apply_forwarding(&self, tunnel: &Tunnel, force: bool) -> Result<Signal, ReconcileError> {
        self.release_previous_backend(tunnel).await?;

        let outcome = self
            .forwarding
            .apply(&tunnel.id, tunnel.kind, &tunnel.spec, force)
            .await?;
        if let Some(config) = self.forwarding.running_config(&tunnel.id) {
            let recorded = self
                .db
                .get_applied_config(&tunnel.id)
                .await?
                .is_some_and(|a| a.config == config);
            if outcome != ApplyOutcome::Unchanged || !recorded {
                self.db
                    .upsert_applied_config(&tunnel.id, BackendKind::Forwarding, None, &config)
                    .await?;
            }
        }
        Ok(Signal::Engine(self.forwarding.status(&tunnel.id)))
    }

    async fn apply_reverse(&self, tunnel: &Tunnel, force: bool) -> Result<Signal, ReconcileError> {
        let node_id = tunnel.node_id.as_deref().ok_or_else(|| {
            ReconcileError::Validation(ValidationError::new(
                ValidationKind::MissingNode,
                "rathole tunnels require node_id",
            ))
        })?;
        self.release_previous_backend(tunnel).await?;

        let rendered = self.reverse.render(&tunnel.id, &tunnel.spec)?;
        if !force {
            let applied = self.db.get_applied_config(&tunnel.id).await?;
            let unchanged = applied
                .is_some_and(|a| a.config == rendered && a.node_id.as_deref() == Some(node_id));
            let active = self
                .status
                .get(&tunnel.id)
                .is_some_and(|s| s.status == TunnelStatus::Active);
            if unchanged && active && self.registry.is_online(node_id).await {
                debug!(tunnel_id = %tunnel.id, "Reverse config unchanged");
                return Ok(Signal::Agent {
                    node_online: true,
                    acked: true,
                });
            }
        }

        let config = self.reverse.apply(&tunnel.id, node_id, &tunnel.spec).await?;
        self.db
            .upsert_applied_config(&tunnel.id, BackendKind::Reverse, Some(node_id), &config)
            .await?;
        Ok(Signal::Agent {
            node_online: self.registry.is_online(node_id).await,
            acked: true,
        })
    }

    /// Tear down what the last applied config left on a backend or node the
    /// tunnel no longer uses.
    async fn release_previous_backend(&self, tunnel: &Tunnel) -> Result<(), ReconcileError> {
        let Some(applied) = self.db.get_applied_config(&tunnel.id).await? else {
            return Ok(());
        };
        match applied.backend_kind() {
            Some(BackendKind::Forwarding) if tunnel.backend() != BackendKind::Forwarding => {
                self.forwarding.remove(&tunnel.id).await;
            }
            Some(BackendKind::Reverse)
                if tunnel.backend() != BackendKind::Reverse
                    || applied.node_id != tunnel.node_id =>
            {
                if let Some(old_node) = applied.node_id.as_deref() {
                    info!(tunnel_id = %tunnel.id, node_id = %old_node, "Moving tunnel off previous node");
                    self.reverse.remove(&tunnel.id, old_node).await?;
                }
            }
            _ => return Ok(()),
        }
        self.db.delete_applied_config(&tunnel.id).await?;
        Ok(())
    }

    /// Remove the tunnel from whatever carries it. Failures are logged; an
    /// unconfirmed reverse removal keeps its applied config so it can be
    /// resent when the node returns.
    async fn remove_tunnel(&self, tunnel: &Tunnel) {
        let applied = match self.db.get_applied_config(&tunnel.id).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(tunnel_id = %tunnel.id, error = %e, "Failed to read applied config");
                None
            }
        };

        self.forwarding.remove(&tunnel.id).await;

        let reverse_node = match &applied {
            Some(a) if a.backend_kind() == Some(BackendKind::Reverse) => a.node_id.clone(),
            _ if tunnel.backend() == BackendKind::Reverse => tunnel.node_id.clone(),
            _ => None,
        };

        let confirmed = match reverse_node {
            Some(node_id) => match self.reverse.remove(&tunnel.id, &node_id).await {
                Ok(()) => true,
                Err(e) => {
                    if applied.is_some() {
                        warn!(tunnel_id = %tunnel.id, node_id = %node_id, error = %e, "Removal unconfirmed, will resend when node reconnects");
                    } else {
                        debug!(tunnel_id = %tunnel.id, error = %e, "Nothing confirmed on node to remove");
                    }
                    false
                }
            },
            None => true,
        };

        if confirmed && applied.is_some() {
            if let Err(e) = self.db.delete_applied_config(&tunnel.id).await {
                warn!(tunnel_id = %tunnel.id, error = %e, "Failed to drop applied config");
            }
        }
        info!(tunnel_id = %tunnel.id, confirmed, "Tunnel removed");
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    async fn find_tunnel(&self, tunnel_id: &str) -> Result<Option<TunnelRow>, DatabaseError> {
        match self.db.get_tunnel(tunnel_id).await {
            Ok(row) => Ok(Some(row)),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Accepted tunnels that still hold their ports.
    async fn claims(&self) -> Result<Vec<Tunnel>, DatabaseError> {
        let mut claims = Vec::new();
        for row in self.db.list_tunnels().await? {
            if row.status() != TunnelStatus::Stopped {
                claims.push(row.tunnel()?);
            }
        }
        Ok(claims)
    }

    async fn tunnels_on_node(&self, node_id: &str) -> Result<Vec<TunnelRow>, DatabaseError> {
        Ok(self
            .db
            .list_tunnels()
            .await?
            .into_iter()
            .filter(|row| row.node_id.as_deref() == Some(node_id))
            .filter(|row| row.status() != TunnelStatus::Stopped)
            .collect())
    }
}

fn offline_reason(node_id: &str) -> String {
    format!("node {node_id} is offline")
}
