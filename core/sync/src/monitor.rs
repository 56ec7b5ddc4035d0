//! Background task that runs sync passes on reconnect and on a timer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{SyncCoordinator, SyncResult};

/// What started an automatic pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTrigger {
    Reconnect,
    Periodic,
}

/// Notification for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A reconnect pass found conflicts. Details come from
    /// `SyncCoordinator::get_pending_conflicts`.
    ConflictsDetected { count: usize },
    /// An automatic pass finished.
    PassCompleted {
        trigger: PassTrigger,
        resolved: usize,
        conflicts: usize,
        errors: usize,
    },
}

const EVENT_CAPACITY: usize = 64;

/// Watches connectivity and drives a coordinator.
pub struct ConnectivityMonitor {
    coordinator: Arc<SyncCoordinator>,
    interval: Option<Duration>,
    events: broadcast::Sender<SyncEvent>,
}

impl ConnectivityMonitor {
    /// Monitor using the coordinator's configured periodic interval.
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        let interval = coordinator.config().periodic_interval();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            coordinator,
            interval,
            events,
        }
    }

    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Start the background task.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let mut online_rx = self.coordinator.connectivity().subscribe();
        // Taken before the task runs so a change made right after spawn
        // still shows up as a transition.
        let was_online = *online_rx.borrow_and_update();
        let events = self.events.clone();
        let task = tokio::spawn(self.run(was_online, online_rx, shutdown_rx));

        MonitorHandle {
            shutdown: Some(shutdown_tx),
            task,
            events,
        }
    }

    async fn run(
        self,
        mut was_online: bool,
        mut online_rx: watch::Receiver<bool>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = self.interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!("Connectivity monitor started (online: {})", was_online);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Connectivity monitor shutting down");
                    break;
                }

                changed = online_rx.changed() => {
                    if changed.is_err() {
                        info!("Connectivity source closed, stopping monitor");
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    let reconnected = online && !was_online;
                    was_online = online;

                    if reconnected {
                        debug!("Back online, starting sync pass");
                        self.run_pass(PassTrigger::Reconnect).await;
                    }
                }

                _ = wait_for_periodic(&mut ticker) => {
                    if self.coordinator.connectivity().is_online() {
                        debug!("Triggering periodic sync pass");
                        self.run_pass(PassTrigger::Periodic).await;
                    }
                }
            }
        }
    }

    async fn run_pass(&self, trigger: PassTrigger) {
        let result: SyncResult = self.coordinator.sync_with_server().await;
        if !result.errors.is_empty() {
            warn!(
                "{:?} sync pass finished with {} errors",
                trigger,
                result.errors.len()
            );
        }

        // No subscribers is not an error.
        if trigger == PassTrigger::Reconnect && result.conflicts > 0 {
            let _ = self.events.send(SyncEvent::ConflictsDetected {
                count: result.conflicts,
            });
        }
        let _ = self.events.send(SyncEvent::PassCompleted {
            trigger,
            resolved: result.resolved,
            conflicts: result.conflicts,
            errors: result.errors.len(),
        });
    }
}

async fn wait_for_periodic(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handle to a running monitor.
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl MonitorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Stop the task and wait for it. A pass in progress finishes first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Connectivity monitor task failed: {}", e);
        }
    }
}
