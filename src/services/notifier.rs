//! Entry notification dispatcher
//!
//! The pipeline enqueues notifications through a bounded mpsc channel and
//! never waits on the network. The worker posts them with bounded
//! concurrency and a hard per-call timeout. Failures are logged and
//! counted, never retried; a full queue drops the notification.

use crate::domain::device::DeviceRecord;
use crate::domain::types::{FingerprintMaterial, Observation, PresenceEvent};
use crate::infra::metrics::Metrics;
use crate::io::webhook::{Delivery, WebhookClient};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Webhook body for a device entering range
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnterNotification {
    /// Always "enter"
    pub event: &'static str,
    pub site: String,
    pub fingerprint: String,
    pub vendor: String,
    pub beacon: String,
    pub entered_at: DateTime<Utc>,
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
    pub material: FingerprintMaterial,
    pub enter_count: u32,
}

impl EnterNotification {
    pub fn new(
        site: &str,
        event: &PresenceEvent,
        record: &DeviceRecord,
        observation: &Observation,
    ) -> Self {
        Self {
            event: "enter",
            site: site.to_string(),
            fingerprint: event.fingerprint.to_string(),
            vendor: record.vendor.clone(),
            beacon: record.beacon.clone(),
            entered_at: event.timestamp,
            name: observation.local_name.clone().or_else(|| record.names.first().cloned()),
            address: observation.address.clone(),
            rssi: event.rssi,
            material: record.material.clone(),
            enter_count: record.enter_count,
        }
    }
}

/// A notification waiting for the worker
#[derive(Debug)]
pub struct NotifyJob {
    pub payload: EnterNotification,
    /// When the job was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Cheap, cloneable sending side used by the pipeline
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<NotifyJob>,
    metrics: Arc<Metrics>,
}

impl NotifierHandle {
    /// Enqueue without waiting. Returns false when the notification was dropped.
    pub fn notify(&self, payload: EnterNotification) -> bool {
        let fingerprint = payload.fingerprint.clone();
        match self.tx.try_send(NotifyJob { payload, enqueued_at: Instant::now() }) {
            Ok(()) => {
                self.metrics.record_notification_queued();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_notification_dropped();
                warn!(fingerprint = %fingerprint, "notification_dropped_queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_notification_dropped();
                warn!(fingerprint = %fingerprint, "notification_dropped_worker_stopped");
                false
            }
        }
    }
}

/// Worker that posts notifications asynchronously
pub struct NotificationWorker {
    client: Arc<WebhookClient>,
    rx: mpsc::Receiver<NotifyJob>,
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl NotificationWorker {
    /// Run until every handle is dropped, then wait for in-flight calls
    /// (each bounded by the call timeout).
    pub async fn run(mut self) {
        info!(
            url = %self.client.url(),
            max_in_flight = %self.semaphore.available_permits(),
            timeout_ms = %self.call_timeout.as_millis(),
            "notification_worker_started"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => self.dispatch(&mut in_flight, job).await,
                    None => break,
                },
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(result);
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            info!(in_flight = %draining, "notification_worker_draining");
        }
        while let Some(result) = in_flight.join_next().await {
            reap(result);
        }

        info!("notification_worker_stopped");
    }

    async fn dispatch(&self, in_flight: &mut JoinSet<()>, job: NotifyJob) {
        // Waiting for a permit backs up the queue, which then sheds load
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };
        let queue_delay_us = job.enqueued_at.elapsed().as_micros() as u64;

        let client = self.client.clone();
        let metrics = self.metrics.clone();
        let call_timeout = self.call_timeout;

        in_flight.spawn(async move {
            let _permit = permit;
            let payload = job.payload;
            match tokio::time::timeout(call_timeout, client.post(&payload)).await {
                Ok(Ok(Delivery::Delivered { status, latency_us })) => {
                    metrics.record_notification_sent();
                    info!(
                        fingerprint = %payload.fingerprint,
                        status = %status,
                        latency_us = %latency_us,
                        queue_delay_us = %queue_delay_us,
                        "notification_sent"
                    );
                }
                Ok(Ok(Delivery::Rejected { status, latency_us })) => {
                    metrics.record_notification_failed();
                    warn!(
                        fingerprint = %payload.fingerprint,
                        status = %status,
                        latency_us = %latency_us,
                        "notification_rejected"
                    );
                }
                Ok(Err(e)) => {
                    metrics.record_notification_failed();
                    warn!(
                        fingerprint = %payload.fingerprint,
                        error = %format!("{:#}", e),
                        "notification_failed"
                    );
                }
                Err(_) => {
                    metrics.record_notification_timed_out();
                    warn!(
                        fingerprint = %payload.fingerprint,
                        timeout_ms = %call_timeout.as_millis(),
                        "notification_timed_out"
                    );
                }
            }
        });
    }
}

fn reap(result: Result<(), JoinError>) {
    match result {
        Ok(()) => debug!("notification_task_finished"),
        Err(e) => error!(error = %e, "notification_task_panicked"),
    }
}

/// Create a notification channel and worker
///
/// Returns the handle (for the pipeline) and the worker (to be spawned)
pub fn create_notifier(
    client: WebhookClient,
    queue_size: usize,
    max_in_flight: usize,
    call_timeout: Duration,
    metrics: Arc<Metrics>,
) -> (NotifierHandle, NotificationWorker) {
    let (tx, rx) = mpsc::channel(queue_size.max(1));
    let handle = NotifierHandle { tx, metrics: metrics.clone() };
    let worker = NotificationWorker {
        client: Arc::new(client),
        rx,
        semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
        call_timeout,
        metrics,
    };
    (handle, worker)
}
