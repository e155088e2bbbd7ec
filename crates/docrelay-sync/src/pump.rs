//! The drain loop shared by both sync pumps.
//!
//! A pump owns one direction of one connection. Per iteration it claims the
//! oldest eligible entry, sends it, and waits for the matching ack:
//!
//! ```text
//! Idle --claim--> Sending --send--> AwaitingAck --applied--> delete, Idle
//!   ^                                   |--error----> mark_error, Idle
//!   |                                   |--timeout--> release, sleep, Idle
//!   +------- sleep on empty queue ------+--closed---> release, exit
//! ```
//!
//! Acks reach the pump through an [`AckReceiver`] fed by the connection's
//! reader loop. When the reader loop drops its [`AckSender`] the pump takes
//! that as the disconnect and exits, leaving its in-flight entry queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use docrelay_core::{EntryStatus, QueueId, RelayQueueEntry, RetryPolicy};
use docrelay_store::{QueueFilter, RelayQueueStore};

use crate::error::Result;
use crate::messages::{AckStatus, RelayMessage};
use crate::transport::Transport;

/// Capacity of the per-connection ack channel.
const ACK_CHANNEL_CAPACITY: usize = 64;

/// Configuration for pump behavior.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// How long to sleep when the queue has no eligible entry.
    pub poll_interval: Duration,
    /// How long to wait for the ack of one delivery.
    pub ack_timeout: Duration,
    /// How long a claimed entry stays hidden from other pumps.
    /// Should exceed `ack_timeout`.
    pub claim_lease: Duration,
    /// Deferral and dead-letter policy for rejected deliveries.
    pub retry: RetryPolicy,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// What the receiving side said about one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Applied,
    Failed(String),
}

/// An ack routed from a reader loop to its pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReply {
    pub queue_id: QueueId,
    pub outcome: AckOutcome,
}

impl AckReply {
    /// Build from the fields of an `ack` / `server-ack`.
    pub fn from_wire(queue_id: QueueId, status: AckStatus, error: Option<String>) -> Self {
        let outcome = if status.is_success() {
            AckOutcome::Applied
        } else {
            AckOutcome::Failed(error.unwrap_or_else(|| "unspecified error".into()))
        };
        Self { queue_id, outcome }
    }
}

pub type AckSender = mpsc::Sender<AckReply>;
pub type AckReceiver = mpsc::Receiver<AckReply>;

/// Channel from a connection's reader loop to its pump.
pub fn ack_channel() -> (AckSender, AckReceiver) {
    mpsc::channel(ACK_CHANNEL_CAPACITY)
}

/// Wakes idle pumps after new entries were enqueued.
///
/// Best effort: a pump that is not idle at the moment of the wake-up picks
/// the work up on its next claim anyway.
#[derive(Debug, Clone, Default)]
pub struct QueueSignal(Arc<Notify>);

impl QueueSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every idle pump.
    pub fn notify(&self) {
        self.0.notify_waiters();
    }

    async fn notified(&self) {
        self.0.notified().await;
    }
}

/// Counters for one pump run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Entries acknowledged and deleted.
    pub delivered: u64,
    /// Entries rejected and deferred for retry.
    pub failed: u64,
    /// Entries rejected for the last allowed time.
    pub dead_lettered: u64,
    /// Deliveries whose ack never came.
    pub timed_out: u64,
    /// Acks that matched no in-flight delivery.
    pub stale_acks: u64,
    /// Store operations that failed.
    pub store_errors: u64,
}

enum AckWait {
    Reply(AckOutcome),
    TimedOut,
    Closed,
}

/// One direction's drain loop over a shared queue.
pub(crate) struct DrainLoop<'a, Q: ?Sized> {
    pub store: &'a Q,
    pub transport: &'a dyn Transport,
    pub config: &'a PumpConfig,
    pub signal: &'a QueueSignal,
    pub filter: QueueFilter,
    pub direction: &'static str,
}

impl<'a, Q: RelayQueueStore + ?Sized> DrainLoop<'a, Q> {
    /// Run until the connection closes.
    pub async fn run<F>(self, acks: &mut AckReceiver, mut envelope: F) -> PumpReport
    where
        F: FnMut(&RelayQueueEntry) -> Result<RelayMessage> + Send,
    {
        let mut report = PumpReport::default();
        info!(
            direction = self.direction,
            remote = self.transport.label(),
            filter = ?self.filter,
            "pump started"
        );

        loop {
            let entry = match self
                .store
                .claim_oldest(&self.filter, self.config.claim_lease)
                .await
            {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    if !self.idle(acks, &mut report).await {
                        break;
                    }
                    continue;
                }
                Err(error) => {
                    report.store_errors += 1;
                    warn!(direction = self.direction, %error, "claim failed");
                    if !self.idle(acks, &mut report).await {
                        break;
                    }
                    continue;
                }
            };

            let queue_id = entry.queue_id;
            let message = match envelope(&entry) {
                Ok(message) => message,
                Err(error) => {
                    // Nothing on the wire can fix an entry we cannot encode.
                    self.record_failure(queue_id, &error.to_string(), &mut report)
                        .await;
                    continue;
                }
            };

            if let Err(error) = self.transport.send(message).await {
                debug!(direction = self.direction, %queue_id, %error, "send failed");
                self.release(queue_id, &mut report).await;
                break;
            }

            match self.await_ack(acks, queue_id, &mut report).await {
                AckWait::Reply(AckOutcome::Applied) => {
                    match self.store.delete_entry(queue_id).await {
                        Ok(_) => {
                            report.delivered += 1;
                            debug!(
                                direction = self.direction,
                                %queue_id,
                                collection = %entry.collection,
                                destination = %entry.destination_location,
                                "delivered"
                            );
                        }
                        Err(error) => {
                            // The lease runs out and the entry is redelivered;
                            // applying it again is harmless.
                            report.store_errors += 1;
                            warn!(direction = self.direction, %queue_id, %error, "delete after ack failed");
                        }
                    }
                }
                AckWait::Reply(AckOutcome::Failed(reason)) => {
                    self.record_failure(queue_id, &reason, &mut report).await;
                }
                AckWait::TimedOut => {
                    report.timed_out += 1;
                    warn!(direction = self.direction, %queue_id, "ack timed out");
                    self.release(queue_id, &mut report).await;
                    if !self.idle(acks, &mut report).await {
                        break;
                    }
                }
                AckWait::Closed => {
                    self.release(queue_id, &mut report).await;
                    break;
                }
            }
        }

        info!(
            direction = self.direction,
            remote = self.transport.label(),
            delivered = report.delivered,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "pump stopped"
        );
        report
    }

    /// Wait for the ack of `queue_id`, dropping acks for anything else.
    async fn await_ack(
        &self,
        acks: &mut AckReceiver,
        queue_id: QueueId,
        report: &mut PumpReport,
    ) -> AckWait {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            match tokio::time::timeout_at(deadline, acks.recv()).await {
                Err(_) => return AckWait::TimedOut,
                Ok(None) => return AckWait::Closed,
                Ok(Some(reply)) if reply.queue_id == queue_id => {
                    return AckWait::Reply(reply.outcome)
                }
                Ok(Some(reply)) => {
                    report.stale_acks += 1;
                    debug!(
                        direction = self.direction,
                        expected = %queue_id,
                        got = %reply.queue_id,
                        "ignoring stale ack"
                    );
                }
            }
        }
    }

    /// Sleep one poll interval, or less if woken. Returns `false` once the
    /// connection is gone.
    async fn idle(&self, acks: &mut AckReceiver, report: &mut PumpReport) -> bool {
        let sleep = tokio::time::sleep(self.config.poll_interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.signal.notified() => return true,
                reply = acks.recv() => match reply {
                    None => return false,
                    Some(reply) => {
                        report.stale_acks += 1;
                        debug!(direction = self.direction, got = %reply.queue_id, "ack while idle");
                    }
                },
            }
        }
    }

    async fn record_failure(&self, queue_id: QueueId, reason: &str, report: &mut PumpReport) {
        match self
            .store
            .mark_error(queue_id, reason, &self.config.retry)
            .await
        {
            Ok(Some(EntryStatus::Pending { attempts, retry_at })) => {
                report.failed += 1;
                warn!(
                    direction = self.direction,
                    %queue_id,
                    attempts,
                    retry_at,
                    reason,
                    "delivery rejected, deferring"
                );
            }
            Ok(Some(EntryStatus::DeadLetter { attempts })) => {
                report.dead_lettered += 1;
                warn!(
                    direction = self.direction,
                    %queue_id,
                    attempts,
                    reason,
                    "delivery rejected, dead-lettered"
                );
            }
            Ok(None) => {
                debug!(direction = self.direction, %queue_id, "rejected entry already gone");
            }
            Err(error) => {
                report.store_errors += 1;
                warn!(direction = self.direction, %queue_id, %error, "mark_error failed");
            }
        }
    }

    async fn release(&self, queue_id: QueueId, report: &mut PumpReport) {
        if let Err(error) = self.store.release_claim(queue_id).await {
            // The lease expires on its own.
            report.store_errors += 1;
            warn!(direction = self.direction, %queue_id, %error, "release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_reply_from_wire() {
        let ok = AckReply::from_wire(QueueId(1), AckStatus::Saved, None);
        assert_eq!(ok.outcome, AckOutcome::Applied);

        let failed = AckReply::from_wire(QueueId(2), AckStatus::Error, Some("bad".into()));
        assert_eq!(failed.outcome, AckOutcome::Failed("bad".into()));

        let bare = AckReply::from_wire(QueueId(3), AckStatus::Error, None);
        assert!(matches!(bare.outcome, AckOutcome::Failed(_)));
    }

    #[test]
    fn test_default_lease_outlasts_ack_timeout() {
        let config = PumpConfig::default();
        assert!(config.claim_lease > config.ack_timeout);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }
}
