//! Periodic reconciliation of pending bookings.
//!
//! A tick expires deposits that were never paid, then walks the remaining
//! `PENDING_DEPOSIT` bookings in creation order and promotes those whose
//! customer can now pay. Promotion cancels the pending bookings the winner
//! overlaps. Every change goes through the engine's public operations, so
//! the state machine alone decides what is legal.

use super::bookings::PromotionOutcome;
use super::engine::RentalEngine;
use crate::config::PromotionMode;
use crate::domain::booking::{BookingNumber, BookingStatus};
use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub expired: Vec<BookingNumber>,
    pub promoted: Vec<BookingNumber>,
    pub overlap_cancelled: Vec<BookingNumber>,
    /// Bookings whose transition failed; they are retried next tick.
    pub failures: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.expired.is_empty()
            && self.promoted.is_empty()
            && self.overlap_cancelled.is_empty()
            && self.failures == 0
    }
}

/// Runs single reconciliation passes against a shared engine.
#[derive(Clone)]
pub struct Reconciler {
    engine: Arc<RentalEngine>,
}

impl Reconciler {
    pub fn new(engine: Arc<RentalEngine>) -> Self {
        Self { engine }
    }

    pub async fn run_tick(&self) -> Result<TickReport> {
        let engine = &self.engine;
        let now = engine.now();
        let ttl = engine.config().reconciliation.pending_deposit_ttl();
        let mode = engine.config().reconciliation.promotion;
        let mut report = TickReport::default();

        let (stale, fresh): (Vec<_>, Vec<_>) = engine
            .bookings_with_status(BookingStatus::PendingDeposit)
            .await?
            .into_iter()
            .partition(|b| b.created_at + ttl < now);

        for booking in &stale {
            match engine.expire_booking(&booking.number).await {
                Ok(Some(expired)) => report.expired.push(expired.number),
                Ok(None) => debug!(booking = %booking.number, "Booking no longer expirable"),
                Err(e) => {
                    warn!(booking = %booking.number, error = %e, "Expiry failed");
                    report.failures += 1;
                }
            }
        }

        let mut settled: HashSet<BookingNumber> = HashSet::new();
        for candidate in &fresh {
            if settled.contains(&candidate.number) {
                continue;
            }
            match engine.promote_booking(&candidate.number).await {
                Ok(PromotionOutcome::Promoted {
                    booking,
                    overlap_cancelled,
                }) => {
                    settled.extend(overlap_cancelled.iter().cloned());
                    report.overlap_cancelled.extend(overlap_cancelled);
                    report.promoted.push(booking.number);
                    if mode == PromotionMode::FirstOnly {
                        break;
                    }
                }
                Ok(PromotionOutcome::LostOverlap(booking)) => {
                    report.overlap_cancelled.push(booking.number);
                }
                Ok(PromotionOutcome::NotEligible(_)) => {}
                Err(e) => {
                    warn!(booking = %candidate.number, error = %e, "Promotion failed");
                    report.failures += 1;
                }
            }
        }

        if !report.is_idle() {
            info!(
                expired = report.expired.len(),
                promoted = report.promoted.len(),
                overlap_cancelled = report.overlap_cancelled.len(),
                failures = report.failures,
                "Reconciliation tick finished"
            );
        }
        Ok(report)
    }
}

/// Drives a [`Reconciler`] on a fixed interval until stopped.
pub struct ReconciliationScheduler {
    reconciler: Reconciler,
    interval: Duration,
}

impl ReconciliationScheduler {
    /// Uses the interval from the engine's configuration.
    pub fn new(engine: Arc<RentalEngine>) -> Self {
        let interval = engine.config().reconciliation.interval();
        Self::with_interval(engine, interval)
    }

    pub fn with_interval(engine: Arc<RentalEngine>, interval: Duration) -> Self {
        Self {
            reconciler: Reconciler::new(engine),
            interval,
        }
    }

    /// Spawns the periodic task. The first tick runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let Self {
            reconciler,
            interval,
        } = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = 0u64;
            info!(interval_ms = interval.as_millis() as u64, "Reconciliation scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        ticks += 1;
                        if let Err(e) = reconciler.run_tick().await {
                            error!(error = %e, tick = ticks, "Reconciliation tick aborted");
                        }
                    }
                }
            }
            info!(ticks, "Reconciliation scheduler stopped");
            ticks
        });

        SchedulerHandle { shutdown_tx, task }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<u64>,
}

impl SchedulerHandle {
    /// Signals the task and waits for the tick in flight to finish.
    /// Returns the number of ticks that ran.
    pub async fn stop(self) -> std::result::Result<u64, JoinError> {
        // The receiver is gone only if the task already ended.
        let _ = self.shutdown_tx.send(());
        self.task.await
    }
}
