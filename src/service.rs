//! Long-running service: inbound signal/fill envelopes plus periodic maintenance.
//!
//! Maintenance applies the daily reset and cancels live orders whose fill
//! confirmation never arrived. Each inbound envelope is handled on its own
//! task; per-user ordering is enforced by the engine's locks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::models::TradeStatus;
use crate::trading::{ExecutionEngine, RawPayload};

/// One line of inbound traffic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Inbound {
    #[serde(rename_all = "camelCase")]
    Signal { user_id: String, payload: Value },

    #[serde(rename_all = "camelCase")]
    Fill {
        trade_id: String,
        executed_price: Decimal,
        #[serde(default)]
        fees: Decimal,
        #[serde(default = "filled")]
        status: TradeStatus,
    },
}

fn filled() -> TradeStatus {
    TradeStatus::Filled
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub users_reset: usize,
    pub orders_cancelled: usize,
}

#[derive(Debug, Default)]
struct Counters {
    signals: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    invalid: AtomicU64,
    fills: AtomicU64,
    errors: AtomicU64,
    maintenance_runs: AtomicU64,
}

/// Service statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStats {
    pub signals: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub fills: u64,
    pub errors: u64,
    pub maintenance_runs: u64,
    pub is_running: bool,
}

impl std::fmt::Display for ServiceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Service Statistics ===")?;
        writeln!(f, "Signals:          {} (Admitted: {}, Rejected: {}, Invalid: {})",
            self.signals, self.admitted, self.rejected, self.invalid)?;
        writeln!(f, "Fill Events:      {}", self.fills)?;
        writeln!(f, "Errors:           {}", self.errors)?;
        writeln!(f, "Maintenance Runs: {}", self.maintenance_runs)?;
        writeln!(f, "Status:           {}", if self.is_running { "Running" } else { "Stopped" })?;
        Ok(())
    }
}

pub struct Service {
    engine: Arc<ExecutionEngine>,
    maintenance_interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Notify,
    counters: Arc<Counters>,
}

impl Service {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        let secs = engine.config().maintenance_interval_secs.max(1);
        Self {
            engine,
            maintenance_interval: Duration::from_secs(secs),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Notify::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Get shutdown signal for external control. Setting it is observed on
    /// the next loop event; `stop` takes effect immediately.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Stop the run loop without waiting for the next tick or message.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Single maintenance pass.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, EngineError> {
        self.counters.maintenance_runs.fetch_add(1, Ordering::Relaxed);

        let users_reset = self.engine.run_daily_reset().await?;
        let orders_cancelled = self.engine.sweep_expired_orders().await?.len();

        Ok(MaintenanceReport {
            users_reset,
            orders_cancelled,
        })
    }

    /// Main run loop. Ends on Ctrl+C, on `stop`, on the shutdown flag, or when `inbound` closes.
    pub async fn run(&self, mut inbound: Receiver<Inbound>) -> Result<()> {
        info!(
            interval_secs = self.maintenance_interval.as_secs(),
            "Starting service loop"
        );

        let mut ticker = interval(self.maintenance_interval);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut ctrl_c_armed = true;

        let mut tasks = tokio::task::JoinSet::new();

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                signal = &mut ctrl_c, if ctrl_c_armed => match signal {
                    Ok(()) => {
                        info!("Shutdown signal received");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Ctrl+C handler unavailable");
                        ctrl_c_armed = false;
                    }
                },
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {
                    match self.run_maintenance().await {
                        Ok(report) => debug!(?report, "Maintenance complete"),
                        Err(e) => {
                            self.counters.errors.fetch_add(1, Ordering::Relaxed);
                            error!(error = %e, "Maintenance failed");
                        }
                    }
                }
                message = inbound.recv() => {
                    let Some(message) = message else {
                        info!("Inbound stream closed");
                        break;
                    };
                    let engine = self.engine.clone();
                    let counters = self.counters.clone();
                    tasks.spawn(async move { handle(&engine, &counters, message).await });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Let in-flight envelopes finish before returning
        while tasks.join_next().await.is_some() {}

        self.shutdown.store(true, Ordering::SeqCst);
        info!("Service shutdown complete");
        Ok(())
    }

    pub fn stats(&self) -> ServiceStats {
        let c = &self.counters;
        ServiceStats {
            signals: c.signals.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            fills: c.fills.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            maintenance_runs: c.maintenance_runs.load(Ordering::Relaxed),
            is_running: !self.shutdown.load(Ordering::SeqCst),
        }
    }
}

async fn handle(engine: &ExecutionEngine, counters: &Counters, message: Inbound) {
    match message {
        Inbound::Signal { user_id, payload } => {
            counters.signals.fetch_add(1, Ordering::Relaxed);

            match engine.submit_signal(&user_id, &RawPayload::from(payload)).await {
                Ok(outcome) if outcome.accepted => {
                    counters.admitted.fetch_add(1, Ordering::Relaxed);
                    info!(
                        user_id = %user_id,
                        trade_id = outcome.trade_id.as_deref().unwrap_or_default(),
                        status = ?outcome.status,
                        "Signal processed"
                    );
                }
                Ok(_) => {
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
                Err(EngineError::InvalidSignal(_)) => {
                    counters.invalid.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!(user_id = %user_id, error = %e, "Signal processing failed");
                }
            }
        }
        Inbound::Fill { trade_id, executed_price, fees, status } => {
            counters.fills.fetch_add(1, Ordering::Relaxed);

            if let Err(e) = engine.on_fill_confirmed(&trade_id, executed_price, fees, status).await {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(trade_id = %trade_id, error = %e, "Fill confirmation not applied");
            }
        }
    }
}
