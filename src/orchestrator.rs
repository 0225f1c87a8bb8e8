//! Lifecycle Orchestrator (C8): composes the pool, consumer pipeline, and
//! schema publisher behind one strictly-ordered startup/shutdown sequence.
//!
//! The cancellation primitive is hand-rolled over `tokio::sync::Notify`
//! rather than pulling in `tokio_util::sync::CancellationToken` — every
//! other `tokio-util` feature went away with the HTTP surface, so adding
//! the crate back for one type isn't worth it (see DESIGN.md). `main.rs` is
//! the only caller that trips it, via OS signals, mirroring the `shutdown`
//! future in the teacher's `main.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::bus::Consumer;
use crate::config::Config;
use crate::consumer;
use crate::error::SmsError;
use crate::pool::{ModemPool, PoolConfig};
use crate::schema::{has_live_sibling, ConsulKv, SchemaDescriptor, SchemaStore};

/// A single-shot, broadcast-style cancellation signal. Cloning shares the
/// same underlying state; `cancel()` is idempotent.
#[derive(Clone)]
pub struct CancellationToken {
    fired: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolves immediately if already cancelled; otherwise waits.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }

    /// The raw `Notify`, for APIs written against `&Notify` (pool/consumer
    /// suspension points).
    #[must_use]
    pub fn as_notify(&self) -> &Notify {
        &self.notify
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the orchestrator assembled at startup, kept around so
/// shutdown can tear it down in reverse order.
pub struct Orchestrator {
    config: Config,
    pool: Arc<ModemPool>,
    schema_store: Arc<dyn SchemaStore>,
    schema_key: String,
    schema_descriptor: SchemaDescriptor,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Startup sequence, strictly ordered: load config → init pool → start
    /// health loop → start consumer → publish schema. Each step has
    /// already run by the time this returns `Ok`.
    pub async fn start(
        config: Config,
        consumer_bus: Arc<dyn Consumer>,
    ) -> Result<(Self, tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>), SmsError> {
        let cancel = CancellationToken::new();

        let pool_config = PoolConfig {
            port_patterns: config.modem.patterns.clone(),
            baud_rate: config.modem.baud_rate,
            session_init_timeout_secs: config.modem.time_out,
            health_check_interval_secs: config.pool.health_check_interval_secs,
            error_threshold: config.pool.error_threshold,
            default_country_code: config.pool.default_country_code.clone(),
            usb_vid_pid: config.modem.usb_vid_pid.clone(),
        };

        let pool = Arc::new(ModemPool::initialize(pool_config).await?);
        if pool.len().await == 0 {
            warn!("no modems available after discovery");
            return Err(SmsError::PortUnavailable(
                "no modems available after discovery".into(),
            ));
        }

        let health_handle = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.run_health_loop(cancel.as_notify()).await;
            })
        };

        let consumer_handle = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let redelivery_threshold = config.consumer.redelivery_threshold;
            let country_code = config.pool.default_country_code.clone();
            let bus = Arc::clone(&consumer_bus);
            tokio::spawn(async move {
                consumer::run(
                    bus.as_ref(),
                    &pool,
                    redelivery_threshold,
                    &country_code,
                    cancel.as_notify(),
                )
                .await;
            })
        };

        let schema_store: Arc<dyn SchemaStore> = Arc::new(ConsulKv::new(
            &config.consul.host,
            config.consul.port,
            &config.consul.scheme,
            config.consul.token.as_deref(),
            &config.consul.base,
        ));

        let schema_key = config.name.clone();
        let schema_descriptor =
            SchemaDescriptor::for_service(&config.name, &config.main_topic(), "SMS dispatch service");
        schema_store.put(&schema_key, &schema_descriptor).await?;
        info!(key = %schema_key, "schema published");

        Ok((
            Self {
                config,
                pool,
                schema_store,
                schema_key,
                schema_descriptor,
                cancel,
            },
            health_handle,
            consumer_handle,
        ))
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shutdown sequence, reverse of startup: retract schema → stop
    /// consumer (the cancellation token already requested this) → cancel
    /// health loop → close pool. Each step is idempotent.
    pub async fn shutdown(
        &self,
        health_handle: tokio::task::JoinHandle<()>,
        consumer_handle: tokio::task::JoinHandle<()>,
    ) {
        self.cancel.cancel();

        match self.schema_store.list(&self.config.name).await {
            Ok(siblings) => {
                let max_age = self.config.pool.health_check_interval_secs.saturating_mul(2);
                if has_live_sibling(&self.schema_key, &siblings, max_age) {
                    info!("live sibling present, leaving schema key in place");
                } else if let Err(e) = self.schema_store.delete(&self.schema_key).await {
                    warn!(error = %e, "schema retraction failed");
                } else {
                    info!("schema retracted");
                }
            }
            Err(e) => warn!(error = %e, "could not list siblings, leaving schema key in place"),
        }

        let _ = consumer_handle.await;
        let _ = health_handle.await;

        self.pool.shutdown().await;
        info!("modem pool closed");
    }

    #[must_use]
    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.schema_descriptor
    }
}
