pub mod capture;
pub mod config;
pub mod downstream;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod key;
pub mod metrics_defs;
pub mod service;
pub mod slot;
pub mod store;
pub mod ttl;

#[cfg(test)]
mod testutils;

use crate::config::{Config, StoreBackend};
use crate::downstream::UpstreamForwarder;
use crate::engine::{MemoryEngine, RedisEngine, ScriptEngine};
use crate::errors::GatewayError;
use crate::gateway::{Gateway, GatewaySettings};
use crate::metrics_defs::STORE_HEALTHY;
use crate::service::GatewayService;
use crate::store::IdemStore;
use crate::ttl::Ttls;
use shared::admin_service::AdminService;
use shared::gauge;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(config: Config) -> Result<(), GatewayError> {
    config.validate()?;

    let engine: Arc<dyn ScriptEngine> = match &config.store.backend {
        StoreBackend::Redis { url } => Arc::new(RedisEngine::new(url.as_deref())?),
        StoreBackend::Memory => Arc::new(MemoryEngine::new()),
    };
    let ttls = Ttls::global().with_overrides(
        config.idempotency.processing_ttl_ms,
        config.idempotency.done_ttl_ms,
    );
    let store = IdemStore::new(
        engine,
        config.idempotency.key_prefix.clone(),
        ttls,
        config.store.timeout(),
    );
    tracing::info!(
        engine = store.engine_name(),
        processing_ttl_ms = ttls.processing.as_millis() as u64,
        done_ttl_ms = ttls.done.as_millis() as u64,
        failure_mode = ?config.idempotency.failure_mode,
        "idempotency store configured"
    );
    tokio::spawn(health_check(store.clone()));

    let downstream = Arc::new(UpstreamForwarder::new(
        config.upstream.url.clone(),
        config.upstream.timeout(),
    ));
    let settings = GatewaySettings::from(&config.idempotency);
    let gateway = Arc::new(Gateway::new(store, downstream, settings));

    let ready_gateway = gateway.clone();
    let admin_service = AdminService::new(move || ready_gateway.is_ready());
    let gateway_service = GatewayService::new(gateway);

    let gateway_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        gateway_service,
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );
    tokio::try_join!(gateway_task, admin_task)?;
    Ok(())
}

// Keeps the health flag current while no requests reach the store.
async fn health_check(store: IdemStore) {
    let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let was_healthy = store.is_healthy();
        let result = store.ping().await;
        gauge!(STORE_HEALTHY).set(if result.is_ok() { 1.0 } else { 0.0 });
        match result {
            Ok(()) if !was_healthy => tracing::info!("idempotency store recovered"),
            Err(error) if was_healthy => {
                tracing::warn!(error = %error, "idempotency store health check failed")
            }
            _ => {}
        }
    }
}
