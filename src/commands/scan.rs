use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

use codeb_control::Core;
use codeb_control::reconcile;

use super::init_core;

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static SWEEPS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("codeb_cleanup_sweeps_total", "Total cleanup sweeps executed")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SLOTS_CLEANED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "codeb_slots_cleaned_total",
        "Total grace slots reclaimed by the periodic sweep",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SWEEP_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "codeb_sweep_errors_total",
        "Total per-registry failures during sweeps",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RECONCILE_DIVERGENCES: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "codeb_reconcile_divergences",
        "Divergences between registries and host state at last reconcile",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

static REGISTRIES_TRACKED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "codeb_registries_tracked",
        "Slot registry documents currently on disk",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/* ============================= HTTP ============================= */

pub(crate) fn router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route(
            "/readyz",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(Ordering::Relaxed) {
                        StatusCode::OK.into_response()
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    }
                }
            }),
        )
        .route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (StatusCode::OK, buffer).into_response()
}

/* ============================= SCHEDULER ============================= */

/// Long-running scheduler: periodic non-forced cleanup of every registry
/// plus a reconciliation pass, with liveness/readiness/metrics endpoints.
pub async fn run(addr: &str, interval_secs: u64) -> anyhow::Result<()> {
    println!("Starting cleanup/reconcile scheduler...\n");
    info!("scheduler_starting");

    let core = init_core()?;
    let addr: std::net::SocketAddr = addr.parse().context("invalid listen address")?;

    println!("  Sweep interval .............. {interval_secs}s");
    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first sweep)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();
    println!("Scheduler running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let ready = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind the ops HTTP server")?;
    let app = router(ready.clone());
    let mut http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.recv().await;
            })
            .await
    });

    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&core).await;
                ready.store(true, Ordering::Relaxed);
            }
            _ = signal::ctrl_c() => {
                info!("shutdown_signal_received");
                println!("\nShutdown signal received. Stopping scheduler...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("scheduler_stopped");
    println!("Scheduler stopped.");
    Ok(())
}

async fn sweep(core: &Core) {
    SWEEPS_TOTAL.inc();

    let results = core.cleanup_sweep().await;
    REGISTRIES_TRACKED.set(results.len() as i64);
    for (project, environment, result) in results {
        match result {
            Ok(outcome) => {
                SLOTS_CLEANED_TOTAL.inc_by(outcome.cleaned.len() as u64);
            }
            Err(e) => {
                SWEEP_ERRORS_TOTAL.inc();
                warn!(project, environment = %environment, error = %e, "sweep_cleanup_failed");
            }
        }
    }

    match reconcile::run(core).await {
        Ok(report) => {
            RECONCILE_DIVERGENCES.set(report.divergences.len() as i64);
        }
        Err(e) => {
            SWEEP_ERRORS_TOTAL.inc();
            warn!(error = %e, "sweep_reconcile_failed");
        }
    }
}
