use std::sync::Arc;
use std::time::Duration;

use tickvisor::config::{AgentConfig, CoordinatorConfig};
use tickvisor::coordinator::Coordinator;
use tickvisor::events::EventBus;
use tickvisor::host::LocalAgentHost;
use tickvisor::job::{JobPayload, JobRegistry};
use tickvisor::timer::{Period, Timing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CoordinatorConfig::from_env()?;
    let agent_config = AgentConfig::from_env()?;

    let period: Period = std::env::var("TICKVISOR_DEMO_PERIOD")
        .unwrap_or_else(|_| "PT5S".to_string())
        .parse()?;
    let cron = std::env::var("TICKVISOR_DEMO_CRON").unwrap_or_else(|_| "* * * * *".to_string());

    eprintln!("⏱  tickvisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tick: {:?}", config.tick);
    eprintln!("   Idle wait: {:?}", agent_config.idle_wait);
    eprintln!("   Passive shutdown: {}", agent_config.passive_shutdown);
    eprintln!("   Press Ctrl-C to stop.\n");

    let events = EventBus::new(config.event_capacity);
    let registry = Arc::new(JobRegistry::with_builtins());
    let host = LocalAgentHost::new(registry, agent_config, events.clone());
    let mut coordinator = Coordinator::new(config, Box::new(host), events);

    // ── Demo jobs ───────────────────────────────────────────────────────
    coordinator.add_job(
        "heartbeat",
        JobPayload::new("echo", serde_json::json!({"message": "heartbeat"})),
        Timing::every(period, true),
    );
    coordinator.add_job(
        "minutely",
        JobPayload::new(
            "echo",
            serde_json::json!({
                "message": "minute boundary",
                "repeat": {"type": "countdown", "remaining": 2, "interval": 1}
            }),
        ),
        Timing::cron(&cron)?,
    );
    coordinator.add_job(
        "nap",
        JobPayload::new("sleep", serde_json::json!({"duration_ms": 2500})),
        Timing::every(Period::from_std(Duration::from_secs(10)), false),
    );

    // ── Signals ─────────────────────────────────────────────────────────
    let handle = coordinator.handle();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                if let Err(e) = handle.shutdown(None) {
                    tracing::error!("Failed to request shutdown: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to install signal handlers: {}", e),
        }
    });

    coordinator.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
