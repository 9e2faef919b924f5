//! Drives a paused program from an async controller.
//!
//! Run with: cargo run -p pause-demo
//!
//! Set `RUST_LOG=debug` to watch the session state machine.

use std::sync::Arc;

use futures::StreamExt;
use pausepoint_core::{Config, ControllerFault, Scope};
use pausepoint_session::{RegionSlots, ScriptInterpreter, Session};
use pausepoint_shm::RegionRegistry;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let registry = Arc::new(RegionRegistry::new());
    let session = Session::with_config(
        ScriptInterpreter::new().with_registry(Arc::clone(&registry)),
        &config,
    );
    let controller = session.controller();
    let scope = Scope::with_locals([("items".to_string(), json!([3, 4, 5]))].into());

    // Round 1: a chain of commands, run without pausing in between.
    let mut events = session.events().until_finished();
    let caller = {
        let session = session.clone();
        let scope = scope.clone();
        tokio::task::spawn_blocking(move || session.invoke("sum the items", Some("total = 0"), &scope))
    };
    controller.paused().await?;
    tracing::info!(order = ?controller.order(), seed = ?controller.slots().command, "Program paused");
    controller.run_command(
        "total = add(get(items, 0), get(items, 1)); \
         next \"total = add(total, get(items, 2)); share(\\\"pausepoint-demo.total\\\", total); return total\"; \
         continue",
    )?;
    while let Some(event) = events.next().await {
        println!("{}", event.to_json_line());
    }
    let total = caller.await??;
    tracing::info!(?total, "Program resumed with result");

    // Round 2: a controller in another registry answers over shared memory.
    let local = RegionSlots::from_config(Arc::clone(&registry), &config);
    let remote = RegionSlots::from_config(Arc::new(RegionRegistry::new()), &config);
    let caller = {
        let session = session.clone();
        let scope = scope.clone();
        tokio::task::spawn_blocking(move || session.consult("describe the total", None, &scope))
    };
    controller.paused().await?;
    local.publish(&controller)?;
    if let Some(notice) = remote.read_notice()? {
        tracing::info!(order = %notice.order, "Remote controller saw pause");
        let shared_total: serde_json::Value = registry.retrieve("pausepoint-demo.total")?;
        remote.send_result(&json!({"total": shared_total, "source": "remote"}))?;
    }
    let applied = local.apply(&controller)?;
    tracing::info!(?applied, "Applied remote slots");
    controller.resume()?;
    let described = caller.await??;
    local.retract()?;
    tracing::info!(?described, "Consultation finished");

    // Round 3: the controller refuses.
    let caller = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.invoke("delete everything", None, &scope))
    };
    controller.paused().await?;
    controller.fail(ControllerFault::new("refused").with_payload(json!({"reason": "unsafe"})))?;
    match caller.await? {
        Ok(value) => tracing::warn!(?value, "Unexpected result"),
        Err(e) => tracing::info!(error = %e, "Program received controller fault"),
    }

    let released = registry.release_all();
    tracing::info!(released, "Released shared regions");
    Ok(())
}
