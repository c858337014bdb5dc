use anyhow::Result;
use kiosk_core::{DetectionEngine, OnnxEngine};
use kiosk_hw::{create_video_source, device_fingerprint, DeviceTraits};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod cooldown;
mod dbus_interface;
mod engine;
mod machine;
mod session;
mod setup;

use capture::CaptureGate;
use config::{Config, DbusBus};
use cooldown::CooldownRegistry;
use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};
use machine::AttendanceMachine;
use session::{Phase, SessionState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(variant = config.variant.as_str(), source = %config.source, "attendanced starting");

    let fingerprint = config.device_fingerprint.clone().unwrap_or_else(|| {
        device_fingerprint(&DeviceTraits::collect(&config.source_settings.camera_device))
    });
    tracing::info!(device = %fingerprint, "device fingerprint");

    let (publisher, states) = watch::channel(SessionState::default());
    let service = KioskService::new(
        config.variant,
        config.branch_code.clone().or_else(|| config.branch_id.clone()),
        config.source.clone(),
        states,
    );
    // Keep the connection alive for the daemon's lifetime.
    let _dbus = match serve_status(config.dbus, service).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus status surface unavailable");
            None
        }
    };

    let source = create_video_source(&config.source, &config.source_settings);
    let model_dir = config.model_dir.clone();
    let activated = match setup::connect_backend(&config) {
        Ok(backend) => {
            let load_models = || -> Result<Box<dyn DetectionEngine>, kiosk_core::EngineError> {
                Ok(Box::new(OnnxEngine::load(&model_dir)?))
            };
            let result = setup::activate(&config, backend.as_ref(), &fingerprint, load_models, source).await;
            result.map(|activation| (backend, activation))
        }
        Err(e) => Err(e),
    };

    let (backend, activation) = match activated {
        Ok(ok) => ok,
        Err(e) => {
            tracing::error!(error = %e, "session setup failed");
            publisher.send_replace(SessionState {
                phase: Phase::Error,
                error_msg: Some(e.to_string()),
                ..SessionState::default()
            });
            tokio::signal::ctrl_c().await?;
            return Ok(());
        }
    };

    let setup::Activation {
        session,
        engine: detection_engine,
        mut source,
        feed,
    } = activation;

    let shutdown = CancellationToken::new();
    let cooldowns = CooldownRegistry::new();
    let sweeper = cooldowns.spawn_sweeper(shutdown.clone());

    let gate = CaptureGate::new(Arc::new(engine::spawn_engine(detection_engine)), feed);
    let machine = AttendanceMachine::new(
        config.variant,
        session,
        gate,
        backend,
        cooldowns,
        fingerprint,
        publisher,
    );
    let mut machine_task = tokio::spawn(machine.run(shutdown.clone()));

    tracing::info!("attendanced ready");

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            false
        }
        res = &mut machine_task => {
            if let Err(e) = res {
                tracing::error!(error = %e, "state machine task failed");
            }
            true
        }
    };

    if finished {
        // Terminal error: release the camera, keep reporting status.
        source.stop();
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("attendanced shutting down");
    shutdown.cancel();
    if !finished {
        let _ = machine_task.await;
    }
    source.stop();
    let _ = sweeper.await;

    Ok(())
}

async fn serve_status(bus: DbusBus, service: KioskService) -> zbus::Result<Option<zbus::Connection>> {
    let builder = match bus {
        DbusBus::Off => return Ok(None),
        DbusBus::Session => zbus::connection::Builder::session()?,
        DbusBus::System => zbus::connection::Builder::system()?,
    };
    let conn = builder.name(BUS_NAME)?.serve_at(OBJECT_PATH, service)?.build().await?;
    tracing::info!(name = BUS_NAME, "D-Bus status surface registered");
    Ok(Some(conn))
}
