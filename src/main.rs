//! Dualview compositor binary
//!
//! Waits for the producer's shared region, then composes until the producer
//! quits or the process is interrupted.

use anyhow::{Context, Result, bail};
use dualview::backend::{DisplayBackend, GlBackend, SoftwareBackend};
use dualview::config::{BackendKind, Config};
use dualview::layout::LayoutCatalog;
use dualview::platform::{Framebuffer, GlxWindow};
use dualview::{Compositor, CompositorSettings};
use dualview_ipc::{Transport, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dualview=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dualview compositor");

    let config = Config::load().context("Failed to load configuration")?;
    let stop = Arc::new(AtomicBool::new(false));

    let mut consumer = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || run_consumer(&config, &stop)
    });

    tokio::select! {
        result = &mut consumer => result.context("Compositor thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            stop.store(true, Ordering::Relaxed);
            consumer.await.context("Compositor thread panicked")?
        }
    }
}

fn run_consumer(config: &Config, stop: &AtomicBool) -> Result<()> {
    let Some(mut transport) = open_transport(config, stop)? else {
        return Ok(());
    };
    let catalog = load_catalog(config);
    let settings = CompositorSettings::from_config(config);
    let idle = Duration::from_micros(config.display.idle_sleep_us);
    let (width, height) = config.display.physical_size();

    let backend: Box<dyn DisplayBackend> = match config.display.backend {
        BackendKind::Headless => Box::new(SoftwareBackend::headless(width, height)),
        BackendKind::Fbdev => {
            let framebuffer = Framebuffer::open(&config.display.fb_device)?;
            Box::new(SoftwareBackend::new(width, height, Box::new(framebuffer)))
        }
        BackendKind::Glx => {
            let window = GlxWindow::open(width, height, "dualview")?;
            Box::new(GlBackend::new(window)?)
        }
    };

    let mut compositor = Compositor::new(backend, catalog, settings);
    let stats = compositor.run(&mut transport, stop, idle);
    debug!("Final stats: {:?}", stats);
    Ok(())
}

/// The producer creates the region; retry until it shows up. `None` if
/// interrupted while waiting.
fn open_transport(config: &Config, stop: &AtomicBool) -> Result<Option<Transport>> {
    let settings = &config.transport;
    for attempt in 1..=settings.open_retries.max(1) {
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }
        match Transport::open(settings) {
            Ok(transport) => return Ok(Some(transport)),
            Err(TransportError::Map(e)) if e == nix::errno::Errno::ENOENT => {
                debug!("Waiting for producer ({}/{})", attempt, settings.open_retries);
                std::thread::sleep(settings.open_retry_interval());
            }
            Err(e) => return Err(e).context("Failed to open shared region"),
        }
    }
    bail!(
        "Producer never created {} after {} attempts",
        settings.shm_name,
        settings.open_retries
    )
}

fn load_catalog(config: &Config) -> LayoutCatalog {
    let mut catalog = match &config.layout.catalog {
        Some(path) => LayoutCatalog::from_json(path).unwrap_or_else(|e| {
            warn!("{:#}; using built-in layouts", e);
            LayoutCatalog::builtin()
        }),
        None => LayoutCatalog::builtin(),
    };

    if let Some(root) = config.layout.background_root() {
        catalog.scan_backgrounds(&root);
    }
    let (mode, slot) = (config.layout.mode, config.layout.background_slot);
    if slot != 0 && !catalog.bind_background(mode, slot) {
        warn!("No background slot {} for layout {}", slot, mode);
    }
    catalog
}
