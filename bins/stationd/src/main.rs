use anyhow::{Context, bail};
use capture_config::StationConfig;
use capture_registry::{DataCallback, Station, Status};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .context("usage: stationd <station.toml>")?;
    let config = StationConfig::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let mut station = Station::new();
    let status = station.start_receiver(
        &config.receiver.interface,
        &config.receiver.ip,
        config.receiver.frame_size,
        config.receiver.frames_per_block,
        config.receiver.nof_blocks,
    );
    if status != Status::Success {
        bail!("failed to start receiver: {status:?}");
    }
    for &port in &config.receiver.ports {
        if station.add_receiver_port(port) != Status::Success {
            bail!("failed to bind receiver port {port}");
        }
    }

    for consumer in &config.consumers {
        let name = consumer.name.clone();
        if station.load_consumer(&name) != Status::Success {
            bail!("unknown consumer kind '{name}'");
        }
        let params = serde_json::to_string(&consumer.params)?;
        if station.initialise_consumer(&name, &params) != Status::Success {
            bail!("failed to initialise consumer '{name}'");
        }
        let log_name = name.clone();
        station.set_consumer_callback(
            &name,
            DataCallback::Simple(Box::new(move |data, timestamp, tile, channel| {
                info!(
                    consumer = log_name,
                    bytes = data.len(),
                    timestamp,
                    tile,
                    channel,
                    "buffer delivered"
                );
            })),
        );
        if station.start_consumer(&name) != Status::Success {
            bail!("failed to start consumer '{name}'");
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Release);
        })?;
    }

    info!("station capture running; ^C to stop");
    while running.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_secs(2));
        if let Some(rates) = station.receiver_rates() {
            info!(
                mbps = format!("{:.1}", rates.bytes_per_sec * 8.0 / 1e6),
                pps = format!("{:.0}", rates.packets_per_sec),
                dps = format!("{:.0}", rates.drops_per_sec),
                "interface rates"
            );
        }
    }

    info!("shutting down");
    station.shutdown();
    Ok(())
}
