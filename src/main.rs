use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use scsiglass::usb::{self, Endpoints};
use scsiglass::{Config, MediaEvent, ScsiDevice};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "scsiglass")]
#[command(about = "Probe a USB mass storage device and watch its medium", long_about = None)]
struct Args {
    /// Index of the device in the list of attached mass storage devices.
    #[arg(long, default_value_t = 0)]
    device: usize,
    /// Bulk-in endpoint address (hex).
    #[arg(long, value_name = "HEX", default_value = "0x81", value_parser = parse_hex_u8)]
    bulk_in: u8,
    /// Bulk-out endpoint address (hex).
    #[arg(long, value_name = "HEX", default_value = "0x02", value_parser = parse_hex_u8)]
    bulk_out: u8,
    /// Media poll interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
    /// Probe the device but do not watch for media.
    #[arg(long)]
    no_polling: bool,
}

fn parse_hex_u8(input: &str) -> Result<u8, String> {
    let digits = input.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value {input}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let devices: Vec<_> = usb::enumerate_usb_storage_devices().await?.collect();
    for (index, device) in devices.iter().enumerate() {
        info!(
            index,
            vendor = format_args!("{:04x}", device.vendor_id()),
            product = format_args!("{:04x}", device.product_id()),
            name = device.product_string().unwrap_or("unknown"),
            "found mass storage device"
        );
    }
    let device_info = devices
        .get(args.device)
        .ok_or_else(|| eyre!("no mass storage device with index {}", args.device))?;

    let endpoints = Endpoints {
        bulk_in: args.bulk_in,
        bulk_out: args.bulk_out,
    };
    let transport = usb::open_usb_device(device_info, endpoints)
        .await
        .wrap_err("opening device")?;
    // Polling starts once we are subscribed, so the first event is not missed
    let config = Config {
        polling_enabled: false,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        ..Config::default()
    };
    let device = ScsiDevice::start(
        Arc::new(transport),
        usb::command_set_for(device_info),
        config,
    )
    .await
    .wrap_err("probing device")?;

    let characteristics = device.characteristics();
    info!(
        vendor = %characteristics.vendor,
        product = %characteristics.product,
        revision = %characteristics.revision,
        removable = characteristics.removable,
        "ready, press Ctrl-C to stop"
    );

    let mut events = device.subscribe();
    if !args.no_polling {
        device.enable_polling();
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event @ MediaEvent::Online { block_count, block_size, write_protected }) => info!(
                    block_count,
                    block_size,
                    write_protected,
                    bytes = event.capacity_bytes(),
                    "medium inserted"
                ),
                Ok(MediaEvent::Offline) => info!("medium removed"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "missed media events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    device.stop().await;
    Ok(())
}
