//! Command line probe for the scale bridge.
//!
//! `scale_probe scan` lists nearby scales; `scale_probe read <address> <key>`
//! connects with the given bind key and waits for one stable measurement.

use anyhow::{Context, bail};
use log::info;

use miscale_ble::{ScaleSession, SessionConfig};

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  scale_probe scan");
    eprintln!("  scale_probe read <address> <bind-key-hex>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or_else(|| usage());

    let config = SessionConfig::default();
    let mut session = ScaleSession::new(config)
        .await
        .context("failed to open the Bluetooth adapter")?;

    let _state_sub = session.on_state_change(|state| {
        info!("State: {}", state);
    });

    match command {
        "scan" => {
            info!("Scanning for scales...");
            let devices = session.scan_for_devices(None).await?;
            if devices.is_empty() {
                println!("No scales found.");
            }
            for device in devices {
                println!(
                    "{}  name={}  rssi={}",
                    device.address.as_deref().unwrap_or(&device.id),
                    device.name.as_deref().unwrap_or("<unknown>"),
                    device
                        .rssi
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "?".into()),
                );
            }
        }
        "read" => {
            let (Some(address), Some(key)) = (args.get(2), args.get(3)) else {
                usage();
            };
            info!("Connecting to {}...", address);
            session.connect(address, key).await?;

            println!("Step on the scale now.");
            let measurement = session.read_measurement().await?;
            println!("{}", serde_json::to_string_pretty(&measurement)?);

            session.disconnect().await?;
        }
        other => bail!("unknown command '{}'", other),
    }

    Ok(())
}
