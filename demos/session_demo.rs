//! End-to-end session on the host adapter: scan, connect to the first
//! device exposing the session service, print inbound messages, send
//! "Hello", disconnect.
//!
//! Run with: cargo run --example session_demo [-- <device identifier>]

use ble_session::{PermissionGate, Result, SessionConfig, SessionFacade};
use futures::StreamExt;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_session=debug".parse().unwrap()),
        )
        .init();

    let wanted = std::env::args().nth(1);

    let session =
        SessionFacade::with_default_adapter(PermissionGate::desktop(), SessionConfig::default())
            .await?;

    let mut adapter_states = session.adapter_states().await?;
    tokio::spawn(async move {
        while let Some(state) = adapter_states.next().await {
            println!(
                "Bluetooth is {}",
                if state.is_powered_on() { "on" } else { "off" }
            );
        }
    });

    if !session.scan_for_devices().await? {
        println!("Permissions were not granted.");
        return Ok(());
    }

    println!("Scanning for 10 seconds...");

    let mut found = session.device_events();
    let device = tokio::time::timeout(Duration::from_secs(10), async {
        while let Ok(device) = found.recv().await {
            println!("  {} (RSSI: {:?} dBm)", device, device.rssi);
            match &wanted {
                Some(id) if *id == device.identifier => return Some(device),
                None if device.name.is_some() => return Some(device),
                _ => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    let Some(device) = device else {
        println!("\nNo device selected. Devices seen:");
        for device in session.devices_by_signal() {
            println!("  {}", device);
        }
        return session.shutdown().await;
    };

    println!("\nConnecting to {}...", device);
    if let Err(e) = session.connect_to_device(&device).await {
        println!("Connection failed: {}", e);
        return session.shutdown().await;
    }

    let mut messages = session.messages();
    tokio::spawn(async move {
        while let Ok(message) = messages.recv().await {
            match message.as_text() {
                Some(text) => println!("<- {:?}", text),
                None => println!("<- {:02X?}", &message.data[..]),
            }
        }
    });

    let outcome = session.send_message(&device, "Hello").await?;
    println!("-> \"Hello\" ({:?})", outcome);

    println!("Listening for 15 seconds. Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(15)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    session.disconnect_from_device().await;
    session.shutdown().await?;
    println!("Done!");

    Ok(())
}
