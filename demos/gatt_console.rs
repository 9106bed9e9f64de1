//! GATT console example
//!
//! Scans for peripherals, connects to one, sends a hex payload to every
//! writable characteristic and prints the correlated reply.
//!
//! Run with: cargo run --example gatt_console
//!
//! To talk to a specific peripheral:
//!   cargo run --example gatt_console -- --address AA:BB:CC:DD:EE:FF --send "01 00"
//!
//! To collect every reply starting with an opcode until one ends in 0xFF:
//!   cargo run --example gatt_console -- --send "05 00" --opcode 05

use futures::StreamExt;
use gatt_session::{
    hex_string, parse_hex, ConnectionState, DeviceManager, Error, ManagerConfig, RemoteAddress,
    Result,
};
use std::time::Duration;

fn arg(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,gatt_session=debug,gatt=info")
        .init();

    println!("GATT Console");
    println!("============\n");

    let args: Vec<String> = std::env::args().collect();
    let target = arg(&args, "--address").map(RemoteAddress::from);
    let payload = arg(&args, "--send").unwrap_or_else(|| "01".to_string());
    let Some(payload) = parse_hex(&payload) else {
        eprintln!("--send expects hex bytes, e.g. \"01 A0\"");
        return Ok(());
    };
    let opcode = arg(&args, "--opcode").and_then(|op| u8::from_str_radix(&op, 16).ok());

    let manager = DeviceManager::with_platform(ManagerConfig::default()).await?;

    println!("Scanning for 5 seconds...\n");
    let mut scan = manager.scan(Some(Duration::from_secs(5)), true)?;
    let mut chosen = None;
    while let Some(found) = scan.next().await {
        let found = found?;
        println!(
            "  {}  {:<24} {}",
            found.address,
            found.local_name.as_deref().unwrap_or("(unnamed)"),
            found
                .rssi
                .map(|rssi| format!("{} dBm", rssi))
                .unwrap_or_default()
        );

        let wanted = target.as_ref().map_or(true, |t| *t == found.address);
        if wanted && chosen.is_none() {
            chosen = Some(found.address);
            if target.is_some() {
                break;
            }
        }
    }

    let Some(address) = chosen else {
        println!("\nNo matching peripheral found.");
        return Ok(());
    };

    println!("\nConnecting to {}...", address);
    let mut events = manager.subscribe_connection_events();
    let session = manager.connect(&address)?;

    let ready = tokio::time::timeout(Duration::from_secs(15), async {
        while !session.state().is_ready() {
            if events.recv().await.is_err() {
                break;
            }
        }
    })
    .await;

    if ready.is_err() || session.state() != ConnectionState::Ready {
        println!("Peripheral did not become ready (state: {})", session.state());
        manager.shutdown().await?;
        return Ok(());
    }

    let capabilities = session.capabilities();
    println!("Ready. Services:");
    for service in capabilities.service_ids() {
        println!("  {}", service);
    }
    for endpoint in capabilities.writable() {
        println!("  writable: {}", endpoint.characteristic);
    }

    println!("\n> {}", hex_string(&payload));
    match opcode {
        Some(opcode) => {
            let mut replies = manager.write_await_opcode(&address, &payload, opcode, None, |reply| {
                reply.last() == Some(&0xFF)
            })?;
            while let Some(reply) = replies.next().await {
                match reply {
                    Ok(reply) => println!("< {}", hex_string(&reply)),
                    Err(e) => println!("! {}", e),
                }
            }
        }
        None => match manager.write_await(&address, &payload, None)?.await {
            Ok(reply) => println!("< {}", hex_string(&reply)),
            Err(e @ Error::Timeout { .. }) => println!("! {}", e),
            Err(e) => return Err(e),
        },
    }

    manager.shutdown().await?;
    Ok(())
}
