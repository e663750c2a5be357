//! Probe an IPbus target and read one register.
//!
//! ```text
//! cargo run --example probe -- 172.20.75.180 0x1004
//! ```

use ipbus_client::{IpbusTarget, TargetConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ipbus_client=debug".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let ip = args.next().unwrap_or_else(|| "172.20.75.180".to_string());
    let address = args
        .next()
        .map(|raw| parse_u32(&raw))
        .transpose()?
        .unwrap_or(0x0);

    let target = IpbusTarget::bind(TargetConfig::for_address(ip)).await?;
    let mut signals = target.signals().subscribe();

    target.reconnect().await?;
    println!("target online: {target:?}");

    let value = target.read_register(address).await;
    println!("register {address:#010X} = {value:#010X}");

    while let Ok(signal) = signals.try_recv() {
        println!("signal: {signal:?}");
    }
    Ok(())
}

fn parse_u32(raw: &str) -> Result<u32, std::num::ParseIntError> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    }
}
