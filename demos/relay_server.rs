//! Multicast to HTTP relay
//!
//! Run with: cargo run --example relay_server [BIND_ADDR] [INTERFACE]
//!
//! Examples:
//!   cargo run --example relay_server                      # binds to 0.0.0.0:7781
//!   cargo run --example relay_server localhost:8080       # binds to 127.0.0.1:8080
//!   cargo run --example relay_server 0.0.0.0:7781 eth1    # joins groups on eth1
//!
//! ## Feeding a source
//!
//! With ffmpeg (raw TS over multicast):
//!   ffmpeg -re -i input.ts -c copy -f mpegts udp://239.1.1.1:1234?pkt_size=1316
//!
//! With ffmpeg (RTP):
//!   ffmpeg -re -i input.ts -c copy -f rtp_mpegts rtp://239.1.1.1:1234
//!
//! ## Playing
//!
//!   vlc http://localhost:7781/udp/239.1.1.1:1234
//!   curl -o dump.ts http://localhost:7781/rtp/239.1.1.1:1234?ifname=eth1
//!
//! ## Diagnostics
//!
//!   curl http://localhost:7781/stat
//!   curl http://localhost:7781/stat/channels

use std::net::SocketAddr;
use std::sync::Arc;

use udp_hub::{ChannelRegistry, HubServer, HubWorker, RegistryConfig, ServerConfig, WorkerRuntime};

const DEFAULT_PORT: u16 = 7781;

/// Parse bind address from command line argument
///
/// Accepts "localhost", "localhost:8080", "127.0.0.1" or "0.0.0.0:7781".
fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: relay_server [BIND_ADDR] [INTERFACE]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:{})", DEFAULT_PORT);
    eprintln!("  INTERFACE    Interface for multicast joins (default: any)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let mut config = ServerConfig::default();
    if let Some(addr_str) = args.get(1) {
        match parse_bind_addr(addr_str) {
            Ok(addr) => config = config.bind(addr),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }
    if let Some(interface) = args.get(2) {
        config = config.default_interface(interface.as_str());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("udp_hub=info".parse()?)
                .add_directive("relay_server=debug".parse()?),
        )
        .init();

    let runtime = WorkerRuntime::start(config.workers, |_| HubWorker::default())?;
    let registry = Arc::new(ChannelRegistry::create(
        runtime.handle().clone(),
        RegistryConfig::default().custom_headers("Access-Control-Allow-Origin: *"),
    )?);

    println!(
        "Relaying on http://{} with {} workers",
        config.bind_addr, config.workers
    );
    println!("Try: vlc http://{}/udp/239.1.1.1:1234", config.bind_addr);
    println!();

    let server = HubServer::new(config, Arc::clone(&registry))?;
    let result = server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await;
    if let Err(e) = result {
        eprintln!("Server error: {}", e);
    }

    // Blocks until every worker tore its channels down
    let teardown = tokio::task::spawn_blocking(move || registry.destroy()).await?;
    if let Err(e) = teardown {
        eprintln!("Teardown error: {}", e);
    }
    runtime.shutdown();

    Ok(())
}
