use anyhow::{bail, Context};
use cloudlink_core::logging::{self, LogFormat};
use cloudlink_core::{NodeConfig, SntpClient};
use cloudlink_node::{DryRunBroker, Orchestrator, TcpTransportProvider};
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

/// How often the main loop services the session.
const MAINTAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[derive(Debug, Serialize)]
struct Telemetry<'a> {
    device_id: &'a str,
    sequence: u64,
    uptime_secs: u64,
    timestamp: u64,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let format = if args.iter().any(|arg| arg == "--json-logs") {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(format);

    let config_path = parse_config_path(&args)?;
    let config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    tracing::info!(
        device_id = %config.device.device_id,
        broker = %config.broker.endpoint().0,
        "cloudlink-node starting"
    );

    let time_source = SntpClient::new(config.clock.servers.clone(), config.clock.timeout());
    let provider = TcpTransportProvider::from_config(&config);
    let mut node = Orchestrator::setup(&config, time_source, provider, DryRunBroker::new())
        .context("node setup failed")?;

    node.on_message(|topic, payload| {
        tracing::info!(topic, bytes = payload.len(), "Inbound message");
    });

    run(&mut node, &config);
    Ok(())
}

fn run(
    node: &mut Orchestrator<SntpClient, TcpTransportProvider, DryRunBroker>,
    config: &NodeConfig,
) {
    let started = Instant::now();
    let telemetry_interval = Duration::from_secs(config.telemetry.interval_secs);
    let subfolder = config.telemetry.subfolder.as_deref();
    let mut sequence: u64 = 0;
    let mut last_telemetry: Option<Instant> = None;

    node.connect();

    loop {
        let connected = node.maintain();

        let due = last_telemetry.map_or(true, |at| at.elapsed() >= telemetry_interval);
        if connected && due {
            sequence += 1;
            let telemetry = Telemetry {
                device_id: &config.device.device_id,
                sequence,
                uptime_secs: started.elapsed().as_secs(),
                timestamp: node.clock().now().unwrap_or(0),
            };
            match serde_json::to_vec(&telemetry) {
                Ok(payload) => {
                    let sent = match subfolder {
                        Some(sub) => node.publish_telemetry_to(sub, &payload),
                        None => node.publish_telemetry(&payload),
                    };
                    if sent {
                        last_telemetry = Some(Instant::now());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Cannot encode telemetry"),
            }
        }

        thread::sleep(MAINTAIN_INTERVAL);
    }
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}
