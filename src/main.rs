use clap::{Arg, Command};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

use o3fabric::{Config, Node, O3FabricError};

#[tokio::main]
async fn main() -> Result<(), O3FabricError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("o3fabric")
        .version("0.1.0")
        .about("Leader election and relay failover for the O3 storage fabric")
        .arg(
            Arg::new("ip")
                .long("ip")
                .help("IP address this node binds and advertises")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("relay-port")
                .long("relay-port")
                .help("Port the node's relay listens on")
                .default_value("3333"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Relay to join first, as ip:port")
                .required(false),
        )
        .arg(
            Arg::new("heartbeat-ms")
                .long("heartbeat-ms")
                .help("Leader heartbeat interval in milliseconds")
                .required(false),
        )
        .get_matches();

    let ip = parse_arg::<IpAddr>(&matches, "ip")?;
    let relay_port = parse_arg::<u16>(&matches, "relay-port")?;
    let seed_relay = matches
        .get_one::<String>("seed")
        .map(|seed| {
            SocketAddr::from_str(seed)
                .map_err(|e| O3FabricError::InvalidConfig(format!("Invalid seed relay {seed}: {e}")))
        })
        .transpose()?;

    let mut config = Config::new(ip, relay_port, seed_relay);
    if matches.contains_id("heartbeat-ms") {
        config.heartbeat_interval_ms = parse_arg::<u64>(&matches, "heartbeat-ms")?;
    }

    tracing::info!("Node configuration: {:?}", config);

    let node = Node::new(config).await?;
    node.start().await?;

    Ok(())
}

fn parse_arg<T>(matches: &clap::ArgMatches, name: &str) -> Result<T, O3FabricError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = matches
        .get_one::<String>(name)
        .ok_or_else(|| O3FabricError::InvalidConfig(format!("Missing --{name}")))?;
    raw.parse::<T>()
        .map_err(|e| O3FabricError::InvalidConfig(format!("Invalid --{name} {raw}: {e}")))
}
