use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use groupcomm::{ExchangeOrder, GroupDescriptor, Network, NetworkConfig, RetryPolicy};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    about = "Party process that joins a group and passes a buffer around the ring",
    author,
    version
)]
struct Cli {
    /// Party identifier (0-indexed)
    #[arg(long = "party-id")]
    party_id: usize,

    /// File listing one party address per line
    #[arg(long = "network", value_name = "FILE", default_value = "network.txt")]
    network: PathBuf,

    /// Port all pair ports are derived from
    #[arg(long = "base-port", default_value_t = groupcomm::config::DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Milliseconds to wait between connection attempts
    #[arg(long = "backoff-ms", default_value_t = 100)]
    backoff_ms: u64,

    /// Give up connecting after this many attempts (retry forever if unset)
    #[arg(long = "max-attempts")]
    max_attempts: Option<u32>,

    /// Size of the buffer sent around the ring
    #[arg(long = "bytes", default_value_t = 10)]
    bytes: usize,

    /// Direction of the ring exchange
    #[arg(long = "order", value_enum, default_value = "decreasing")]
    order: OrderArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Increasing,
    Decreasing,
}

impl From<OrderArg> for ExchangeOrder {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Increasing => ExchangeOrder::Increasing,
            OrderArg::Decreasing => ExchangeOrder::Decreasing,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        if e.is_fatal_setup() {
            eprintln!("Group setup failed: {e}");
        } else {
            eprintln!("Party failed: {e}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> groupcomm::Result<()> {
    let group = GroupDescriptor::from_file(cli.party_id, &cli.network)?;
    let config = NetworkConfig::default()
        .with_base_port(cli.base_port)
        .with_retry(RetryPolicy {
            backoff: Duration::from_millis(cli.backoff_ms),
            max_attempts: cli.max_attempts,
        });

    let mut network = Network::new(group, config)?;
    network.connect().await?;

    let order: ExchangeOrder = cli.order.into();
    let (to, from) = match order {
        ExchangeOrder::Increasing => (network.next_id(), network.prev_id()),
        ExchangeOrder::Decreasing => (network.prev_id(), network.next_id()),
    };
    info!("sending in a ring: P{} -> P{} -> P{}", from, cli.party_id, to);

    let sbuf = vec![42u8.wrapping_add(network.local_id() as u8); cli.bytes];
    let rbuf = network.exchange_ring(&sbuf, sbuf.len(), order).await?;

    println!("party {} got {} from party {}", cli.party_id, hex::encode(&rbuf), from);
    let stats = network.stats();
    info!(
        "sent {} bytes, received {} bytes",
        stats.bytes_sent, stats.bytes_recv
    );

    network.close().await;
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
