//! dohrelay - resolve one name by racing the configured DoH upstreams.
//!
//! Usage: `dohrelay <domain> [record-type]`. The configuration is read from
//! `CONFIG_PATH` (default `config.toml`). The answer records are printed one
//! per line, followed by the query record as a JSON line.

use std::borrow::Cow;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dohrelay::config::Config;
use dohrelay::dns::Bootstrapper;
use dohrelay::race::RaceOrchestrator;
use dohrelay::record::QueryRecord;
use dohrelay::upstream::UpstreamClient;

fn build_query(domain: &str, record_type: RecordType) -> Result<Message> {
    let name = Name::from_str(domain).with_context(|| format!("Invalid domain name {domain:?}"))?;

    let mut query = Message::new();
    query
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    Ok(query)
}

fn parse_args() -> Result<(String, RecordType)> {
    let mut args = std::env::args().skip(1);
    let Some(domain) = args.next() else {
        bail!("Usage: dohrelay <domain> [record-type]");
    };
    let record_type = match args.next() {
        Some(value) => RecordType::from_str(&value.to_ascii_uppercase())
            .with_context(|| format!("Unknown record type {value:?}"))?,
        None => RecordType::A,
    };
    Ok((domain, record_type))
}

async fn run() -> Result<()> {
    let (domain, record_type) = parse_args()?;

    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("config.toml"));
    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;

    // Initialize metrics (must be done early, before any metrics are recorded)
    dohrelay::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    let bootstrapper =
        Bootstrapper::with_ttl(config.bootstrap_servers.clone(), config.bootstrap_cache_ttl());
    if bootstrapper.servers().is_empty() {
        info!("No bootstrap servers, using the system resolver");
    } else {
        info!(
            "Bootstrap servers: {:?} (cache TTL {:?})",
            bootstrapper.servers(),
            bootstrapper.cache().ttl()
        );
    }
    info!("Upstreams: {}", config.upstreams.len());

    let clients = UpstreamClient::from_configs(&config.upstreams, &bootstrapper)
        .context("Failed to create upstream clients")?;
    let orchestrator = RaceOrchestrator::new(config.race_timeout());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling query...");
            on_signal.cancel();
        }
    });

    let query = build_query(&domain, record_type)?;
    let start = Instant::now();

    match orchestrator.race(&cancel, &query, &clients).await {
        Ok(outcome) => {
            for record in outcome.answer.answers() {
                println!("{record}");
            }
            let upstream = config
                .upstreams
                .get(outcome.winner)
                .map(|upstream| upstream.label())
                .unwrap_or_default();
            let record = QueryRecord::new(&query, upstream, &outcome);
            println!("{}", record.to_json().context("Failed to encode query record")?);
            Ok(())
        }
        Err(err) => {
            let record = QueryRecord::failed(&query, start.elapsed(), &err);
            println!("{}", record.to_json().context("Failed to encode query record")?);
            Err(err).with_context(|| format!("Failed to resolve {domain} {record_type}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    run().await
}
