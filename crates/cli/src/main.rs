use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use mercury_api::ConsoleApi;
use mercury_core::{Kind, LinkRole, Metric, MetricValue, Object};
use mercury_watch::agent::{AgentEvent, AgentIngest};
use mercury_watch::{kube, spawn_apply};

#[derive(Parser, Debug)]
#[command(name = "mercuryctl", version, about = "Mercury console cache CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace scope (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum KindArg {
    AddressSpaces,
    Addresses,
    Connections,
    Links,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the CR-backed kinds and keep a live cache, printing epochs
    Watch {
        /// GVK key of the AddressSpace CR
        #[arg(long = "addressspace-gvk", env = "MERCURY_ADDRESS_SPACE_GVK", default_value = "enmasse.io/v1beta1/AddressSpace")]
        addressspace_gvk: String,
        /// GVK key of the Address CR
        #[arg(long = "address-gvk", env = "MERCURY_ADDRESS_GVK", default_value = "enmasse.io/v1beta1/Address")]
        address_gvk: String,
    },
    /// Run the watchers briefly, then query one kind from the cache
    Query {
        /// Kind to list
        kind: KindArg,
        /// Filter expression, e.g. "`$.ObjectMeta.Name` = 'myconn'"
        #[arg(long = "filter")]
        filter: Option<String>,
        /// Order-by expression, e.g. "`$.ObjectMeta.Name` DESC"
        #[arg(long = "orderby")]
        orderby: Option<String>,
        #[arg(long = "offset")]
        offset: Option<usize>,
        #[arg(long = "limit")]
        limit: Option<usize>,
        #[arg(long = "addressspace-gvk", env = "MERCURY_ADDRESS_SPACE_GVK", default_value = "enmasse.io/v1beta1/AddressSpace")]
        addressspace_gvk: String,
        #[arg(long = "address-gvk", env = "MERCURY_ADDRESS_GVK", default_value = "enmasse.io/v1beta1/Address")]
        address_gvk: String,
    },
    /// Feed a canned agent-event script into an empty cache and query it
    /// (no cluster needed)
    Demo,
}

fn init_tracing() {
    let env = std::env::var("MERCURY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MERCURY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MERCURY_METRICS_ADDR; expected host:port");
        }
    }
}

fn queue_cap() -> usize {
    std::env::var("MERCURY_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { addressspace_gvk, address_gvk } => {
            let ns = cli.namespace.as_deref();
            info!(ns = ?ns, "watch invoked");
            let api = ConsoleApi::with_standard_caches()?;
            let (tx, handle) = spawn_apply(api.objects(), queue_cap());
            let watchers = start_cr_watchers(&addressspace_gvk, &address_gvk, ns, tx);

            let mut rx = handle.subscribe_epoch();
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let stats = api.objects().stats();
                        println!("epoch {:>6}  objects {}", *rx.borrow(), stats.records);
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            for w in watchers {
                w.abort();
            }
        }
        Commands::Query { kind, filter, orderby, offset, limit, addressspace_gvk, address_gvk } => {
            let ns = cli.namespace.as_deref();
            info!(kind = ?kind, ns = ?ns, "query invoked");
            let api = ConsoleApi::with_standard_caches()?;
            let (tx, handle) = spawn_apply(api.objects(), queue_cap());
            let watchers = start_cr_watchers(&addressspace_gvk, &address_gvk, ns, tx);

            // Wait for the first apply epoch (configurable deadline).
            let wait_secs = std::env::var("MERCURY_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
            let mut rx = handle.subscribe_epoch();
            let deadline = Instant::now() + Duration::from_secs(wait_secs);
            while *rx.borrow() == 0 {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let rem = deadline.duration_since(now).min(Duration::from_secs(2));
                if tokio::time::timeout(rem, rx.changed()).await.is_err() {
                    break;
                }
            }

            run_query(&api, kind, ns, offset, limit, filter.as_deref(), orderby.as_deref(), cli.output)?;
            for w in watchers {
                w.abort();
            }
        }
        Commands::Demo => {
            let api = ConsoleApi::with_standard_caches()?;
            let mut ingest = AgentIngest::new(api.objects(), api.metric_cache());
            seed_demo(&mut ingest)?;

            run_query(&api, KindArg::Connections, None, None, None, None, Some("`$.ObjectMeta.Name`"), cli.output)?;
            let cons = api.connections(None, None, None, None, None)?;
            for con in &cons.items {
                let metrics = api.metrics_for(con)?;
                print_metrics(con, &metrics, cli.output)?;
            }
        }
    }

    Ok(())
}

fn start_cr_watchers(
    addressspace_gvk: &str,
    address_gvk: &str,
    namespace: Option<&str>,
    tx: tokio::sync::mpsc::Sender<mercury_watch::CacheEvent>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for (kind, gvk) in [(Kind::AddressSpace, addressspace_gvk.to_string()), (Kind::Address, address_gvk.to_string())] {
        let ns = namespace.map(|s| s.to_string());
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = kube::start_watcher(kind, &gvk, ns.as_deref(), tx).await {
                error!(kind = %kind, error = ?e, "watcher failed");
            }
        }));
    }
    handles
}

#[allow(clippy::too_many_arguments)]
fn run_query(
    api: &ConsoleApi,
    kind: KindArg,
    namespace: Option<&str>,
    offset: Option<usize>,
    limit: Option<usize>,
    filter: Option<&str>,
    orderby: Option<&str>,
    output: Output,
) -> Result<()> {
    let res = match kind {
        KindArg::AddressSpaces => api.address_spaces(namespace, offset, limit, filter, orderby),
        KindArg::Addresses => api.addresses(namespace, offset, limit, filter, orderby),
        KindArg::Connections => api.connections(namespace, offset, limit, filter, orderby),
        KindArg::Links => api.links(namespace, offset, limit, filter, orderby),
    }?;

    match output {
        Output::Human => {
            println!("total: {}", res.total);
            println!("{:<12} {:<12} {:<28} {}", "KIND", "NAMESPACE", "NAME", "AGE");
            for item in res.items.iter() {
                println!(
                    "{:<12} {:<12} {:<28} {}",
                    item.kind,
                    item.metadata.namespace,
                    item.metadata.name,
                    render_age(item.metadata.creation_timestamp)
                );
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Listing<'a> {
                total: usize,
                items: Vec<&'a Object>,
            }
            let listing = Listing { total: res.total, items: res.items.iter().map(|o| o.as_ref()).collect() };
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }
    Ok(())
}

fn print_metrics(obj: &Object, metrics: &[Metric], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("metrics for {}/{}:", obj.metadata.namespace, obj.metadata.name);
            for m in metrics {
                println!("  {:<24} {:>10} {}", m.value.name, m.value.value, m.value.units);
            }
        }
        Output::Json => {
            println!("{}", serde_json::to_string_pretty(metrics)?);
        }
    }
    Ok(())
}

/// Feed a small, deterministic event script: one address space worth of
/// connections, links and samples.
fn seed_demo(ingest: &mut AgentIngest) -> Result<()> {
    let opened = |hostname: &str| AgentEvent::ConnectionOpened {
        namespace: "demo".into(),
        address_space: "space".into(),
        hostname: hostname.into(),
        container_id: "container-1".into(),
        protocol: "amqp".into(),
        encrypted: true,
    };
    let attached = |connection: &str, role: LinkRole| AgentEvent::LinkAttached {
        namespace: "demo".into(),
        address_space: "space".into(),
        connection: connection.into(),
        address: "orders".into(),
        role,
    };
    ingest.apply(opened("host:1234"))?;
    ingest.apply(opened("host:1235"))?;
    ingest.apply(attached("host:1234", LinkRole::Sender))?;
    ingest.apply(attached("host:1234", LinkRole::Sender))?;
    ingest.apply(attached("host:1234", LinkRole::Receiver))?;
    ingest.apply(attached("host:1235", LinkRole::Receiver))?;
    ingest.apply(AgentEvent::Metrics(vec![
        sample("host:1234", "enmasse_messages_in", 10.0),
        sample("host:1234", "enmasse_messages_out", 20.0),
        sample("host:1235", "enmasse_messages_in", 5.0),
    ]))?;
    Ok(())
}

fn sample(con: &str, name: &str, value: f64) -> Metric {
    Metric {
        kind: Kind::Connection,
        namespace: "demo".into(),
        address_space: "space".into(),
        name: con.into(),
        value: MetricValue::gauge(name, value, "", chrono::Utc::now()),
    }
}

fn render_age(created: chrono::DateTime<chrono::Utc>) -> String {
    let mut secs = (chrono::Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
