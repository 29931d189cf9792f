use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use chow_authority::{AuthorityError, EntryAuthority, MemoryAuthority};
use chow_bridge::{spawn_bridge, BridgeState, BroadcastTransport};
use chow_core::{CatalogItem, Entry, FeedScope};
use chow_engine::{Feed, FeedConfig};

#[derive(Parser, Debug)]
#[command(name = "chowctl", version, about = "Chow feed engine demo")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Day id (defaults to a fresh one)
    #[arg(long = "day", global = true)]
    day: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted optimistic-write session against the in-memory
    /// authority and print the feed after each step
    Demo {
        /// Inject a transport failure mid-script to show the rollback
        #[arg(long = "fail", action = ArgAction::SetTrue)]
        fail: bool,
    },
    /// Keep a feed live while a second writer mutates it, printing the
    /// reconciled list on every change (Ctrl-C to stop)
    Watch,
}

fn init_tracing() {
    let env = std::env::var("CHOW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CHOW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CHOW_METRICS_ADDR; expected host:port");
        }
    }
}

fn catalog() -> Vec<CatalogItem> {
    vec![
        CatalogItem { id: Uuid::new_v4(), name: "rice".into(), unit: "g".into(), kcal_per_unit: 1.3, default_qty: 100.0 },
        CatalogItem { id: Uuid::new_v4(), name: "lentil soup".into(), unit: "bowl".into(), kcal_per_unit: 300.0, default_qty: 1.0 },
        CatalogItem { id: Uuid::new_v4(), name: "apple".into(), unit: "pcs".into(), kcal_per_unit: 80.0, default_qty: 1.0 },
    ]
}

fn print_feed(feed: &Feed, output: Output) -> Result<()> {
    let entries = feed.entries();
    match output {
        Output::Human => {
            for (i, e) in entries.iter().enumerate() {
                let saving = if feed.is_saving(e.id) { " (saving)" } else { "" };
                println!(
                    "{:>2}. {:<14} {:>7} {:<5} {:>8.1} kcal  [{}]{}",
                    i,
                    e.name,
                    e.qty,
                    e.unit,
                    e.kcal,
                    match e.status { chow_core::EntryStatus::Planned => "planned", chow_core::EntryStatus::Eaten => "eaten" },
                    saving,
                );
            }
            let t = feed.totals();
            println!("    planned {:.1} / eaten {:.1} / total {:.1}", t.planned, t.eaten, t.total());
        }
        Output::Json => {
            let entries: &Vec<Entry> = &entries;
            println!("{}", serde_json::to_string_pretty(entries)?);
        }
    }
    Ok(())
}

/// Wire a feed to its authority's push channel and keep it refreshed.
async fn connect(feed: &Feed, auth: &Arc<MemoryAuthority>) -> Result<chow_bridge::BridgeHandle> {
    let transport = Arc::new(BroadcastTransport::new(auth.push_sender()));
    let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(4);
    let mut handle = spawn_bridge(transport, feed.scope(), feed.correlator(), refresh_tx);
    {
        let feed = feed.clone();
        tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                if let Err(e) = feed.refresh().await {
                    error!(error = %e, "refresh failed");
                }
            }
        });
    }
    handle.state.wait_for(|s| *s == BridgeState::Live).await?;
    Ok(handle)
}

async fn run_demo(output: Output, day: Option<Uuid>, fail: bool) -> Result<()> {
    let auth = Arc::new(MemoryAuthority::new());
    let scope = FeedScope { day: day.unwrap_or_else(Uuid::new_v4) };
    let feed = Feed::new(scope, auth.clone(), FeedConfig::from_env());
    let _bridge = connect(&feed, &auth).await?;
    let items = catalog();

    println!("== insert from catalog ==");
    let rice = feed.insert_from_catalog(&items[0], 2.0).await;
    feed.insert_from_catalog(&items[1], 1.0).await;
    feed.insert_from_catalog(&items[2], 3.0).await;
    print_feed(&feed, output)?;

    if let Some(rice) = rice {
        println!("== debounced quantity edit ==");
        if let Some(ed) = feed.editor(rice) {
            ed.input("250");
            ed.commit_now().await;
        }
        print_feed(&feed, output)?;

        println!("== toggle eaten ==");
        feed.toggle_status(rice, None).await;
        print_feed(&feed, output)?;

        println!("== reorder to top ==");
        feed.reorder(rice, 0).await;
        print_feed(&feed, output)?;

        if fail {
            println!("== delete with injected failure (entry comes back) ==");
            auth.fail_next(AuthorityError::Transport("simulated outage".into()));
            let mut alerts = feed.alerts();
            feed.delete(rice).await;
            if let Ok(alert) = alerts.try_recv() {
                println!("    alert: {alert:?}");
            }
            print_feed(&feed, output)?;
        }
    }

    // Let completed ops linger out so the registry drains.
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(pending = feed.registry().len(), "demo done");
    Ok(())
}

async fn run_watch(output: Output, day: Option<Uuid>) -> Result<()> {
    let auth = Arc::new(MemoryAuthority::new());
    let scope = FeedScope { day: day.unwrap_or_else(Uuid::new_v4) };
    let feed = Feed::new(scope, auth.clone(), FeedConfig::from_env());
    let _bridge = connect(&feed, &auth).await?;

    // A second writer on another device: its changes arrive as foreign
    // notifications and merge straight into the replica.
    let writer = tokio::spawn({
        let auth = auth.clone();
        async move {
            let items = catalog();
            loop {
                for (i, item) in items.iter().enumerate() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let entry = Entry {
                        id: Uuid::new_v4(),
                        name: item.name.clone(),
                        unit: item.unit.clone(),
                        qty: item.default_qty,
                        kcal: item.kcal_per_unit * item.default_qty,
                        kcal_per_unit: Some(item.kcal_per_unit),
                        status: chow_core::EntryStatus::Planned,
                        created_at: chrono::Utc::now(),
                        ordering: None,
                    };
                    if let Err(e) = auth.insert_entry(scope, entry, Uuid::new_v4()).await {
                        error!(error = %e, item = i, "writer insert failed");
                    }
                }
            }
        }
    });

    let mut epochs = feed.replica().subscribe();
    println!("watching day {} (Ctrl-C to stop)", scope.day);
    loop {
        tokio::select! {
            changed = epochs.changed() => {
                if changed.is_err() { break; }
                print_feed(&feed, output)?;
                println!();
            }
            _ = signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    writer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { fail } => run_demo(cli.output, cli.day, fail).await,
        Commands::Watch => run_watch(cli.output, cli.day).await,
    }
}
