//! conntrack-sim: drives an admission table with concurrent simulated clients.
//!
//! Each client repeatedly waits for a flow entry, holds it briefly, and
//! releases it. Entries are shared between clients, so admitted entries get
//! joined and queued co-waiters are woken together. Ctrl-C cancels every
//! pending wait. The final table status is printed on exit.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conntrack::{AdmissionTable, CancellationToken, Entry, Priority, TableConfig, TimeoutPolicy};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const REASONS: [&str; 3] = ["dns", "dial", "ping"];

#[derive(Debug)]
struct SimArgs {
    clients: usize,
    entries: usize,
    rounds: usize,
    hold: Duration,
    /// `Some(None)` means unlimited.
    max_entries: Option<Option<usize>>,
    timeout: Option<Duration>,
    json: bool,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            clients: 16,
            entries: 8,
            rounds: 10,
            hold: Duration::from_millis(5),
            max_entries: None,
            timeout: None,
            json: false,
        }
    }
}

#[derive(Debug, Default)]
struct ClientReport {
    admitted: usize,
    cancelled: bool,
}

/// Initialize tracing with CONNTRACK_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CONNTRACK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("conntrack={level},conntrack_sim={level}"))
    };

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn usage() {
    eprintln!("Usage: conntrack-sim [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --clients <n>        Concurrent clients [default: 16]");
    eprintln!("  --entries <n>        Distinct flow entries shared by clients [default: 8]");
    eprintln!("  --rounds <n>         Admissions per client [default: 10]");
    eprintln!("  --hold-ms <ms>       How long a client holds an entry [default: 5]");
    eprintln!("  --max-entries <n>    Table capacity, or 'unlimited' [default: $CONNTRACK_MAX_ENTRIES or 16384]");
    eprintln!("  --timeout-ms <ms>    Release timeout [default: $CONNTRACK_TIMEOUT_MS or 30000]");
    eprintln!("  --json               Print final status as JSON");
}

fn parse_args(args: &[String]) -> Result<SimArgs, String> {
    let mut parsed = SimArgs::default();

    fn number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
        let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
        value
            .parse()
            .map_err(|_| format!("{flag}: invalid number '{value}'"))
    }

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--clients" => {
                i += 1;
                parsed.clients = number(flag, args.get(i))?;
            }
            "--entries" => {
                i += 1;
                parsed.entries = number(flag, args.get(i))?;
                if parsed.entries == 0 {
                    return Err("--entries must be at least 1".to_string());
                }
            }
            "--rounds" => {
                i += 1;
                parsed.rounds = number(flag, args.get(i))?;
            }
            "--hold-ms" => {
                i += 1;
                parsed.hold = Duration::from_millis(number(flag, args.get(i))?);
            }
            "--max-entries" => {
                i += 1;
                parsed.max_entries = match args.get(i).map(String::as_str) {
                    Some("unlimited") => Some(None),
                    value => Some(Some(number(flag, value.map(String::from).as_ref())?)),
                };
            }
            "--timeout-ms" => {
                i += 1;
                parsed.timeout = Some(Duration::from_millis(number(flag, args.get(i))?));
            }
            "--json" => parsed.json = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn table_config(args: &SimArgs) -> Result<TableConfig> {
    let mut config = TableConfig::from_env().context("loading table config from environment")?;
    match args.max_entries {
        Some(Some(max)) => config = config.with_max_entries(max),
        Some(None) => config = config.with_no_max_entries(),
        None => {}
    }
    if let Some(timeout) = args.timeout {
        config = config.with_timeout(TimeoutPolicy::fixed(timeout));
    }
    Ok(config)
}

/// Flow for the `n`th simulated entry. Even entries are UDP lookups, odd
/// entries TCP connections.
fn sim_entry(n: usize) -> Entry {
    let remote = format!("10.0.{}.{}", n / 256, n % 256);
    if n % 2 == 0 {
        Entry::new("udp", "192.168.1.10:5353", format!("{remote}:53"))
    } else {
        Entry::new("tcp", "192.168.1.10:0", format!("{remote}:443"))
    }
}

async fn run_client(
    client: usize,
    table: Arc<AdmissionTable>,
    token: CancellationToken,
    args: Arc<SimArgs>,
) -> ClientReport {
    let mut report = ClientReport::default();
    let reason = REASONS[client % REASONS.len()];
    let priority = Priority((client % REASONS.len()) as i32 - 1);

    for round in 0..args.rounds {
        let entry = sim_entry((client * 7 + round * 3) % args.entries);
        let Some(handle) = table.wait(&token, entry, reason, priority).await else {
            debug!(client, round, "Client cancelled while waiting");
            report.cancelled = true;
            break;
        };
        report.admitted += 1;

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(args.hold) => false,
            _ = token.cancelled() => true,
        };
        handle.done();
        if interrupted {
            report.cancelled = true;
            break;
        }
    }

    report
}

async fn run(args: SimArgs) -> Result<()> {
    let config = table_config(&args)?;
    let table = AdmissionTable::new(config);
    info!(
        clients = args.clients,
        entries = args.entries,
        rounds = args.rounds,
        max_entries = ?table.max_entries(),
        "Starting simulation"
    );

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted - cancelling pending waits");
            interrupt.cancel();
        }
    });

    let args = Arc::new(args);
    let clients: Vec<_> = (0..args.clients)
        .map(|client| {
            tokio::spawn(run_client(
                client,
                Arc::clone(&table),
                token.clone(),
                Arc::clone(&args),
            ))
        })
        .collect();

    let mut admitted = 0;
    let mut cancelled = 0;
    for result in futures::future::join_all(clients).await {
        let report = result.context("client task failed")?;
        admitted += report.admitted;
        cancelled += usize::from(report.cancelled);
    }
    info!(admitted, cancelled, "Simulation finished");

    let status = table.status();
    if args.json {
        let json = status
            .to_json()
            .and_then(|value| serde_json::to_string_pretty(&value))
            .context("serializing table status")?;
        println!("{json}");
    } else {
        print!("{status}");
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("conntrack-sim")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_defaults() {
        let args = parse_args(&argv(&[])).unwrap();
        assert_eq!(args.clients, 16);
        assert_eq!(args.max_entries, None);
        assert!(!args.json);
    }

    #[test]
    fn parse_all_flags() {
        let args = parse_args(&argv(&[
            "--clients",
            "4",
            "--entries",
            "2",
            "--rounds",
            "3",
            "--hold-ms",
            "0",
            "--max-entries",
            "unlimited",
            "--timeout-ms",
            "10",
            "--json",
        ]))
        .unwrap();
        assert_eq!(args.clients, 4);
        assert_eq!(args.entries, 2);
        assert_eq!(args.rounds, 3);
        assert_eq!(args.hold, Duration::ZERO);
        assert_eq!(args.max_entries, Some(None));
        assert_eq!(args.timeout, Some(Duration::from_millis(10)));
        assert!(args.json);

        let args = parse_args(&argv(&["--max-entries", "3"])).unwrap();
        assert_eq!(args.max_entries, Some(Some(3)));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            parse_args(&argv(&["--clients"])).unwrap_err(),
            "--clients requires a value"
        );
        assert_eq!(
            parse_args(&argv(&["--rounds", "x"])).unwrap_err(),
            "--rounds: invalid number 'x'"
        );
        assert!(parse_args(&argv(&["--entries", "0"])).is_err());
        assert!(parse_args(&argv(&["--bogus"])).is_err());
        assert_eq!(parse_args(&argv(&["--help"])).unwrap_err(), "");
    }

    #[test]
    fn sim_entries_alternate_protocols() {
        assert_eq!(sim_entry(0).protocol, "udp");
        assert_eq!(sim_entry(1).protocol, "tcp");
        assert_eq!(sim_entry(257).remote_addr, "10.0.1.1:443");
    }

    #[tokio::test]
    async fn clients_finish_and_release_everything() {
        let table = AdmissionTable::new(
            TableConfig::new()
                .with_max_entries(2)
                .with_timeout(TimeoutPolicy::fixed(Duration::ZERO)),
        );
        let args = Arc::new(SimArgs {
            clients: 6,
            entries: 4,
            rounds: 5,
            hold: Duration::from_millis(1),
            ..SimArgs::default()
        });
        let token = CancellationToken::new();
        let clients: Vec<_> = (0..args.clients)
            .map(|c| {
                tokio::spawn(run_client(
                    c,
                    Arc::clone(&table),
                    token.clone(),
                    Arc::clone(&args),
                ))
            })
            .collect();

        for result in futures::future::join_all(clients).await {
            let report = result.unwrap();
            assert_eq!(report.admitted, 5);
            assert!(!report.cancelled);
        }
        assert_eq!(table.num_entries(), 0);
        assert_eq!(table.num_waiters(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_queued_clients() {
        let table = AdmissionTable::new(TableConfig::new().with_max_entries(0));
        let args = Arc::new(SimArgs {
            clients: 3,
            ..SimArgs::default()
        });
        let token = CancellationToken::new();
        let clients: Vec<_> = (0..args.clients)
            .map(|c| {
                tokio::spawn(run_client(
                    c,
                    Arc::clone(&table),
                    token.clone(),
                    Arc::clone(&args),
                ))
            })
            .collect();

        while table.num_waiters() != 3 {
            tokio::task::yield_now().await;
        }
        token.cancel();
        for result in futures::future::join_all(clients).await {
            let report = result.unwrap();
            assert_eq!(report.admitted, 0);
            assert!(report.cancelled);
        }
        assert_eq!(table.num_waiters(), 0);
    }
}
