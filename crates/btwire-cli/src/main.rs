use std::path::PathBuf;
use std::process;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use btwire::relay::{self, config::DEFAULT_BRIDGE_FILE};
use btwire::{LookupResult, Scope, ServiceQuery, WorkerConfig, WorkerSupervisor};

enum Mode {
    Interactive,
    Bridge(PathBuf),
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: btwire [bridge [<file>]]");
            eprintln!();
            eprintln!("Without arguments, reads commands from stdin:");
            eprintln!("  scan                                        discover nearby devices");
            eprintln!("  lookup <address>                            resolve a device name");
            eprintln!("  find_services [name=N] [uuid=U] [address=A] query SDP records");
            eprintln!("  terminate                                   stop the worker and exit");
            eprintln!();
            eprintln!("  bridge [<file>]  run the bridges defined in <file> [default: {DEFAULT_BRIDGE_FILE}]");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };
    let result = runtime.block_on(async {
        match mode {
            Mode::Interactive => interactive().await,
            Mode::Bridge(path) => bridges(&path).await,
        }
    });
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    match args.get(1).map(String::as_str) {
        None => Ok(Mode::Interactive),
        Some("--help") | Some("-h") => Err(String::new()),
        Some("bridge") => {
            let path = args.get(2).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_BRIDGE_FILE));
            if let Some(extra) = args.get(3) {
                return Err(format!("unexpected argument: {extra}"));
            }
            Ok(Mode::Bridge(path))
        }
        Some(other) => Err(format!("unknown command: {other}")),
    }
}

/// `RUST_LOG` wins; otherwise `BTWIRE_LOG` picks the level. Logs go to stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("BTWIRE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("btwire={level},btwire_cli={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

async fn interactive() -> anyhow::Result<()> {
    let scope = Scope::new();
    let supervisor = WorkerSupervisor::start(WorkerConfig::from_env(), &scope)
        .await
        .context("failed to start the bluetooth worker")?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let rest: Vec<&str> = words.collect();

        let output = match command {
            "terminate" | "exit" | "quit" => break,
            "scan" => supervisor.scan().await.map(|devices| {
                devices
                    .iter()
                    .map(|d| {
                        format!(
                            "{}  {}  class=0x{:06x}",
                            d.address,
                            d.name.as_deref().unwrap_or("<unknown>"),
                            d.class_code
                        )
                    })
                    .collect::<Vec<_>>()
            }),
            "lookup" => match rest.first() {
                Some(address) => supervisor.lookup(address).await.map(|found| match found {
                    LookupResult::Found { name } => vec![name],
                    LookupResult::NotFound { reason } => {
                        vec![format!("not found ({})", reason.as_deref().unwrap_or("no reason given"))]
                    }
                }),
                None => {
                    println!("usage: lookup <address>");
                    continue;
                }
            },
            "find_services" => {
                let query = match parse_query(&rest) {
                    Ok(query) => query,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                supervisor.find_services(&query).await.map(|services| {
                    services
                        .iter()
                        .map(|s| {
                            format!(
                                "{}  {}  {:?} port={}",
                                s.host,
                                s.name.as_deref().unwrap_or("<unnamed>"),
                                s.protocol,
                                s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
                            )
                        })
                        .collect::<Vec<_>>()
                })
            }
            other => {
                println!("unknown command: {other}");
                continue;
            }
        };

        match output {
            Ok(rows) if rows.is_empty() => println!("(none)"),
            Ok(rows) => rows.iter().for_each(|row| println!("{row}")),
            Err(e) => {
                tracing::error!(error = %e, command, "Command failed");
                println!("error: {e}");
            }
        }
    }

    supervisor.close().await;
    scope.shutdown().await;
    Ok(())
}

fn parse_query(args: &[&str]) -> anyhow::Result<ServiceQuery> {
    let mut query = ServiceQuery::any();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            bail!("expected key=value, got {arg}");
        };
        query = match key {
            "name" => query.with_name(value),
            "uuid" => query.with_uuid(value),
            "address" => query.with_address(value),
            other => bail!("unknown filter: {other}"),
        };
    }
    Ok(query)
}

async fn bridges(path: &std::path::Path) -> anyhow::Result<()> {
    let specs = relay::config::load_bridges(path)
        .with_context(|| format!("failed to load bridges from {}", path.display()))?;
    if specs.is_empty() {
        bail!("no valid bridge in {}", path.display());
    }

    let scope = Scope::new();
    let supervisor = WorkerSupervisor::start(WorkerConfig::from_env(), &scope)
        .await
        .context("failed to start the bluetooth worker")?;

    let bridges = relay::start_all(specs.into_values(), &supervisor, &scope).await;
    for bridge in &bridges {
        tracing::info!(bridge = bridge.name(), port = bridge.port(), "Started bridge");
    }
    tracing::info!(count = bridges.len(), "All bridges started");

    if !bridges.is_empty() {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Interrupted, closing bridges");
    }
    for bridge in bridges {
        bridge.close().await;
    }
    supervisor.close().await;
    scope.shutdown().await;
    Ok(())
}
