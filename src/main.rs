use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use courier::banner::{BannerInfo, print_banner, print_session_summary};
use courier::commands::{CommandRegistry, CommandResult, Session};
use courier::config::{Config, KEYS, Settings};
use courier::consts::{DEFAULT_READ_MAX, default_db_path};
use courier::events::EventBus;
use courier::introspect;
use courier::scanner::{self, ScanOptions};
use courier::service::{Calculator, MathResponse};
use courier::spinner::Spinner;
use courier::telemetry::init_logging;
use courier::transport::LogTransport;
use courier::transport::memory::MemoryLog;
use courier::transport::sqlite::SqliteLog;
use courier::worker::{ReplyWorker, WorkerHandle};

const MEMORY_DB: &str = ":memory:";

#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "Request/reply calculations over a partitioned log."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// SQLite file holding the log and settings (use :memory: for a
    /// throwaway in-process log)
    #[arg(short, long)]
    db: Option<String>,

    /// Log filter when RUST_LOG is unset
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Run a reply worker inside this process
    #[arg(short, long, default_value_t = false)]
    embedded: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Consume requests and append replies until Ctrl+C
    Worker,
    /// Calculate an expression and wait for the reply
    Calc {
        expression: String,
        /// Seconds to wait (defaults to the reply_timeout setting)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Send an expression without waiting; prints its correlation id
    Send { expression: String },
    /// Send text to the string topic
    Message {
        message: String,
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Send a JSON message with a fresh id to the JSON topic
    Json {
        content: String,
        #[arg(short, long, default_value = "courier")]
        sender: String,
    },
    /// Append a plain message to any topic
    Produce {
        topic: String,
        message: String,
        #[arg(short, long)]
        key: Option<String>,
    },
    /// List topics
    Topics,
    /// Show per-partition offsets of a topic
    Info { topic: String },
    /// Read messages from a topic
    Read {
        topic: String,
        #[arg(short, long, default_value_t = DEFAULT_READ_MAX)]
        max: usize,
        /// Last N per partition instead of from the beginning
        #[arg(long, default_value_t = false)]
        latest: bool,
    },
    /// Look up the reply for a correlation id
    Reply { correlation_id: String },
    /// Show or change stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show one setting, or all of them
    Get { key: Option<String> },
    Set { key: String, value: String },
    /// Revert a setting to its default
    Unset { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let db = match &cli.db {
        Some(db) => db.clone(),
        None => {
            let path = default_db_path();
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            path.to_string_lossy().into_owned()
        }
    };

    let config = Config::open(&db)?;
    if let Some(Command::Config { action }) = &cli.command {
        return handle_config(&config, action);
    }
    let settings = Settings::load(&config)?;

    let transport: Arc<dyn LogTransport> = if db == MEMORY_DB {
        Arc::new(MemoryLog::new(settings.partitions))
    } else {
        Arc::new(
            SqliteLog::open(&db)
                .with_context(|| format!("failed to open log at {db}"))?
                .with_default_partitions(settings.partitions),
        )
    };
    let events = Arc::new(EventBus::default());

    match cli.command {
        Some(Command::Worker) => run_worker(transport, &settings, events).await,
        Some(Command::Topics) => {
            for topic in introspect::list_topics(transport.as_ref()).await? {
                println!("{topic}");
            }
            Ok(())
        }
        Some(Command::Info { topic }) => {
            let ranges = introspect::topic_info(transport.as_ref(), &topic).await?;
            print_json(&ranges)
        }
        Some(Command::Read { topic, max, latest }) => {
            let messages = scanner::scan(
                transport.as_ref(),
                &topic,
                max,
                !latest,
                &ScanOptions::default(),
            )
            .await?;
            print_json(&messages)
        }
        Some(command) => {
            let embedded = cli.embedded || db == MEMORY_DB;
            let worker = embedded.then(|| spawn_worker(&transport, &settings, &events));
            let calculator = start_calculator(transport, &settings, events).await?;
            let outcome = run_once(&calculator, command).await;
            calculator.shutdown().await;
            if let Some(worker) = worker {
                worker.stop().await;
            }
            outcome
        }
        None => {
            let embedded = cli.embedded || db == MEMORY_DB;
            let worker = embedded.then(|| spawn_worker(&transport, &settings, &events));
            let calculator = start_calculator(transport, &settings, events).await?;
            print_banner(&BannerInfo {
                database: &db,
                request_topic: &settings.request_topic,
                reply_topic: &settings.reply_topic,
                timeout_secs: settings.reply_timeout.as_secs(),
                worker: if embedded { "embedded" } else { "external" },
            });
            let outcome = repl(&calculator, worker.as_ref(), &db).await;
            calculator.shutdown().await;
            let stats = worker.as_ref().map(WorkerHandle::stats);
            if let Some(worker) = worker {
                worker.stop().await;
            }
            print_session_summary(stats);
            outcome
        }
    }
}

async fn start_calculator(
    transport: Arc<dyn LogTransport>,
    settings: &Settings,
    events: Arc<EventBus>,
) -> Result<Calculator> {
    let calculator = Calculator::start(
        transport,
        settings.broker_config(),
        settings.reply_timeout,
        events,
    )
    .await
    .context("failed to start broker")?;
    Ok(calculator.with_message_topics(settings.message_topics()))
}

fn spawn_worker(
    transport: &Arc<dyn LogTransport>,
    settings: &Settings,
    events: &Arc<EventBus>,
) -> WorkerHandle {
    ReplyWorker::new(
        Arc::clone(transport),
        settings.worker_config(),
        Arc::clone(events),
    )
    .spawn()
}

/// Subcommands that go through the calculator.
async fn run_once(calculator: &Calculator, command: Command) -> Result<()> {
    match command {
        Command::Calc {
            expression,
            timeout,
        } => {
            let response = calculate(calculator, &expression, timeout.map(Duration::from_secs)).await;
            print_json(&response)
        }
        Command::Send { expression } => {
            let receipt = calculator.calculate_async(&expression);
            calculator.flush().await;
            print_json(&receipt)
        }
        Command::Message { message, key } => {
            let metadata = calculator.send_message(key.as_deref(), &message).await?;
            print_json(&metadata)
        }
        Command::Json { content, sender } => {
            let (message, _) = calculator.send_json(&content, &sender).await?;
            print_json(&message)
        }
        Command::Produce {
            topic,
            message,
            key,
        } => {
            let metadata = calculator.send(&topic, key.as_deref(), &message).await?;
            print_json(&metadata)
        }
        Command::Reply { correlation_id } => {
            match calculator.find_reply(&correlation_id).await? {
                Some(reply) => match reply.outcome() {
                    Ok(result) => println!("{result}"),
                    Err(error) => println!("error: {error}"),
                },
                None => println!("no reply for {correlation_id}"),
            }
            Ok(())
        }
        Command::Worker
        | Command::Topics
        | Command::Info { .. }
        | Command::Read { .. }
        | Command::Config { .. } => Ok(()),
    }
}

async fn calculate(
    calculator: &Calculator,
    expression: &str,
    timeout: Option<Duration>,
) -> MathResponse {
    let spinner = Spinner::start("waiting for reply");
    let response = calculator.calculate(expression, timeout).await;
    spinner.stop().await;
    response
}

async fn run_worker(
    transport: Arc<dyn LogTransport>,
    settings: &Settings,
    events: Arc<EventBus>,
) -> Result<()> {
    let handle = spawn_worker(&transport, settings, &events);
    println!(
        "worker consuming {} as {} (Ctrl+C to stop)",
        settings.request_topic, settings.worker_group
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    let stats = handle.stats();
    handle.stop().await;
    info!(?stats, "worker stopped");
    print_session_summary(Some(stats));
    Ok(())
}

async fn repl(calculator: &Calculator, worker: Option<&WorkerHandle>, db: &str) -> Result<()> {
    let commands = CommandRegistry::new();

    // Async stdin so Ctrl+C is caught at the prompt too
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("\ncourier> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            result = lines.next_line() => {
                match result {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        // Ctrl+D
                        println!();
                        break;
                    }
                    Err(e) => {
                        eprintln!("input error: {e}");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let session = Session {
            calculator,
            worker_stats: worker.map(WorkerHandle::stats),
            db_path: db,
        };
        match commands.dispatch(input, &session).await {
            CommandResult::Quit => break,
            CommandResult::Handled => continue,
            CommandResult::NotACommand => {}
        }

        // Ctrl+C while waiting abandons the call, not the REPL
        tokio::select! {
            response = calculate(calculator, input, None) => {
                match response.result {
                    Some(result) if response.is_success() => println!("=> {result}"),
                    _ => println!("{}", response.status),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n\ninterrupted");
            }
        }
    }
    Ok(())
}

fn handle_config(config: &Config, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key: Some(key) } => {
            let settings = Settings::load(config)?;
            println!("{}", settings.get(key)?);
        }
        ConfigAction::Get { key: None } => {
            let settings = Settings::load(config)?;
            let width = KEYS.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
            for (key, about) in KEYS {
                println!("{key:<width$}  {:<24}  # {about}", settings.get(key)?);
            }
        }
        ConfigAction::Set { key, value } => {
            config.set(key, value)?;
            println!("{key} = {value}");
        }
        ConfigAction::Unset { key } => {
            Settings::default().get(key)?;
            config.remove(key)?;
            println!("{key} reset to default");
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
