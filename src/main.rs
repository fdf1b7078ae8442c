/*!
 * Conduit CLI
 *
 * Issues calls through the execution layer and prints results together with
 * the metrics snapshot as JSON.
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use conduit::{
    config::{ConduitConfig, LogLevel, Network},
    error::{ConduitError, EXIT_FATAL, EXIT_PARTIAL, EXIT_SUCCESS},
    executor::{CallOptions, CallSpec, Conduit},
    logging,
    scheduler::Priority,
};
use serde_json::{json, Value};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(version, about = "Resilient JSON-RPC request execution", long_about = None)]
struct Cli {
    /// Path to config file (default: <config dir>/conduit/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Network preset supplying the default endpoint, timeout and retries
    #[arg(long, value_enum, global = true)]
    network: Option<NetworkArg>,

    /// Endpoint URL; repeat for several instances
    #[arg(short = 'e', long = "endpoint", value_name = "URL", global = true)]
    endpoints: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Path to log file (default: stderr)
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call one method
    Call {
        method: String,

        /// Positional parameters as a JSON array
        #[arg(default_value = "[]")]
        params: String,

        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,

        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,

        /// Abort the call after this many milliseconds
        #[arg(long, value_name = "MS")]
        deadline_ms: Option<u64>,

        /// Session key for sticky routing
        #[arg(long)]
        session: Option<String>,
    },

    /// Call the configured warmup methods
    Warmup,

    /// Execute a JSON array of calls from a file ("-" reads stdin)
    Batch { file: PathBuf },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum NetworkArg {
    Localnet,
    Devnet,
    Testnet,
    Mainnet,
}

impl From<NetworkArg> for Network {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Localnet => Network::Localnet,
            NetworkArg::Devnet => Network::Devnet,
            NetworkArg::Testnet => Network::Testnet,
            NetworkArg::Mainnet => Network::Mainnet,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<ConduitError>()
                .map(ConduitError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    if let Commands::ShowConfig = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(EXIT_SUCCESS);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(execute(cli.command, config, cli.pretty))
}

fn build_config(cli: &Cli) -> Result<ConduitConfig> {
    let mut config = match (&cli.config, cli.network) {
        (Some(path), _) => ConduitConfig::load(path)?,
        (None, Some(network)) => ConduitConfig::for_network(network.into()),
        (None, None) => ConduitConfig::load_default()?,
    };
    if let (Some(_), Some(network)) = (&cli.config, cli.network) {
        config.network = network.into();
    }
    config.apply_env_overrides()?;

    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }
    if let Some(level) = cli.log_level {
        config.logging.log_level = level.into();
    }
    if cli.log.is_some() {
        config.logging.log_file = cli.log.clone();
    }
    config.logging.verbose |= cli.verbose;

    config.validate()?;
    Ok(config)
}

async fn execute(command: Commands, config: ConduitConfig, pretty: bool) -> Result<i32> {
    let conduit = Conduit::connect_http(config).await?;

    let (mut output, code) = match command {
        Commands::Call {
            method,
            params,
            priority,
            no_cache,
            deadline_ms,
            session,
        } => {
            let params = parse_params(&params)?;
            let mut options = CallOptions::new().with_priority(priority.into());
            if no_cache {
                options = options.uncached();
            }
            if let Some(ms) = deadline_ms {
                options = options.with_deadline(Duration::from_millis(ms));
            }
            if let Some(session) = session {
                options = options.with_session(session);
            }

            match conduit.execute(&method, params, options).await {
                Ok(result) => (json!({ "result": result }), EXIT_SUCCESS),
                Err(e) => (json!({ "error": e.to_string() }), e.exit_code()),
            }
        }
        Commands::Warmup => {
            let report = conduit.warmup().await;
            let code = if report.failed.is_empty() {
                EXIT_SUCCESS
            } else {
                EXIT_PARTIAL
            };
            (json!({ "warmup": report }), code)
        }
        Commands::Batch { file } => {
            let specs = read_batch(&file)?;
            let results = conduit.batch_execute(specs).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            let results: Vec<Value> = results
                .into_iter()
                .map(|r| match r {
                    Ok(result) => json!({ "result": result }),
                    Err(e) => json!({ "error": e.to_string() }),
                })
                .collect();
            let code = if failed == 0 { EXIT_SUCCESS } else { EXIT_PARTIAL };
            (json!({ "results": results, "failed": failed }), code)
        }
        Commands::ShowConfig => (json!({}), EXIT_SUCCESS),
    };

    let report = conduit.shutdown().await;
    output["metrics"] = serde_json::to_value(&report.final_metrics)?;
    let rendered = if pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", rendered);
    Ok(code)
}

fn parse_params(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw).context("params must be valid JSON")? {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

fn read_batch(file: &PathBuf) -> Result<Vec<CallSpec>> {
    let contents = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read batch from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read batch file {}", file.display()))?
    };
    serde_json::from_str(&contents).context("batch must be a JSON array of calls")
}
