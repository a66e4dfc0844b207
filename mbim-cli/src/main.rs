use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use mbim_lib::config::{ConnectParameters, PinRequest};
use mbim_lib::types::DataClass;
use mbim_lib::usb::{self, FunctionInfo};
use mbim_lib::{LoggingInterface, State, Umb, UsbTransport};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const CAPS_TIMEOUT: Duration = Duration::from_secs(30);

/// Bring up a data session on an MBIM USB modem.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List MBIM functions on the bus
    List,
    /// Connect and stay up until Ctrl+C
    Connect(ConnectArgs),
    /// Bring the function up, print what the modem reports and exit
    Status {
        /// Which function to use, as numbered by `list`
        #[arg(short, long, default_value_t = 0)]
        device: usize,
        /// Seconds to wait for the modem to settle
        #[arg(short, long, default_value_t = 10)]
        wait: u64,
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Which function to use, as numbered by `list`
    #[arg(short, long, default_value_t = 0)]
    device: usize,
    /// TOML file with connection parameters
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    apn: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Allow data connections while roaming
    #[arg(long)]
    roaming: bool,
    /// Preferred radio technology, e.g. LTE or UMTS (repeatable)
    #[arg(long = "class")]
    classes: Vec<String>,
    /// SIM PIN to enter if the modem asks for one
    #[arg(long)]
    pin: Option<String>,
}

/// Layout of the `--config` file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    connection: ConnectParameters,
    classes: Vec<String>,
    pin: Option<String>,
}

fn setup_logging(log_file_path: Option<&Path>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = if let Some(path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}

fn parse_classes(names: &[String]) -> Result<DataClass> {
    names.iter().try_fold(DataClass::NONE, |acc, name| {
        DataClass::parse_name(name)
            .map(|class| acc | class)
            .with_context(|| format!("Unknown data class {name:?}"))
    })
}

/// Merge the config file and the command line, the latter taking precedence
fn connect_parameters(args: &ConnectArgs) -> Result<(ConnectParameters, Option<String>)> {
    let file = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
            toml::from_str::<ConfigFile>(&text).with_context(|| format!("Failed to parse {:?}", path))?
        }
        None => ConfigFile::default(),
    };

    let mut params = file.connection;
    if let Some(apn) = &args.apn {
        params.apn = apn.clone();
    }
    if let Some(username) = &args.username {
        params.username = username.clone();
    }
    if let Some(password) = &args.password {
        params.password = password.clone();
    }
    params.roaming |= args.roaming;
    let classes = if args.classes.is_empty() { &file.classes } else { &args.classes };
    if !classes.is_empty() {
        params.preferred_classes = parse_classes(classes)?;
    }
    params.validate()?;
    Ok((params, args.pin.clone().or(file.pin)))
}

fn select_function(index: usize) -> Result<FunctionInfo> {
    let mut functions = usb::list_functions().context("Failed to list USB devices")?;
    if functions.is_empty() {
        bail!("No MBIM function found. Is the modem in MBIM mode?");
    }
    if index >= functions.len() {
        bail!("Function {index} not found, {} available", functions.len());
    }
    Ok(functions.swap_remove(index))
}

fn list() -> Result<()> {
    let functions = usb::list_functions().context("Failed to list USB devices")?;
    if functions.is_empty() {
        println!("No MBIM functions found.");
    }
    for (i, function) in functions.iter().enumerate() {
        println!("[{i}] {function}");
    }
    Ok(())
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let (params, pin) = connect_parameters(&args)?;
    let function = select_function(args.device)?;
    let (transport, config) = UsbTransport::open(&function).await.context("Failed to open MBIM function")?;
    let umb = Umb::attach(transport, LoggingInterface::new(), config);

    // Data class preference and PIN both need an open function with known caps
    umb.up().await?;
    tokio::time::timeout(CAPS_TIMEOUT, umb.wait_until(|s| !s.info.supported_classes.is_none()))
        .await
        .context("Modem did not report its device caps")??;
    umb.set_parameters(params).await?;
    if let Some(pin) = pin {
        umb.set_pin(PinRequest::enter(pin)).await?;
    }

    let mut updates = umb.subscribe();
    let mut last = State::Down;
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Session worker stopped");
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.state != last {
                    info!("state {} -> {}", last, snapshot.state);
                    if snapshot.state == State::Up {
                        println!("{snapshot}");
                    }
                    last = snapshot.state;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down gracefully.");
                break;
            }
        }
    }

    if umb.down().await.is_ok()
        && tokio::time::timeout(SHUTDOWN_TIMEOUT, umb.wait_for_state(State::Open)).await.is_err()
    {
        warn!("Modem did not disconnect within {:?}", SHUTDOWN_TIMEOUT);
    }
    let stats = umb.snapshot().stats;
    info!(
        "rx {} packets / {} bytes, tx {} packets / {} bytes",
        stats.rx_packets, stats.rx_bytes, stats.tx_packets, stats.tx_bytes
    );
    umb.detach().await;
    Ok(())
}

async fn status(device: usize, wait: u64, json: bool) -> Result<()> {
    let function = select_function(device)?;
    let (transport, config) = UsbTransport::open(&function).await.context("Failed to open MBIM function")?;
    let umb = Umb::attach(transport, LoggingInterface::new(), config);
    umb.up().await?;

    if tokio::time::timeout(Duration::from_secs(wait), umb.wait_for_state(State::Attached))
        .await
        .is_err()
    {
        warn!("Modem did not attach within {wait}s");
    }
    let snapshot = umb.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{snapshot}");
    }
    umb.detach().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    let result = match cli.command {
        Command::List => list(),
        Command::Connect(args) => connect(args).await,
        Command::Status { device, wait, json } => status(device, wait, json).await,
    };
    if let Err(e) = result {
        error!("{:?}", e);
        process::exit(1);
    }
    Ok(())
}
