// src/main.rs
//
// canlab command-line front end: monitor, trace or transmit on one adapter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use canlab_lib::report::{self, ExportFormat, MONITOR_HEADERS};
use canlab_lib::transmit::list;
use canlab_lib::{logging, tlog, AppConfig, DeviceKind, DiscreteFilter, Session};

/// CAN bus monitor, tracer and transmit scheduler
#[derive(Parser, Debug)]
#[command(name = "canlab")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the latest frame per id, refreshed every second
    Monitor {
        #[command(flatten)]
        common: CommonArgs,

        /// Write the final snapshot here (.txt aligned, otherwise `;`-delimited)
        #[arg(long, value_name = "FILE")]
        export: Option<PathBuf>,
    },
    /// Print every received frame in arrival order
    Trace {
        #[command(flatten)]
        common: CommonArgs,

        /// Record the trace to this file while running
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
    },
    /// Load a transmit list and run it
    Send {
        #[command(flatten)]
        common: CommonArgs,

        /// Transmit list (`ID;DLC;Data;Period;Count;Comment;Trigger ID`)
        #[arg(long, value_name = "FILE")]
        list: PathBuf,

        /// Activate this scenario instead of arming every periodic slot
        #[arg(long, value_name = "NAME")]
        scenario: Option<String>,

        /// Scenario delay in milliseconds (overrides the config file)
        #[arg(long, value_name = "MS")]
        delay: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured channel (serial port or CAN interface)
    #[arg(long, value_name = "CHANNEL")]
    channel: Option<String>,

    /// Use a SocketCAN interface instead of the serial line adapter
    #[arg(long)]
    socketcan: bool,

    /// DBC file or folder of DBC files for message names
    #[arg(long, value_name = "PATH")]
    dbc: Option<PathBuf>,

    /// Only pass these hex ids, e.g. "7DF,7E8" (replaces the configured list)
    #[arg(long, value_name = "IDS")]
    ids: Option<String>,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long, value_name = "N")]
    seconds: Option<u64>,

    /// Also write the log to a timestamped file in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

impl CommonArgs {
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(channel) = &self.channel {
            config.connection.channel = channel.clone();
        }
        if self.socketcan {
            config.connection.device_kind = DeviceKind::SocketCan;
        }
        if let Some(ids) = &self.ids {
            config.filters.discrete =
                DiscreteFilter::from_list(ids).with_context(|| format!("--ids {}", ids))?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let common = match &cli.command {
        Command::Monitor { common, .. }
        | Command::Trace { common, .. }
        | Command::Send { common, .. } => common,
    };
    if let Some(dir) = &common.log_dir {
        logging::init_file_logging(dir)
            .with_context(|| format!("log directory {}", dir.display()))?;
    }

    let result = match &cli.command {
        Command::Monitor { common, export } => run_monitor(common, export.as_deref()).await,
        Command::Trace { common, save } => run_trace(common, save.as_deref()).await,
        Command::Send {
            common,
            list,
            scenario,
            delay,
        } => run_send(common, list, scenario.as_deref(), *delay).await,
    };

    logging::stop_file_logging();
    result
}

fn open_session(common: &CommonArgs) -> Result<Session> {
    let config = common.load_config()?;
    let session = Session::new(&config, tokio::runtime::Handle::current());
    if let Some(path) = &common.dbc {
        let count = session.load_dbc(path).map_err(anyhow::Error::msg)?;
        tlog!("[canlab] {} message name(s) from {}", count, path.display());
    }
    Ok(session)
}

/// Tick once per second until the deadline or Ctrl-C, calling `on_tick`.
/// Returns early if the session drops its connection.
async fn run_for(session: &Session, seconds: Option<u64>, mut on_tick: impl FnMut(&Session)) {
    let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        let sleep_until = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = ticker.tick() => {
                on_tick(session);
                if !session.is_connected() {
                    tlog!("[canlab] Connection closed ({:?})", session.worker_state());
                    break;
                }
            }
            _ = sleep_until => break,
            _ = tokio::signal::ctrl_c() => {
                tlog!("[canlab] Interrupted");
                break;
            }
        }
    }
    on_tick(session);
}

async fn run_monitor(common: &CommonArgs, export: Option<&Path>) -> Result<()> {
    let mut session = open_session(common)?;
    session.connect().context("connect failed")?;

    run_for(&session, common.seconds, |session| {
        let data = session.data();
        let rows = report::monitor_rows(&data.monitor);
        print!("{}", report::render(ExportFormat::Aligned, &MONITOR_HEADERS, &rows));
        println!();
    })
    .await;

    session.disconnect();
    if let Some(path) = export {
        let count = report::export_monitor(&session.data().monitor, path)
            .with_context(|| format!("export to {}", path.display()))?;
        println!("Exported {} id(s) to {}", count, path.display());
    }
    Ok(())
}

async fn run_trace(common: &CommonArgs, save: Option<&Path>) -> Result<()> {
    let mut session = open_session(common)?;
    if let Some(path) = save {
        session
            .start_recording(path)
            .with_context(|| format!("record to {}", path.display()))?;
    }
    session.connect().context("connect failed")?;

    let mut printed = 0;
    run_for(&session, common.seconds, |session| {
        let data = session.data();
        for entry in data.tracer.since(printed) {
            println!("{}", report::tracer_row(&data.tracer, entry).join("  "));
        }
        printed = data.tracer.len();
    })
    .await;

    session.disconnect();
    session.stop_recording();
    let lost = session.data().lost_frames;
    if lost > 0 {
        println!("{} frame(s) traced, {} dropped while lagging", printed, lost);
    } else {
        println!("{} frame(s) traced", printed);
    }
    Ok(())
}

async fn run_send(
    common: &CommonArgs,
    list_path: &Path,
    scenario: Option<&str>,
    delay: Option<u64>,
) -> Result<()> {
    let mut session = open_session(common)?;
    if session.settings().listen_only {
        bail!("configuration is listen-only; nothing can be sent");
    }
    if let Some(ms) = delay {
        session.set_scenario_delay(Duration::from_millis(ms));
    }

    let slots = list::import(list_path)?;
    session.scheduler().replace_table(slots);
    session.connect().context("connect failed")?;

    match scenario {
        Some(name) => {
            session
                .activate_scenario(name)
                .with_context(|| format!("scenario '{}'", name))?;
            println!("Scenario '{}' activated", name);
        }
        None => {
            let armed = session.scheduler().send_all();
            println!("{} periodic slot(s) armed", armed);
        }
    }

    run_for(&session, common.seconds, |_| {}).await;

    session.scheduler().stop_all();
    {
        let table = session
            .scheduler()
            .table()
            .lock()
            .map_err(|_| anyhow::anyhow!("transmit table lock poisoned"))?;
        let rows = list::list_rows(&table);
        print!("{}", report::render(ExportFormat::Aligned, &list::LIST_HEADERS, &rows));
    }
    session.disconnect();
    Ok(())
}
