#[macro_use]
extern crate log;
extern crate ctrlc;
extern crate simplelog;
use simplelog::*;

use crate::discover::{Discover, DISCOVERY_WINDOW_SECS};
use crate::plug::{Client, CONTROL_TIMEOUT_SECS};
use crate::settings::{Settings, Watcher, DEFAULT_CONFIG};
use crate::sun::SunCalc;
use crate::wemo::{Inputs, WeMo};
use chrono::Local;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

mod asyncfile;
mod clock;
mod discover;
mod error;
mod lux;
mod plug;
mod registry;
mod schedule;
mod sensor;
mod settings;
mod sun;
mod timespec;
mod wemo;

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn logging_init(log_location: Option<String>) {
    let conf = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day], [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();

    let mut loggers = vec![];

    let console_logger: Box<dyn SharedLogger> = if std::io::stdout().is_terminal() {
        TermLogger::new(
            LevelFilter::Debug,
            conf.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )
    } else {
        SimpleLogger::new(LevelFilter::Debug, conf.clone())
    };
    loggers.push(console_logger);

    let mut logfile_error: Option<String> = None;
    if let Some(ref log_path) = log_location {
        let logfile = OpenOptions::new().create(true).append(true).open(log_path);
        match logfile {
            Ok(logfile) => {
                loggers.push(WriteLogger::new(LevelFilter::Info, conf, logfile));
            }
            Err(e) => {
                logfile_error = Some(format!(
                    "Error creating/opening log file: {:?}: {:?}",
                    log_path, e
                ));
            }
        }
    }

    if CombinedLogger::init(loggers).is_err() {
        eprintln!("Cannot initialize logging subsystem");
    }
    if let Some(e) = logfile_error {
        error!("{}", e);
        warn!("Will do console logging only...");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| DEFAULT_CONFIG.to_string()),
    );
    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            logging_init(None);
            error!("{}", e);
            return Err(e.into());
        }
    };

    logging_init(settings.get("global", "log"));
    info!("Welcome to wemod (WeMo smart plug daemon)");
    info!("using config {}", config_path.display());

    let window = settings.duration_or(
        "global",
        "discovery_window",
        Duration::from_secs_f32(DISCOVERY_WINDOW_SECS),
    );
    let timeout = settings.duration_or(
        "global",
        "timeout",
        Duration::from_secs_f32(CONTROL_TIMEOUT_SECS),
    );
    let port = match settings.get_parsed::<u16>("global", "port") {
        Ok(port) => port.unwrap_or(0),
        Err(e) => {
            warn!("{}, using any free port", e);
            0
        }
    };

    //the daemon is useless without its discovery socket
    let discover = match Discover::bind(port, window) {
        Ok(discover) => discover,
        Err(e) => {
            error!("cannot open discovery socket: {}", e);
            return Err(e.into());
        }
    };

    //Ctrl-C / SIGTERM support
    let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = terminate_tx.send(());
    })?;
    let rescan = signal(SignalKind::user_defined1())?;
    let dump = signal(SignalKind::user_defined2())?;

    let cancel_flag = Arc::new(AtomicBool::new(false));

    //config file watcher task
    let (settings_tx, settings_rx) = mpsc::channel(1);
    let mut watcher = Watcher::new(config_path, settings_tx);
    let worker_cancel_flag = cancel_flag.clone();
    let watcher_handle = tokio::spawn(async move {
        watcher.worker(worker_cancel_flag).await;
    });

    let mut wemo = WeMo::new(
        settings,
        discover,
        Client::new(timeout),
        Box::new(SunCalc::new(Local)),
    );
    wemo.run(Inputs {
        settings: settings_rx,
        terminate: terminate_rx,
        rescan,
        dump,
    })
    .await;

    info!("Stopping all tasks...");
    //inform all tasks about termination
    cancel_flag.store(true, Ordering::SeqCst);
    let _ = watcher_handle.await;
    info!("Done, exiting");
    Ok(())
}
