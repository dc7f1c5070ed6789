use crate::asyncfile::AsyncFile;
use crate::settings::Settings;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::timeout;

pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const READ_TIMEOUT_SECS: f32 = 1.0; //max wait for data before checking the cancel flag
pub const REOPEN_DELAY_SECS: f32 = 10.0; //secs before retrying a failed device
pub const READING_SIZE: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
}

impl SerialConfig {
    //`None` when no sensor port is configured
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let port = settings.get("serial", "port").filter(|p| !p.is_empty())?;
        let baudrate = match settings.get_parsed::<u32>("serial", "baudrate") {
            Ok(Some(b)) => b,
            Ok(None) => DEFAULT_BAUDRATE,
            Err(e) => {
                warn!("sensor: {}, using {}", e, DEFAULT_BAUDRATE);
                DEFAULT_BAUDRATE
            }
        };
        Some(Self { port, baudrate })
    }
}

//splits raw bytes into native-endian `u32` readings, keeping a partial tail
pub fn take_readings(pending: &mut Vec<u8>) -> Vec<u32> {
    let complete = pending.len() / READING_SIZE * READING_SIZE;
    let readings = pending[..complete]
        .chunks_exact(READING_SIZE)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    pending.drain(..complete);
    readings
}

pub struct Sensor {
    pub name: String,
    pub config: SerialConfig,
    pub transmitter: Sender<u32>,
    pub detected: Arc<AtomicBool>,
}

impl Sensor {
    pub fn new(config: SerialConfig, transmitter: Sender<u32>) -> Self {
        Self {
            name: "sensor".into(),
            config,
            transmitter,
            detected: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn read_loop(&self, file: AsyncFile, worker_cancel_flag: &Arc<AtomicBool>) -> bool {
        let mut buf = [0u8; 64];
        let mut pending = Vec::with_capacity(buf.len());
        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                debug!("{}: Got terminate signal from main", self.name);
                return false;
            }
            match timeout(Duration::from_secs_f32(READ_TIMEOUT_SECS), file.read(&mut buf)).await {
                Ok(Ok(len)) => {
                    pending.extend_from_slice(&buf[..len]);
                    for lux in take_readings(&mut pending) {
                        trace!("{}: {} lx", self.name, lux);
                        if self.transmitter.send(lux).await.is_err() {
                            return false;
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!("{}: read error on {}: {:?}", self.name, self.config.port, e);
                    return true;
                }
                Err(_) => (),
            }
        }
    }

    pub async fn worker(&mut self, worker_cancel_flag: Arc<AtomicBool>) {
        info!(
            "{}: Starting task, port {} at {} baud",
            self.name, self.config.port, self.config.baudrate
        );
        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                break;
            }

            match AsyncFile::open_serial(&self.config.port, self.config.baudrate) {
                Ok(file) => {
                    info!("{}: {} opened", self.name, self.config.port);
                    self.detected.store(true, Ordering::SeqCst);
                    let retry = self.read_loop(file, &worker_cancel_flag).await;
                    self.detected.store(false, Ordering::SeqCst);
                    if !retry {
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        "{}: error opening device {}: {:?}",
                        self.name, self.config.port, e
                    );
                }
            }
            tokio::time::sleep(Duration::from_secs_f32(REOPEN_DELAY_SECS)).await;
        }
        info!("{}: Stopping task", self.name);
    }
}
