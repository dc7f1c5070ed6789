use crate::clock::{Clock, Due};
use crate::discover::Discover;
use crate::lux::LuxControl;
use crate::plug::Client;
use crate::registry::Registry;
use crate::schedule::{Action, Compiler, Schedule, Target, Timer};
use crate::sensor::{Sensor, SerialConfig};
use crate::settings::Settings;
use crate::sun::SunSource;
use chrono::{DateTime, Local, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::Signal;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver};
use tokio::time::Instant;

pub const LUX_CHANNEL_SIZE: usize = 16;
pub const REPORT_CHANNEL_SIZE: usize = 64;

pub struct Inputs {
    pub settings: Receiver<Settings>,
    pub terminate: UnboundedReceiver<()>,
    pub rescan: Signal,
    pub dump: Signal,
}

struct SensorTask {
    config: SerialConfig,
    cancel: Arc<AtomicBool>,
    detected: Arc<AtomicBool>,
}

pub struct WeMo {
    pub name: String,
    settings: Settings,
    discover: Discover,
    client: Client,
    registry: Registry,
    compiler: Compiler,
    schedule: Schedule,
    clock: Clock<Local>,
    sun: Box<dyn SunSource>,
    lux: LuxControl,
    sensor: Option<SensorTask>,
    lux_tx: Sender<u32>,
    lux_rx: Receiver<u32>,
    report_tx: Sender<(SocketAddr, bool)>,
    report_rx: Receiver<(SocketAddr, bool)>,
    deadline: Option<DateTime<Utc>>,
}

impl WeMo {
    pub fn new(
        settings: Settings,
        discover: Discover,
        client: Client,
        sun: Box<dyn SunSource>,
    ) -> Self {
        let (lux_tx, lux_rx) = mpsc::channel(LUX_CHANNEL_SIZE);
        let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_SIZE);
        Self {
            name: "wemo".into(),
            settings,
            discover,
            client,
            registry: Registry::new(),
            compiler: Compiler::new(),
            schedule: Schedule::default(),
            clock: Clock::new(Local),
            sun,
            lux: LuxControl::new(),
            sensor: None,
            lux_tx,
            lux_rx,
            report_tx,
            report_rx,
            deadline: None,
        }
    }

    fn compile(&mut self) {
        self.schedule = self
            .compiler
            .compile(&self.settings, self.registry.plugs(), self.sun.as_mut());
        self.lux.load(&self.settings, self.registry.plugs());
        self.clock
            .sync_rescan(self.schedule.rescan_interval(), Utc::now());
    }

    pub async fn rescan(&mut self) {
        let started = Utc::now();
        self.clock.rescanned(started);
        match self.discover.scan().await {
            Ok(found) => {
                let churn = self.registry.reconcile(found);
                debug!(
                    "{}: rescan: {} added, {} missing, {} removed",
                    self.name,
                    churn.added.len(),
                    churn.missing.len(),
                    churn.removed.len()
                );
                self.registry.resolve_names(&self.client, true).await;
                self.compile();
            }
            Err(e) => {
                error!("{}: discovery failed: {}", self.name, e);
            }
        }

        //the loop was blocked, pick up what came due meanwhile
        for due in self.clock.catch_up(started, Utc::now(), &self.schedule) {
            if let Due::Switch { target, action } = due {
                info!("⏰ {}: {} -> {} (after rescan)", self.name, target, action);
                self.dispatch(target, action);
            }
        }
    }

    pub fn reload(&mut self, settings: Settings) {
        self.settings = settings;
        self.update_sensor();
        self.compile();
    }

    fn update_sensor(&mut self) {
        let wanted = SerialConfig::from_settings(&self.settings);
        if self.sensor.as_ref().map(|s| &s.config) == wanted.as_ref() {
            return;
        }
        self.stop_sensor();

        if let Some(config) = wanted {
            let mut sensor = Sensor::new(config.clone(), self.lux_tx.clone());
            let cancel = Arc::new(AtomicBool::new(false));
            let detected = sensor.detected.clone();
            let worker_cancel_flag = cancel.clone();
            tokio::spawn(async move {
                sensor.worker(worker_cancel_flag).await;
            });
            self.sensor = Some(SensorTask {
                config,
                cancel,
                detected,
            });
        }
    }

    fn stop_sensor(&mut self) {
        if let Some(task) = self.sensor.take() {
            debug!("{}: closing sensor on {}", self.name, task.config.port);
            task.cancel.store(true, Ordering::SeqCst);
        }
    }

    //runs in its own task, the result comes back as a report
    fn dispatch(&self, target: Target, action: Action) {
        let client = self.client.clone();
        let report = self.report_tx.clone();
        tokio::spawn(async move {
            match action.apply(&client, target.addr).await {
                Ok(on) => {
                    info!("⚡ {}: switched {}", target, if on { "on" } else { "off" });
                    let _ = report.send((target.addr, on)).await;
                }
                Err(e) => {
                    error!("{}: {} failed: {}", target, action, e);
                }
            }
        });
    }

    pub async fn handle_due(&mut self, due: Vec<Due>) {
        for item in due {
            match item {
                Due::Rescan => self.rescan().await,
                Due::Switch { target, action } => {
                    info!("⏰ {}: {} -> {}", self.name, target, action);
                    self.dispatch(target, action);
                }
            }
        }
    }

    pub fn on_lux(&mut self, lux: u32) {
        if let Some(action) = self.lux.check(lux) {
            for target in self.lux.targets.clone() {
                self.dispatch(target, action);
            }
        }
    }

    fn arm(&mut self) -> Option<Instant> {
        let now = Utc::now();
        self.deadline = self.clock.arm(now, &self.schedule);
        self.deadline.map(|at| {
            //a deadline in the past wakes us right away
            Instant::now() + (at - now).to_std().unwrap_or_default()
        })
    }

    fn display_schedules(&self) {
        let now = Utc::now();
        info!("{}: {} timer(s)", self.name, self.schedule.len());
        for (category, timer) in self.schedule.iter() {
            match timer {
                Timer::Rescan { interval } => {
                    let next = self
                        .clock
                        .next_rescan()
                        .map(|t| t.with_timezone(&Local).format("%F %T").to_string())
                        .unwrap_or_default();
                    info!("  {:<7} every {}s, next {}", category, interval, next);
                }
                Timer::Switch {
                    target,
                    time,
                    action,
                } => {
                    let next = self
                        .clock
                        .next_occurrence(time, now)
                        .map(|t| t.with_timezone(&Local).format("%F %T").to_string())
                        .unwrap_or_default();
                    info!(
                        "  {:<7} {:<24} {:<3} at {:<12} next {}",
                        category,
                        target.name,
                        action,
                        time.to_string(),
                        next
                    );
                }
            }
        }
        if let Some(at) = self.deadline {
            info!(
                "{}: clock {:?}, deadline {}",
                self.name,
                self.clock.state,
                at.with_timezone(&Local).format("%F %T")
            );
        }
    }

    fn display_sensor(&self) {
        match &self.sensor {
            Some(task) => info!(
                "sensor: {} at {} baud, {}",
                task.config.port,
                task.config.baudrate,
                if task.detected.load(Ordering::SeqCst) {
                    "detected"
                } else {
                    "not detected"
                }
            ),
            None => info!("sensor: not configured"),
        }
    }

    pub fn dump(&self) {
        self.registry.display();
        self.display_sensor();
        self.lux.display();
        self.display_schedules();
    }

    pub async fn run(&mut self, mut inputs: Inputs) {
        info!("{}: starting", self.name);
        self.update_sensor();
        self.rescan().await;

        loop {
            let wake = self.arm();
            tokio::select! {
                _ = async {
                    match wake {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let due = self.clock.check(Utc::now(), &self.schedule);
                    self.handle_due(due).await;
                }
                ready = self.discover.readable() => {
                    match ready {
                        Ok(()) => self.discover.drain(),
                        Err(e) => error!("{}: discovery socket: {}", self.name, e),
                    }
                }
                Some(settings) = inputs.settings.recv() => {
                    self.reload(settings);
                }
                Some(lux) = self.lux_rx.recv() => {
                    self.on_lux(lux);
                }
                Some((addr, on)) = self.report_rx.recv() => {
                    self.registry.set_state(addr, on);
                }
                Some(()) = inputs.rescan.recv() => {
                    info!("{}: rescan requested", self.name);
                    self.rescan().await;
                }
                Some(()) = inputs.dump.recv() => {
                    self.dump();
                }
                _ = inputs.terminate.recv() => {
                    info!("{}: Ctrl-C or SIGTERM signal detected, exiting...", self.name);
                    break;
                }
            }
        }

        self.stop_sensor();
        info!("{}: stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plug::tests::fake_plug;
    use crate::schedule::tests::StubSun;
    use crate::schedule::Category;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddrV4;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    //answers every search with the given plug locations
    async fn responder(plugs: Vec<SocketAddr>) -> SocketAddrV4 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                for plug in &plugs {
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\nLOCATION: http://{}/setup.xml\r\n\r\n",
                        plug
                    );
                    let _ = socket.send_to(reply.as_bytes(), from).await;
                }
            }
        });
        addr
    }

    async fn daemon(config: &str, plugs: Vec<SocketAddr>) -> WeMo {
        let mut discover = Discover::bind(0, Duration::from_millis(300)).unwrap();
        discover.target = responder(plugs).await;
        WeMo::new(
            Settings::parse(config).unwrap(),
            discover,
            Client::new(Duration::from_secs(2)),
            Box::new(StubSun::new("06:00", "20:00")),
        )
    }

    const CONFIG: &str = "
[global]
rescan = 120

[Lamp]
daily = true
ontimes = 7:00
sun = true

[serial]
onlux = 50
controls = Lamp
";

    #[tokio::test]
    async fn rescan_registers_and_compiles() {
        let (lamp, _) = fake_plug("Lamp", false).await;
        let mut wemo = daemon(CONFIG, vec![lamp]).await;
        wemo.rescan().await;

        assert_eq!(wemo.registry.find_by_name("Lamp").map(|p| p.addr()), Some(lamp));
        assert_eq!(wemo.schedule.get(Category::Daily).len(), 1);
        //no coordinates configured
        assert!(wemo.schedule.get(Category::Sun).is_empty());
        assert_eq!(wemo.schedule.rescan_interval(), Some(120));
        assert!(wemo.clock.next_rescan().is_some());
        assert_eq!(wemo.lux.targets.len(), 1);
        assert!(wemo.arm().is_some());
    }

    #[tokio::test]
    async fn due_switch_is_dispatched_and_reported() {
        let (lamp, _) = fake_plug("Lamp", true).await;
        let mut wemo = daemon(CONFIG, vec![lamp]).await;
        wemo.rescan().await;

        let target = Target {
            addr: lamp,
            name: "Lamp".into(),
        };
        wemo.handle_due(vec![Due::Switch {
            target,
            action: Action::Off,
        }])
        .await;
        assert_eq!(wemo.report_rx.recv().await, Some((lamp, false)));
    }

    #[tokio::test]
    async fn lux_crossing_switches_controls() {
        let (lamp, _) = fake_plug("Lamp", false).await;
        let mut wemo = daemon(CONFIG, vec![lamp]).await;
        wemo.rescan().await;

        wemo.on_lux(60);
        wemo.on_lux(60);
        wemo.on_lux(40);
        let (addr, on) = wemo.report_rx.recv().await.unwrap();
        assert_eq!((addr, on), (lamp, true));
        wemo.registry.set_state(addr, on);
        assert_eq!(wemo.registry.find(lamp).unwrap().state, Some(true));
    }

    #[tokio::test]
    async fn reload_replaces_timers() {
        let (lamp, _) = fake_plug("Lamp", false).await;
        let mut wemo = daemon(CONFIG, vec![lamp]).await;
        wemo.rescan().await;
        assert_eq!(wemo.schedule.len(), 2);

        wemo.reload(Settings::parse("[Lamp]\ndaily = false\n").unwrap());
        assert!(wemo.schedule.is_empty());
        assert!(wemo.lux.targets.is_empty());
        assert_eq!(wemo.clock.next_rescan(), None);
        assert_eq!(wemo.arm(), None);
    }

    #[tokio::test]
    async fn timer_due_during_requested_rescan_is_dispatched() {
        let (lamp, _) = fake_plug("Lamp", false).await;
        let soon = (Local::now() + chrono::Duration::seconds(8)).format("%H:%M:%S");
        let config = format!("[Lamp]\ndaily = true\nontimes = {}\n", soon);
        let mut wemo = daemon(&config, vec![lamp]).await;
        wemo.rescan().await;
        assert_eq!(wemo.schedule.get(Category::Daily).len(), 1);
        assert!(wemo.clock.check(Utc::now(), &wemo.schedule).is_empty());

        //a slow scan, as on SIGUSR1, runs across the switch time
        wemo.discover.window = Duration::from_secs(4);
        wemo.rescan().await;
        let report = tokio::time::timeout(Duration::from_secs(5), wemo.report_rx.recv()).await;
        assert_eq!(report.unwrap(), Some((lamp, true)));
    }
}
