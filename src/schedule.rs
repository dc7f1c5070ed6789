use crate::error::{Error, Result};
use crate::plug::{Client, Plug};
use crate::settings::Settings;
use crate::sun::SunSource;
use crate::timespec::{parse_time_spec, TimeSpec};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

pub const MIN_RESCAN_SECS: u32 = 60;
pub const SUNRISE_OFFSET_SECS: i64 = 15 * 60; //off shortly after sunrise
pub const SUNSET_OFFSET_SECS: i64 = -30 * 60; //on shortly before sunset

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Rescan,
    Daily,
    Sun,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Category::Rescan => "rescan",
            Category::Daily => "daily",
            Category::Sun => "sun",
        };
        f.pad(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    On,
    Off,
}

impl Action {
    /// Runs the action against one plug and returns the state it ended up in.
    pub async fn apply(self, client: &Client, addr: SocketAddr) -> Result<bool> {
        match self {
            Action::On => client.on(addr).await,
            Action::Off => client.off(addr).await,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(match self {
            Action::On => "on",
            Action::Off => "off",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub addr: SocketAddr,
    pub name: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.addr)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Timer {
    Rescan {
        interval: u32,
    },
    Switch {
        target: Target,
        time: TimeSpec,
        action: Action,
    },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    categories: BTreeMap<Category, Vec<Timer>>,
}

impl Schedule {
    pub fn get(&self, category: Category) -> &[Timer] {
        self.categories
            .get(&category)
            .map(|timers| timers.as_slice())
            .unwrap_or(&[])
    }

    fn push(&mut self, category: Category, timer: Timer) {
        self.categories.entry(category).or_default().push(timer);
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &Timer)> {
        self.categories
            .iter()
            .flat_map(|(category, timers)| timers.iter().map(move |t| (*category, t)))
    }

    pub fn rescan_interval(&self) -> Option<u32> {
        self.get(Category::Rescan).iter().find_map(|t| match t {
            Timer::Rescan { interval } => Some(*interval),
            _ => None,
        })
    }
}

pub struct Compiler {
    pub name: String,
    rescan: Option<u32>,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            name: "schedule".into(),
            rescan: None,
        }
    }

    fn rescan_interval(&mut self, settings: &Settings) -> Option<u32> {
        let requested = match settings.get_parsed::<u32>("global", "rescan") {
            Ok(Some(secs)) => secs,
            Ok(None) => {
                self.rescan = None;
                return None;
            }
            Err(e) => {
                warn!("{}: {}, keeping {:?}", self.name, e, self.rescan);
                return self.rescan;
            }
        };
        if requested < MIN_RESCAN_SECS {
            warn!(
                "{}: {}, keeping {:?}",
                self.name,
                Error::RescanTooShort(requested, MIN_RESCAN_SECS),
                self.rescan
            );
        } else {
            self.rescan = Some(requested);
        }
        self.rescan
    }

    fn sun_times(settings: &Settings, sun: &mut dyn SunSource) -> Result<(TimeSpec, TimeSpec)> {
        let latitude = settings.get_parsed::<f64>("global", "latitude")?;
        let longitude = settings.get_parsed::<f64>("global", "longitude")?;
        let (latitude, longitude) = match (latitude, longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                return Err(Error::SunUnavailable(
                    "global.latitude/longitude not configured".into(),
                ))
            }
        };
        let rise = parse_time_spec(&sun.rise(latitude, longitude)?)?;
        let set = parse_time_spec(&sun.set(latitude, longitude)?)?;
        Ok((rise, set))
    }

    fn daily_times(&self, settings: &Settings, name: &str, key: &str) -> Vec<TimeSpec> {
        let mut times = vec![];
        for token in settings.get_list(name, key) {
            match parse_time_spec(&token) {
                Ok(time) => times.push(time),
                Err(e) => warn!("{}: {}.{}: skipping {:?}: {}", self.name, name, key, token, e),
            }
        }
        times
    }

    pub fn compile(
        &mut self,
        settings: &Settings,
        plugs: &[Plug],
        sun: &mut dyn SunSource,
    ) -> Schedule {
        let mut schedule = Schedule::default();

        if let Some(interval) = self.rescan_interval(settings) {
            schedule.push(Category::Rescan, Timer::Rescan { interval });
        }

        //fetched at most once per pass, shared by all plugs
        let mut sun_times: Option<std::result::Result<(TimeSpec, TimeSpec), String>> = None;

        for plug in plugs {
            let name = match &plug.name {
                Some(name) => name,
                None => {
                    debug!("{}: {} has no name yet, no timers", self.name, plug.addr());
                    continue;
                }
            };
            if !settings.has_section(name) {
                continue;
            }
            let target = Target {
                addr: plug.addr(),
                name: name.clone(),
            };

            if settings.get_bool(name, "sun") {
                let times = sun_times.get_or_insert_with(|| {
                    Compiler::sun_times(settings, sun).map_err(|e| e.to_string())
                });
                match times {
                    Ok((rise, set)) => {
                        schedule.push(
                            Category::Sun,
                            Timer::Switch {
                                target: target.clone(),
                                time: rise.offset(SUNRISE_OFFSET_SECS),
                                action: Action::Off,
                            },
                        );
                        schedule.push(
                            Category::Sun,
                            Timer::Switch {
                                target: target.clone(),
                                time: set.offset(SUNSET_OFFSET_SECS),
                                action: Action::On,
                            },
                        );
                    }
                    Err(e) => {
                        warn!("{}: no sun timers for {}: {}", self.name, target, e);
                    }
                }
            }

            if settings.get_bool(name, "daily") {
                for (key, action) in [("ontimes", Action::On), ("offtimes", Action::Off)] {
                    for time in self.daily_times(settings, name, key) {
                        schedule.push(
                            Category::Daily,
                            Timer::Switch {
                                target: target.clone(),
                                time,
                                action,
                            },
                        );
                    }
                }
            }
        }

        info!("📅 {}: compiled {} timer(s)", self.name, schedule.len());
        schedule
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub struct StubSun {
        pub rise: String,
        pub set: String,
        pub calls: u32,
        pub fail: bool,
    }

    impl StubSun {
        pub fn new(rise: &str, set: &str) -> Self {
            Self {
                rise: rise.into(),
                set: set.into(),
                calls: 0,
                fail: false,
            }
        }
    }

    impl SunSource for StubSun {
        fn rise(&mut self, _latitude: f64, _longitude: f64) -> Result<String> {
            self.calls += 1;
            if self.fail {
                return Err(Error::SunUnavailable("stub".into()));
            }
            Ok(self.rise.clone())
        }

        fn set(&mut self, _latitude: f64, _longitude: f64) -> Result<String> {
            self.calls += 1;
            Ok(self.set.clone())
        }
    }

    pub fn named(last: u8, name: &str) -> Plug {
        let mut plug = Plug::new(SocketAddr::from(([192, 168, 1, last], 49153)));
        plug.name = Some(name.into());
        plug
    }

    fn switches(schedule: &Schedule, category: Category) -> Vec<(String, String, Action)> {
        schedule
            .get(category)
            .iter()
            .filter_map(|t| match t {
                Timer::Switch {
                    target,
                    time,
                    action,
                } => Some((target.name.clone(), time.to_string(), *action)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lamp_daily_timers() {
        let settings =
            Settings::parse("[Lamp]\ndaily = true\nontimes = 7:00,19:00%6-7\n").unwrap();
        let mut sun = StubSun::new("06:00", "20:00");
        let schedule = Compiler::new().compile(&settings, &[named(1, "Lamp")], &mut sun);

        assert_eq!(
            schedule.get(Category::Daily),
            &[
                Timer::Switch {
                    target: Target {
                        addr: named(1, "Lamp").addr(),
                        name: "Lamp".into()
                    },
                    time: TimeSpec::new(7 * 3600, 0),
                    action: Action::On,
                },
                Timer::Switch {
                    target: Target {
                        addr: named(1, "Lamp").addr(),
                        name: "Lamp".into()
                    },
                    time: TimeSpec::new(19 * 3600, 0b110_0000),
                    action: Action::On,
                },
            ]
        );
        assert!(schedule.get(Category::Sun).is_empty());
        assert_eq!(schedule.rescan_interval(), None);
        assert_eq!(sun.calls, 0);
    }

    #[test]
    fn compiling_twice_gives_the_same_schedule() {
        let settings = Settings::parse(
            "[global]\nrescan = 600\nlatitude = 52.3\nlongitude = 4.9\n\
             [Lamp]\nsun = true\ndaily = true\nofftimes = 23:30\n",
        )
        .unwrap();
        let plugs = [named(1, "Lamp")];
        let mut sun = StubSun::new("06:00", "20:00");
        let mut compiler = Compiler::new();

        let first = compiler.compile(&settings, &plugs, &mut sun);
        let second = compiler.compile(&settings, &plugs, &mut sun);
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn bad_token_only_drops_itself() {
        let settings = Settings::parse(
            "[Lamp]\ndaily = true\nontimes = 7:00, 25:00, 8:00%9, 9:15\nofftimes = 22:00\n\
             [Fan]\ndaily = true\nontimes = 12:00\n",
        )
        .unwrap();
        let mut sun = StubSun::new("06:00", "20:00");
        let schedule =
            Compiler::new().compile(&settings, &[named(1, "Lamp"), named(2, "Fan")], &mut sun);

        assert_eq!(
            switches(&schedule, Category::Daily),
            vec![
                ("Lamp".into(), "07:00".into(), Action::On),
                ("Lamp".into(), "09:15".into(), Action::On),
                ("Lamp".into(), "22:00".into(), Action::Off),
                ("Fan".into(), "12:00".into(), Action::On),
            ]
        );
    }

    #[test]
    fn sun_timers_use_offsets_and_one_lookup() {
        let settings = Settings::parse(
            "[global]\nlatitude = 52.3\nlongitude = 4.9\n\
             [Lamp]\nsun = true\n[Porch]\nsun = true\n[Fan]\nsun = false\n",
        )
        .unwrap();
        let mut sun = StubSun::new("06:10", "00:15");
        let plugs = [named(1, "Lamp"), named(2, "Porch"), named(3, "Fan")];
        let schedule = Compiler::new().compile(&settings, &plugs, &mut sun);

        assert_eq!(
            switches(&schedule, Category::Sun),
            vec![
                ("Lamp".into(), "06:25".into(), Action::Off),
                ("Lamp".into(), "23:45".into(), Action::On),
                ("Porch".into(), "06:25".into(), Action::Off),
                ("Porch".into(), "23:45".into(), Action::On),
            ]
        );
        assert_eq!(sun.calls, 2);
    }

    #[test]
    fn sun_failure_keeps_daily_timers() {
        let settings = Settings::parse(
            "[global]\nlatitude = 52.3\nlongitude = 4.9\n\
             [Lamp]\nsun = true\ndaily = true\nontimes = 7:00\n",
        )
        .unwrap();
        let mut sun = StubSun::new("06:00", "20:00");
        sun.fail = true;
        let schedule = Compiler::new().compile(&settings, &[named(1, "Lamp")], &mut sun);
        assert!(schedule.get(Category::Sun).is_empty());
        assert_eq!(schedule.get(Category::Daily).len(), 1);

        //no coordinates at all
        let settings = Settings::parse("[Lamp]\nsun = true\n").unwrap();
        let mut sun = StubSun::new("06:00", "20:00");
        let schedule = Compiler::new().compile(&settings, &[named(1, "Lamp")], &mut sun);
        assert!(schedule.is_empty());
        assert_eq!(sun.calls, 0);
    }

    #[test]
    fn rescan_floor_keeps_previous_interval() {
        let mut sun = StubSun::new("06:00", "20:00");
        let mut compiler = Compiler::new();

        let too_short = Settings::parse("[global]\nrescan = 30\n").unwrap();
        assert_eq!(compiler.compile(&too_short, &[], &mut sun).rescan_interval(), None);

        let valid = Settings::parse("[global]\nrescan = 300\n").unwrap();
        assert_eq!(compiler.compile(&valid, &[], &mut sun).rescan_interval(), Some(300));

        assert_eq!(compiler.compile(&too_short, &[], &mut sun).rescan_interval(), Some(300));

        let broken = Settings::parse("[global]\nrescan = often\n").unwrap();
        assert_eq!(compiler.compile(&broken, &[], &mut sun).rescan_interval(), Some(300));

        assert_eq!(
            compiler.compile(&Settings::empty(), &[], &mut sun).rescan_interval(),
            None
        );
    }

    #[test]
    fn unnamed_or_unconfigured_plugs_get_nothing() {
        let settings = Settings::parse("[Lamp]\ndaily = true\nontimes = 7:00\n").unwrap();
        let mut sun = StubSun::new("06:00", "20:00");
        let unnamed = Plug::new(SocketAddr::from(([192, 168, 1, 9], 49153)));
        let schedule =
            Compiler::new().compile(&settings, &[unnamed, named(2, "Heater")], &mut sun);
        assert!(schedule.is_empty());
    }

    #[test]
    fn deregistered_plug_loses_its_timers() {
        use crate::registry::Registry;

        let settings = Settings::parse("[Lamp]\ndaily = true\nontimes = 7:00\n").unwrap();
        let mut sun = StubSun::new("06:00", "20:00");
        let mut compiler = Compiler::new();
        let lamp = named(1, "Lamp").addr();

        let mut registry = Registry::new();
        registry.reconcile(vec![lamp]);
        registry.find_mut(lamp).unwrap().name = Some("Lamp".into());
        assert_eq!(compiler.compile(&settings, registry.plugs(), &mut sun).len(), 1);

        for _ in 0..4 {
            registry.reconcile(vec![]);
            assert_eq!(compiler.compile(&settings, registry.plugs(), &mut sun).len(), 1);
        }
        registry.reconcile(vec![]);
        assert!(compiler.compile(&settings, registry.plugs(), &mut sun).is_empty());
    }
}
