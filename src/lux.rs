use crate::plug::Plug;
use crate::schedule::{Action, Target};
use crate::settings::Settings;

pub struct LuxControl {
    pub name: String,
    pub onlux: Option<u32>,
    pub offlux: Option<u32>,
    pub controls: Vec<String>,
    pub targets: Vec<Target>,
    last: Option<u32>,
}

impl LuxControl {
    pub fn new() -> Self {
        Self {
            name: "lux".into(),
            onlux: None,
            offlux: None,
            controls: vec![],
            targets: vec![],
            last: None,
        }
    }

    pub fn load(&mut self, settings: &Settings, plugs: &[Plug]) {
        self.onlux = self.threshold(settings, "onlux");
        self.offlux = self.threshold(settings, "offlux");
        self.controls = settings.get_list("serial", "controls");

        self.targets = self
            .controls
            .iter()
            .filter_map(|name| {
                match plugs.iter().find(|p| p.name.as_deref() == Some(name.as_str())) {
                    Some(plug) => Some(Target {
                        addr: plug.addr(),
                        name: name.clone(),
                    }),
                    None => {
                        debug!("{}: {} is not registered (yet)", self.name, name);
                        None
                    }
                }
            })
            .collect();
    }

    fn threshold(&self, settings: &Settings, key: &str) -> Option<u32> {
        match settings.get_parsed::<u32>("serial", key) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: {}, threshold disabled", self.name, e);
                None
            }
        }
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }

    //feeds one reading; returns the action to apply when a threshold is crossed
    pub fn check(&mut self, lux: u32) -> Option<Action> {
        let previous = self.last.replace(lux)?;
        if let Some(on) = self.onlux {
            if previous >= on && lux < on {
                info!("💡 {}: {} -> {} lx, below {}", self.name, previous, lux, on);
                return Some(Action::On);
            }
        }
        if let Some(off) = self.offlux {
            if previous <= off && lux > off {
                info!("🌞 {}: {} -> {} lx, above {}", self.name, previous, lux, off);
                return Some(Action::Off);
            }
        }
        None
    }

    pub fn display(&self) {
        info!(
            "{}: onlux: {:?}, offlux: {:?}, last reading: {:?}",
            self.name, self.onlux, self.offlux, self.last
        );
        for name in &self.controls {
            match self.targets.iter().find(|t| &t.name == name) {
                Some(target) => info!("  controls {}", target),
                None => info!("  controls {} (not registered)", name),
            }
        }
    }
}
