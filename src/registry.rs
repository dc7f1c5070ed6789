use crate::plug::{Client, Plug};
use futures::future::join_all;
use std::collections::HashSet;
use std::net::SocketAddr;

pub const MAX_MISSING_SCANS: u8 = 5; //consecutive absences before a plug is dropped

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Churn {
    pub added: Vec<SocketAddr>,
    pub missing: Vec<SocketAddr>,
    pub removed: Vec<SocketAddr>,
}

pub struct Registry {
    pub name: String,
    plugs: Vec<Plug>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            name: "registry".into(),
            plugs: vec![],
        }
    }

    pub fn plugs(&self) -> &[Plug] {
        &self.plugs
    }

    pub fn len(&self) -> usize {
        self.plugs.len()
    }

    pub fn find(&self, addr: SocketAddr) -> Option<&Plug> {
        self.plugs.iter().find(|p| p.addr() == addr)
    }

    pub fn find_mut(&mut self, addr: SocketAddr) -> Option<&mut Plug> {
        self.plugs.iter_mut().find(|p| p.addr() == addr)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Plug> {
        self.plugs.iter().find(|p| p.name.as_deref() == Some(name))
    }

    pub fn reconcile(&mut self, found: Vec<SocketAddr>) -> Churn {
        let mut churn = Churn::default();
        let found: Vec<SocketAddr> = {
            let mut seen = HashSet::new();
            found.into_iter().filter(|a| seen.insert(*a)).collect()
        };

        let name = &self.name;
        self.plugs.retain_mut(|plug| {
            if found.contains(&plug.addr()) {
                if plug.missing_count > 0 {
                    info!("{}: {} is back after {} scan(s)", name, plug, plug.missing_count);
                }
                plug.missing_count = 0;
                return true;
            }
            plug.missing_count += 1;
            if plug.missing_count >= MAX_MISSING_SCANS {
                warn!(
                    "{}: ❌ {} not seen in {} scans, de-registered",
                    name, plug, plug.missing_count
                );
                churn.removed.push(plug.addr());
                false
            } else {
                info!(
                    "{}: {} missing ({}/{})",
                    name, plug, plug.missing_count, MAX_MISSING_SCANS
                );
                churn.missing.push(plug.addr());
                true
            }
        });

        for addr in found {
            if self.find(addr).is_none() {
                info!("{}: 🔌 new plug at {}", self.name, addr);
                self.plugs.push(Plug::new(addr));
                churn.added.push(addr);
            }
        }
        churn
    }

    //without `refresh` only plugs that never answered are asked
    pub async fn resolve_names(&mut self, client: &Client, refresh: bool) {
        let pending: Vec<SocketAddr> = self
            .plugs
            .iter()
            .filter(|p| refresh || p.name.is_none())
            .map(|p| p.addr())
            .collect();

        let replies = join_all(pending.iter().map(|&addr| client.name(addr))).await;

        for (addr, reply) in pending.into_iter().zip(replies) {
            let plug = match self.plugs.iter_mut().find(|p| p.addr() == addr) {
                Some(p) => p,
                None => continue,
            };
            match reply {
                Ok(name) => {
                    if plug.name.as_deref() != Some(name.as_str()) {
                        info!("{}: {} is named {:?}", self.name, addr, name);
                    }
                    plug.name = Some(name);
                }
                Err(e) => match &plug.name {
                    Some(known) => {
                        warn!("{}: {}, keeping last known name {:?}", self.name, e, known);
                    }
                    None => {
                        warn!("{}: {}, plug stays unnamed", self.name, e);
                    }
                },
            }
        }
    }

    pub fn set_state(&mut self, addr: SocketAddr, on: bool) {
        if let Some(plug) = self.find_mut(addr) {
            plug.state = Some(on);
        }
    }

    pub fn display(&self) {
        info!("{}: {} plug(s) registered", self.name, self.len());
        for plug in &self.plugs {
            info!(
                "  {:<24} {:<22} state: {:<7} missing: {}",
                plug.display_name(),
                plug.addr().to_string(),
                match plug.state {
                    Some(true) => "on",
                    Some(false) => "off",
                    None => "unknown",
                },
                plug.missing_count
            );
        }
    }
}
