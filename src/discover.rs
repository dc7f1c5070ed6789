use crate::error::Result;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

pub const SSDP_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;
pub const SEARCH_TARGET: &str = "urn:Belkin:device:controllee:1";
pub const DISCOVERY_WINDOW_SECS: f32 = 3.0; //devices answer within MX seconds
pub const RECV_BUFFER_SIZE: usize = 2048;

pub struct Discover {
    pub name: String,
    pub window: Duration,
    pub target: SocketAddrV4,
    socket: UdpSocket,
}

impl Discover {
    fn open_socket(bind_addr: SocketAddrV4) -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_multicast_ttl_v4(2)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(bind_addr))?;
        Ok(socket.into())
    }

    //has to be called from within the runtime
    pub fn bind(port: u16, window: Duration) -> Result<Self> {
        let std_socket = Discover::open_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        let socket = UdpSocket::from_std(std_socket)?;
        info!(
            "discover: receiving UDP on port {}",
            socket.local_addr()?.port()
        );
        Ok(Self {
            name: "discover".into(),
            window,
            target: SocketAddrV4::new(SSDP_ADDRESS, SSDP_PORT),
            socket,
        })
    }

    pub fn search_request(&self) -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: {}\r\n\
             ST: {}\r\n\
             USER-AGENT: wemod/1.0\r\n\
             \r\n",
            self.target,
            self.window.as_secs().max(1),
            SEARCH_TARGET,
        )
    }

    async fn broadcast(&self) -> Result<()> {
        let msg = self.search_request();
        self.socket.send_to(msg.as_bytes(), self.target).await?;
        Ok(())
    }

    async fn receive(&self) -> Vec<SocketAddr> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut found = vec![];
        let mut seen = HashSet::new();
        let deadline = Instant::now() + self.window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    if e.kind() != ErrorKind::WouldBlock {
                        error!("{}: error while receiving response: {:?}", self.name, e);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                    }
                }
                Ok(Ok((len, from))) => {
                    let reply = String::from_utf8_lossy(&buf[..len]);
                    match parse_location(&reply) {
                        Some(addr) => {
                            if seen.insert(addr) {
                                debug!("{}: {} announced {}", self.name, from, addr);
                                found.push(addr);
                            }
                        }
                        None => {
                            trace!("{}: ignoring reply from {}", self.name, from);
                        }
                    }
                }
            }
        }
        found
    }

    pub async fn scan(&self) -> Result<Vec<SocketAddr>> {
        info!("🔍 {}: scanning for plugs ({:?})", self.name, self.window);
        self.broadcast().await?;
        let found = self.receive().await;
        info!("{}: {} plug(s) answered", self.name, found.len());
        Ok(found)
    }

    pub async fn readable(&self) -> Result<()> {
        self.socket.readable().await?;
        Ok(())
    }

    pub fn drain(&self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    info!(
                        "{}: unsolicited message from {}: {}",
                        self.name,
                        from,
                        String::from_utf8_lossy(&buf[..len]).trim_end()
                    );
                }
                Err(e) => {
                    if e.kind() != ErrorKind::WouldBlock {
                        error!("{}: receive error: {:?}", self.name, e);
                    }
                    break;
                }
            }
        }
    }
}

/// Pulls `host:port` out of the `LOCATION: http://host:port/...` header.
pub fn parse_location(reply: &str) -> Option<SocketAddr> {
    let line = reply
        .lines()
        .find(|l| l.get(..9).map_or(false, |p| p.eq_ignore_ascii_case("location:")))?;
    let url = line[9..].trim();
    let rest = url.strip_prefix("http://")?;
    let authority = rest.split(|c: char| c == '/' || c.is_whitespace()).next()?;
    let (host, port) = authority.split_once(':')?;
    let ip: Ipv4Addr = host.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some(SocketAddr::from((ip, port)))
}
