use crate::error::{Error, Result};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const CONTROL_TIMEOUT_SECS: f32 = 5.0; //default connect+exchange limit per request
pub const CONTROL_PATH: &str = "/upnp/control/basicevent1";
pub const SERVICE_URN: &str = "urn:Belkin:service:basicevent:1";
pub const STATE_ON: &str = "1";
pub const STATE_OFF: &str = "0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plug {
    addr: SocketAddr,
    pub name: Option<String>,
    pub state: Option<bool>,
    pub missing_count: u8,
}

impl Plug {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            name: None,
            state: None,
            missing_count: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }
}

impl fmt::Display for Plug {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]", self.display_name(), self.addr)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    GetFriendlyName,
    SetFriendlyName(String),
    GetBinaryState,
    SetBinaryState(bool),
}

impl Request {
    pub fn service(&self) -> &'static str {
        match self {
            Request::GetFriendlyName => "GetFriendlyName",
            Request::SetFriendlyName(_) => "SetFriendlyName",
            Request::GetBinaryState => "GetBinaryState",
            Request::SetBinaryState(_) => "SetBinaryState",
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            Request::GetFriendlyName | Request::SetFriendlyName(_) => "FriendlyName",
            Request::GetBinaryState | Request::SetBinaryState(_) => "BinaryState",
        }
    }

    fn param(&self) -> String {
        let value = match self {
            Request::SetFriendlyName(name) => name.as_str(),
            Request::SetBinaryState(true) => STATE_ON,
            Request::SetBinaryState(false) => STATE_OFF,
            _ => return String::new(),
        };
        format!("<{0}>{1}</{0}>", self.field(), value)
    }

    fn envelope(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{service} xmlns:u=\"{urn}\">{param}</u:{service}></s:Body>\
             </s:Envelope>\r\n",
            service = self.service(),
            urn = SERVICE_URN,
            param = self.param(),
        )
    }

    pub fn to_http(&self, peer: SocketAddr) -> String {
        let body = self.envelope();
        format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {peer}\r\n\
             User-Agent: wemod/1.0\r\n\
             Content-Type: text/xml; charset=\"utf-8\"\r\n\
             Content-Length: {len}\r\n\
             Accept: application/xml\r\n\
             SOAPAction: \"{urn}#{service}\"\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            path = CONTROL_PATH,
            peer = peer,
            len = body.len(),
            urn = SERVICE_URN,
            service = self.service(),
            body = body,
        )
    }
}

/// Returns the text between `<field>` and the next closing tag.
pub fn extract_field(response: &str, field: &'static str) -> Result<String> {
    let open = format!("<{}>", field);
    let start = match response.find(&open) {
        Some(pos) => pos + open.len(),
        None => return Err(Error::ProtocolParse(field)),
    };
    match response[start..].find("</") {
        Some(len) => Ok(response[start..start + len].to_string()),
        None => Err(Error::ProtocolParse(field)),
    }
}

#[derive(Clone, Debug)]
pub struct Client {
    pub timeout: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs_f32(CONTROL_TIMEOUT_SECS),
        }
    }
}

impl Client {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(peer: SocketAddr, request: &Request) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(peer).await?;
        stream.write_all(request.to_http(peer).as_bytes()).await?;

        let mut response = vec![];
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    pub async fn invoke(&self, peer: SocketAddr, request: Request) -> Result<String> {
        let action = request.service();
        trace!("{}: sending {}", peer, action);

        let response = match timeout(self.timeout, Client::exchange(peer, &request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(Error::ControlFailed {
                    peer,
                    action,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::ControlFailed {
                    peer,
                    action,
                    reason: format!("no reply within {:?}", self.timeout),
                })
            }
        };

        extract_field(&response, request.field()).map_err(|e| Error::ControlFailed {
            peer,
            action,
            reason: e.to_string(),
        })
    }

    pub async fn name(&self, peer: SocketAddr) -> Result<String> {
        let name = self.invoke(peer, Request::GetFriendlyName).await?;
        if name.is_empty() {
            return Err(Error::ControlFailed {
                peer,
                action: "GetFriendlyName",
                reason: "empty name".into(),
            });
        }
        Ok(name)
    }

    pub async fn set_name(&self, peer: SocketAddr, name: &str) -> Result<String> {
        self.invoke(peer, Request::SetFriendlyName(name.to_string()))
            .await
    }

    pub async fn state(&self, peer: SocketAddr) -> Result<bool> {
        Ok(self.invoke(peer, Request::GetBinaryState).await? == STATE_ON)
    }

    async fn set_state(&self, peer: SocketAddr, on: bool) -> Result<bool> {
        if self.state(peer).await? == on {
            debug!("{}: already {}", peer, if on { "on" } else { "off" });
            return Ok(on);
        }
        let reply = self.invoke(peer, Request::SetBinaryState(on)).await?;
        //some firmwares answer "Error" when the state did not change
        Ok(match reply.as_str() {
            STATE_ON => true,
            STATE_OFF => false,
            _ => self.state(peer).await?,
        })
    }

    pub async fn on(&self, peer: SocketAddr) -> Result<bool> {
        self.set_state(peer, true).await
    }

    pub async fn off(&self, peer: SocketAddr) -> Result<bool> {
        self.set_state(peer, false).await
    }

    pub async fn toggle(&self, peer: SocketAddr) -> Result<bool> {
        let on = self.state(peer).await?;
        self.set_state(peer, !on).await
    }
}
