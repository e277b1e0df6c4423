//! The pairing string shown on the sender (as text or QR) and accepted by
//! receivers: `austream://<ipv4>:<port>?pin=<6-digit>&name=<hostname>`.

use crate::DEFAULT_AUDIO_PORT;
use anyhow::{anyhow, bail, Context, Result};
use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use url::Url;

pub const SCHEME: &str = "austream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub host: Ipv4Addr,
    pub port: u16,
    pub pin: Option<String>,
    pub name: Option<String>,
}

impl Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(pin) = &self.pin {
            query.append_pair("pin", pin);
        }
        if let Some(name) = &self.name {
            query.append_pair("name", name);
        }
        let query = query.finish();

        write!(f, "{}://{}:{}", SCHEME, self.host, self.port)?;
        if !query.is_empty() {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl FromStr for Pairing {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Pairing> {
        let url = Url::parse(s).context("invalid pairing string")?;
        if url.scheme() != SCHEME {
            bail!("pairing string must use the {}:// scheme", SCHEME);
        }

        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("pairing string is missing a host"))?;
        let host: Ipv4Addr = host
            .parse()
            .context("pairing host must be an IPv4 address")?;
        let port = url.port().unwrap_or(DEFAULT_AUDIO_PORT);

        let mut pin = None;
        let mut name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "pin" => pin = Some(value.into_owned()),
                "name" => name = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(pin) = &pin {
            if pin.len() != 6 || !pin.chars().all(|c| c.is_ascii_digit()) {
                bail!("pairing PIN must be six decimal digits");
            }
        }

        Ok(Pairing {
            host,
            port,
            pin,
            name,
        })
    }
}

/// Best-effort local IPv4 for the pairing string when the session is bound
/// to the wildcard address. Opens no traffic; the connect only selects a
/// route.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
