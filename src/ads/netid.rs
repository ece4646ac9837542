//! AMS net ID parsing.

use regex::Regex;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::OnceLock;

static NET_ID_RE: OnceLock<Regex> = OnceLock::new();

fn net_id_regex() -> &'static Regex {
    NET_ID_RE.get_or_init(|| {
        Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$")
            .expect("static regex is valid")
    })
}

/// Six-octet TwinCAT address, written `a.b.c.d.e.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AmsNetId(pub [u8; 6]);

impl AmsNetId {
    /// The net ID TwinCAT assigns to a host by default: its IPv4 address plus `.1.1`.
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        AmsNetId([a, b, c, d, 1, 1])
    }
}

impl FromStr for AmsNetId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = net_id_regex()
            .captures(s.trim())
            .ok_or_else(|| format!("malformed AMS net ID: {:?}", s))?;

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = caps[i + 1]
                .parse()
                .map_err(|_| format!("AMS net ID octet out of range in {:?}", s))?;
        }
        Ok(AmsNetId(octets))
    }
}

impl fmt::Display for AmsNetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}
