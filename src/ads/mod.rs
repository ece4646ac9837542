//! ADS connection handling.
//!
//! One logical link per PLC endpoint. A link performs single symbol reads and
//! reports failures through a small taxonomy; retry policy lives with the
//! scheduler, never here.

mod netid;
mod tcp;

#[cfg(test)]
pub mod mock;

pub use netid::*;
pub use tcp::*;

use crate::db::{DataType, PlcValue};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure to establish a link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("connection rejected by target: {0}")]
    AuthRejected(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Failure of a single symbol read on an open link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl ReadFailure {
    /// Whether the link that produced this failure must be discarded.
    pub fn poisons_link(&self) -> bool {
        matches!(self, ReadFailure::Timeout(_) | ReadFailure::ConnectionLost(_))
    }
}

/// Anything that can make a poll fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    #[error(transparent)]
    Connect(#[from] ConnectFailure),
    #[error(transparent)]
    Read(#[from] ReadFailure),
}

impl PollFailure {
    /// Whether the failure says something about reachability of the PLC.
    /// A missing symbol or wrong type is a tag problem, not a site problem.
    pub fn is_comms(&self) -> bool {
        match self {
            PollFailure::Connect(_) => true,
            PollFailure::Read(r) => r.poisons_link(),
        }
    }

    /// Short machine-readable name, used in logs and alert metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            PollFailure::Connect(ConnectFailure::Unreachable(_)) => "unreachable",
            PollFailure::Connect(ConnectFailure::AuthRejected(_)) => "auth_rejected",
            PollFailure::Connect(ConnectFailure::InvalidEndpoint(_)) => "invalid_endpoint",
            PollFailure::Read(ReadFailure::Timeout(_)) => "timeout",
            PollFailure::Read(ReadFailure::SymbolNotFound(_)) => "symbol_not_found",
            PollFailure::Read(ReadFailure::TypeMismatch(_)) => "type_mismatch",
            PollFailure::Read(ReadFailure::ConnectionLost(_)) => "connection_lost",
        }
    }
}

/// A PLC endpoint: host running the AMS router, AMS net ID and ADS port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub net_id: AmsNetId,
    pub port: u16,
}

impl Endpoint {
    /// Build and validate an endpoint.
    pub fn new(host: &str, net_id: &str, port: u16) -> Result<Self, ConnectFailure> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ConnectFailure::InvalidEndpoint("host is empty".to_string()));
        }
        if port == 0 {
            return Err(ConnectFailure::InvalidEndpoint("ADS port is zero".to_string()));
        }
        let net_id = net_id
            .parse::<AmsNetId>()
            .map_err(ConnectFailure::InvalidEndpoint)?;
        Ok(Self {
            host: host.to_string(),
            net_id,
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.net_id, self.port)
    }
}

/// An open link to one PLC. Never read concurrently.
#[async_trait]
pub trait AdsLink: Send {
    /// Read one symbol by name. Implementations may block; callers bound
    /// the wait with [`read_symbol`].
    async fn read_symbol(&mut self, symbol: &str, data_type: DataType) -> Result<PlcValue, ReadFailure>;

    /// Release resources held on the PLC and close the link.
    async fn close(&mut self);
}

/// Opens links to endpoints.
#[async_trait]
pub trait AdsConnector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn AdsLink>, ConnectFailure>;
}

/// Open a link, giving up after `timeout`.
pub async fn open(
    connector: &dyn AdsConnector,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<Box<dyn AdsLink>, ConnectFailure> {
    match tokio::time::timeout(timeout, connector.open(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectFailure::Unreachable(format!(
            "connect to {} timed out after {:?}",
            endpoint, timeout
        ))),
    }
}

/// Read a symbol, never waiting longer than `timeout`.
pub async fn read_symbol(
    link: &mut dyn AdsLink,
    symbol: &str,
    data_type: DataType,
    timeout: Duration,
) -> Result<PlcValue, ReadFailure> {
    if symbol.trim().is_empty() {
        return Err(ReadFailure::SymbolNotFound("empty symbol name".to_string()));
    }
    match tokio::time::timeout(timeout, link.read_symbol(symbol, data_type)).await {
        Ok(result) => result,
        Err(_) => Err(ReadFailure::Timeout(timeout)),
    }
}

/// Decode raw little-endian PLC memory as the declared type.
pub fn decode_value(data: &[u8], data_type: DataType) -> Result<PlcValue, ReadFailure> {
    let expected = data_type.byte_size();
    let fixed = data_type != DataType::String;
    if (fixed && data.len() != expected) || data.is_empty() {
        return Err(ReadFailure::TypeMismatch(format!(
            "{} needs {} bytes, got {}",
            data_type,
            expected,
            data.len()
        )));
    }

    let value = match data_type {
        DataType::Bool => PlcValue::Bool(data[0] != 0),
        DataType::Int => PlcValue::Int(i64::from(i16::from_le_bytes([data[0], data[1]]))),
        DataType::Dint => PlcValue::Int(i64::from(i32::from_le_bytes([
            data[0], data[1], data[2], data[3],
        ]))),
        DataType::Real => PlcValue::Real(f64::from(f32::from_le_bytes([
            data[0], data[1], data[2], data[3],
        ]))),
        DataType::Lreal => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(data);
            PlcValue::Real(f64::from_le_bytes(buf))
        }
        DataType::String => {
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            PlcValue::Text(String::from_utf8_lossy(&data[..end]).into_owned())
        }
    };
    Ok(value)
}
