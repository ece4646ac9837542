//! AMS/TCP client for reading symbols by name.
//!
//! Only the commands needed for a read are implemented: read state (to verify
//! the route when opening), acquire a symbol handle, read by handle, release
//! handle. Frames are little-endian:
//!
//! - 6 bytes AMS/TCP header: 2 reserved, 4 length of the AMS packet
//! - 32 bytes AMS header: target net ID + port, source net ID + port,
//!   command, state flags, data length, error code, invoke ID
//! - command data

use super::{AdsConnector, AdsLink, AmsNetId, ConnectFailure, Endpoint, ReadFailure};
use crate::db::{DataType, PlcValue};

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// TCP port of the TwinCAT AMS router.
pub const AMS_TCP_PORT: u16 = 48898;

const AMS_HEADER_LEN: usize = 32;
const MAX_FRAME_LEN: usize = 1024 * 1024;

const CMD_READ: u16 = 2;
const CMD_WRITE: u16 = 3;
const CMD_READ_STATE: u16 = 4;
const CMD_READ_WRITE: u16 = 9;

const STATE_REQUEST: u16 = 0x0004;
const STATE_RESPONSE: u16 = 0x0001;

const IG_SYM_HNDBYNAME: u32 = 0xF003;
const IG_SYM_VALBYHND: u32 = 0xF005;
const IG_SYM_RELEASEHND: u32 = 0xF006;

const ADSERR_DEVICE_INVALIDSIZE: u32 = 0x0705;
const ADSERR_DEVICE_SYMBOLNOTFOUND: u32 = 0x0710;

/// Source ADS port used by every outgoing link.
const SOURCE_PORT: u16 = 32_905;

/// Opens AMS/TCP links.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    local_net_id: Option<AmsNetId>,
    source_port: u16,
}

impl TcpConnector {
    /// `local_net_id` overrides the source address; when `None` it is
    /// derived from the local IP of each connection.
    pub fn new(local_net_id: Option<AmsNetId>) -> Self {
        Self {
            local_net_id,
            source_port: SOURCE_PORT,
        }
    }
}

#[async_trait]
impl AdsConnector for TcpConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn AdsLink>, ConnectFailure> {
        // A host may carry an explicit router port.
        let addr = if endpoint.host.contains(':') {
            endpoint.host.clone()
        } else {
            format!("{}:{}", endpoint.host, AMS_TCP_PORT)
        };

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ConnectFailure::Unreachable(format!("{}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        let source = match self.local_net_id {
            Some(id) => id,
            None => match stream.local_addr().map(|a| a.ip()) {
                Ok(IpAddr::V4(ip)) => AmsNetId::from_ipv4(ip),
                Ok(IpAddr::V6(_)) | Err(_) => {
                    return Err(ConnectFailure::InvalidEndpoint(
                        "cannot derive a local AMS net ID; configure one".to_string(),
                    ))
                }
            },
        };

        let mut link = TcpLink {
            stream,
            target: endpoint.net_id,
            target_port: endpoint.port,
            source,
            source_port: self.source_port,
            invoke_id: 0,
            handles: HashMap::new(),
        };

        // A missing route shows up as an ADS error or the router hanging up.
        match link.request(CMD_READ_STATE, &[]).await {
            Ok(data) => {
                let result = read_u32(&data, 0).unwrap_or(0);
                if result != 0 {
                    return Err(ConnectFailure::AuthRejected(format!(
                        "{} answered read state with ADS error {:#06x}",
                        endpoint, result
                    )));
                }
            }
            Err(RequestError::Ads(code)) => {
                return Err(ConnectFailure::AuthRejected(format!(
                    "{} rejected with ADS error {:#06x}",
                    endpoint, code
                )));
            }
            Err(RequestError::Io(e)) => {
                return Err(ConnectFailure::AuthRejected(format!(
                    "{} closed the connection ({}); is a route configured?",
                    endpoint, e
                )));
            }
            Err(RequestError::Protocol(msg)) => {
                return Err(ConnectFailure::Unreachable(format!("{}: {}", endpoint, msg)));
            }
        }

        tracing::debug!("Opened ADS link to {} as {}", endpoint, source);
        Ok(Box::new(link))
    }
}

#[derive(Debug)]
enum RequestError {
    Io(std::io::Error),
    Ads(u32),
    Protocol(String),
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        RequestError::Io(e)
    }
}

/// One AMS/TCP connection with a cache of symbol handles.
pub struct TcpLink {
    stream: TcpStream,
    target: AmsNetId,
    target_port: u16,
    source: AmsNetId,
    source_port: u16,
    invoke_id: u32,
    handles: HashMap<String, u32>,
}

impl TcpLink {
    fn frame(&self, command: u16, invoke_id: u32, data: &[u8]) -> Vec<u8> {
        let ams_len = AMS_HEADER_LEN + data.len();
        let mut buf = Vec::with_capacity(6 + ams_len);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&(ams_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.target.0);
        buf.extend_from_slice(&self.target_port.to_le_bytes());
        buf.extend_from_slice(&self.source.0);
        buf.extend_from_slice(&self.source_port.to_le_bytes());
        buf.extend_from_slice(&command.to_le_bytes());
        buf.extend_from_slice(&STATE_REQUEST.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&invoke_id.to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    /// Send one request and wait for its response. Returns the command data.
    async fn request(&mut self, command: u16, data: &[u8]) -> Result<Vec<u8>, RequestError> {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        let invoke_id = self.invoke_id;
        let frame = self.frame(command, invoke_id, data);
        self.stream.write_all(&frame).await?;

        let mut tcp_header = [0u8; 6];
        self.stream.read_exact(&mut tcp_header).await?;
        let len = u32::from_le_bytes([tcp_header[2], tcp_header[3], tcp_header[4], tcp_header[5]]) as usize;
        if !(AMS_HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(RequestError::Protocol(format!("bad AMS packet length {}", len)));
        }

        let mut packet = vec![0u8; len];
        self.stream.read_exact(&mut packet).await?;

        let resp_command = u16::from_le_bytes([packet[16], packet[17]]);
        let state_flags = u16::from_le_bytes([packet[18], packet[19]]);
        let error_code = read_u32(&packet, 24).unwrap_or(0);
        let resp_invoke = read_u32(&packet, 28).unwrap_or(0);

        if resp_invoke != invoke_id || resp_command != command || state_flags & STATE_RESPONSE == 0 {
            return Err(RequestError::Protocol(format!(
                "unexpected response (command {}, invoke {})",
                resp_command, resp_invoke
            )));
        }
        if error_code != 0 {
            return Err(RequestError::Ads(error_code));
        }

        packet.drain(..AMS_HEADER_LEN);
        Ok(packet)
    }

    async fn acquire_handle(&mut self, symbol: &str) -> Result<u32, ReadFailure> {
        if let Some(handle) = self.handles.get(symbol) {
            return Ok(*handle);
        }

        let name = symbol.as_bytes();
        let mut data = Vec::with_capacity(16 + name.len());
        data.extend_from_slice(&IG_SYM_HNDBYNAME.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&(name.len() as u32).to_le_bytes());
        data.extend_from_slice(name);

        let resp = self.request(CMD_READ_WRITE, &data).await.map_err(|e| map_request_error(e, symbol))?;
        check_result(&resp, symbol)?;
        let handle = read_u32(&resp, 8).ok_or_else(|| {
            ReadFailure::ConnectionLost(format!("short handle response for {}", symbol))
        })?;

        self.handles.insert(symbol.to_string(), handle);
        Ok(handle)
    }

    async fn release_handle(&mut self, handle: u32) {
        let mut data = Vec::with_capacity(16);
        data.extend_from_slice(&IG_SYM_RELEASEHND.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&handle.to_le_bytes());
        if let Err(e) = self.request(CMD_WRITE, &data).await {
            tracing::debug!("Failed to release ADS handle {}: {:?}", handle, e);
        }
    }
}

#[async_trait]
impl AdsLink for TcpLink {
    async fn read_symbol(&mut self, symbol: &str, data_type: DataType) -> Result<PlcValue, ReadFailure> {
        let handle = self.acquire_handle(symbol).await?;

        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&IG_SYM_VALBYHND.to_le_bytes());
        data.extend_from_slice(&handle.to_le_bytes());
        data.extend_from_slice(&(data_type.byte_size() as u32).to_le_bytes());

        let resp = match self.request(CMD_READ, &data).await {
            Ok(resp) => resp,
            Err(e) => {
                // Handles do not survive an online change.
                self.handles.remove(symbol);
                return Err(map_request_error(e, symbol));
            }
        };
        if let Err(e) = check_result(&resp, symbol) {
            self.handles.remove(symbol);
            return Err(e);
        }

        let len = read_u32(&resp, 4).unwrap_or(0) as usize;
        let payload = resp.get(8..8 + len).ok_or_else(|| {
            ReadFailure::ConnectionLost(format!("truncated read response for {}", symbol))
        })?;
        super::decode_value(payload, data_type)
    }

    async fn close(&mut self) {
        let handles: Vec<u32> = self.handles.drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.release_handle(handle).await;
        }
        let _ = self.stream.shutdown().await;
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Check the ADS result code that leads every command response.
fn check_result(resp: &[u8], symbol: &str) -> Result<(), ReadFailure> {
    match read_u32(resp, 0) {
        Some(0) => Ok(()),
        Some(code) => Err(map_ads_error(code, symbol)),
        None => Err(ReadFailure::ConnectionLost(format!("empty response for {}", symbol))),
    }
}

fn map_request_error(err: RequestError, symbol: &str) -> ReadFailure {
    match err {
        RequestError::Io(e) => ReadFailure::ConnectionLost(e.to_string()),
        RequestError::Protocol(msg) => ReadFailure::ConnectionLost(msg),
        RequestError::Ads(code) => map_ads_error(code, symbol),
    }
}

fn map_ads_error(code: u32, symbol: &str) -> ReadFailure {
    match code {
        ADSERR_DEVICE_SYMBOLNOTFOUND => ReadFailure::SymbolNotFound(symbol.to_string()),
        ADSERR_DEVICE_INVALIDSIZE => {
            ReadFailure::TypeMismatch(format!("PLC rejected the read size for {}", symbol))
        }
        // Routing errors, device errors and stale handles: reopen the link.
        other => ReadFailure::ConnectionLost(format!("ADS error {:#06x} reading {}", other, symbol)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    /// Minimal PLC that knows one symbol per data type.
    async fn fake_plc(listener: TcpListener, route_ok: bool) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let symbols: HashMap<&str, (u32, Vec<u8>)> = HashMap::from([
            ("MAIN.bRun", (1, vec![1u8])),
            ("MAIN.rTemp", (2, 23.5f32.to_le_bytes().to_vec())),
        ]);

        loop {
            let mut tcp_header = [0u8; 6];
            if sock.read_exact(&mut tcp_header).await.is_err() {
                return;
            }
            let len = u32::from_le_bytes([tcp_header[2], tcp_header[3], tcp_header[4], tcp_header[5]]) as usize;
            let mut packet = vec![0u8; len];
            sock.read_exact(&mut packet).await.unwrap();

            let command = u16::from_le_bytes([packet[16], packet[17]]);
            let data = &packet[AMS_HEADER_LEN..];
            let mut error_code = 0u32;
            let mut body = Vec::new();

            match command {
                CMD_READ_STATE => {
                    if !route_ok {
                        error_code = 0x0007;
                    } else {
                        body.extend_from_slice(&0u32.to_le_bytes());
                        body.extend_from_slice(&5u16.to_le_bytes());
                        body.extend_from_slice(&0u16.to_le_bytes());
                    }
                }
                CMD_READ_WRITE => {
                    let name = std::str::from_utf8(&data[16..]).unwrap();
                    match symbols.get(name) {
                        Some((handle, _)) => {
                            body.extend_from_slice(&0u32.to_le_bytes());
                            body.extend_from_slice(&4u32.to_le_bytes());
                            body.extend_from_slice(&handle.to_le_bytes());
                        }
                        None => {
                            body.extend_from_slice(&ADSERR_DEVICE_SYMBOLNOTFOUND.to_le_bytes());
                            body.extend_from_slice(&0u32.to_le_bytes());
                        }
                    }
                }
                CMD_READ => {
                    let handle = read_u32(data, 4).unwrap();
                    let (_, value) = symbols.values().find(|(h, _)| *h == handle).unwrap();
                    body.extend_from_slice(&0u32.to_le_bytes());
                    body.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    body.extend_from_slice(value);
                }
                CMD_WRITE => body.extend_from_slice(&0u32.to_le_bytes()),
                _ => unreachable!(),
            }

            let mut resp = Vec::new();
            resp.extend_from_slice(&[0, 0]);
            resp.extend_from_slice(&((AMS_HEADER_LEN + body.len()) as u32).to_le_bytes());
            // Swap target and source.
            resp.extend_from_slice(&packet[8..16]);
            resp.extend_from_slice(&packet[0..8]);
            resp.extend_from_slice(&command.to_le_bytes());
            resp.extend_from_slice(&(STATE_RESPONSE | STATE_REQUEST).to_le_bytes());
            resp.extend_from_slice(&(body.len() as u32).to_le_bytes());
            resp.extend_from_slice(&error_code.to_le_bytes());
            resp.extend_from_slice(&packet[28..32]);
            resp.extend_from_slice(&body);
            sock.write_all(&resp).await.unwrap();
        }
    }

    async fn start(route_ok: bool) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_plc(listener, route_ok));
        Endpoint::new(&addr.to_string(), "127.0.0.1.1.1", 851).unwrap()
    }

    #[tokio::test]
    async fn test_read_by_name() {
        let endpoint = start(true).await;
        let connector = TcpConnector::new(None);
        let mut link = assert_ok!(connector.open(&endpoint).await);

        let run = assert_ok!(link.read_symbol("MAIN.bRun", DataType::Bool).await);
        assert_eq!(run, PlcValue::Bool(true));
        let temp = link.read_symbol("MAIN.rTemp", DataType::Real).await.unwrap();
        assert_eq!(temp, PlcValue::Real(23.5));
        // Second read goes through the cached handle.
        let temp = link.read_symbol("MAIN.rTemp", DataType::Real).await.unwrap();
        assert_eq!(temp, PlcValue::Real(23.5));

        link.close().await;
    }

    #[tokio::test]
    async fn test_unknown_symbol_and_type_mismatch() {
        let endpoint = start(true).await;
        let connector = TcpConnector::new(None);
        let mut link = connector.open(&endpoint).await.unwrap();

        let missing = link.read_symbol("MAIN.nope", DataType::Bool).await;
        assert_eq!(missing, Err(ReadFailure::SymbolNotFound("MAIN.nope".to_string())));

        let mismatch = assert_err!(link.read_symbol("MAIN.bRun", DataType::Real).await);
        assert!(matches!(mismatch, ReadFailure::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn test_missing_route_is_rejected() {
        let endpoint = start(false).await;
        let connector = TcpConnector::new(Some("10.1.1.1.1.1".parse().unwrap()));
        let result = connector.open(&endpoint).await;
        assert!(matches!(result, Err(ConnectFailure::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint = Endpoint::new(&addr.to_string(), "127.0.0.1.1.1", 851).unwrap();
        let result = TcpConnector::new(None).open(&endpoint).await;
        assert!(matches!(result, Err(ConnectFailure::Unreachable(_))));
    }
}
