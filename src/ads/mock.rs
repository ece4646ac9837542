//! Scripted links for exercising the poller without a PLC.

use super::{AdsConnector, AdsLink, ConnectFailure, Endpoint, ReadFailure};
use crate::db::{DataType, PlcValue};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Script {
    /// Queued results per symbol; the last one repeats.
    results: HashMap<String, VecDeque<Result<PlcValue, ReadFailure>>>,
    offline_hosts: HashSet<String>,
    read_delay: Duration,
    opens: usize,
    reads: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results for a symbol, replacing anything queued before.
    pub fn script(&self, symbol: &str, results: Vec<Result<PlcValue, ReadFailure>>) {
        let mut s = self.script.lock().unwrap();
        s.results.insert(symbol.to_string(), results.into());
    }

    pub fn set_offline(&self, host: &str, offline: bool) {
        let mut s = self.script.lock().unwrap();
        if offline {
            s.offline_hosts.insert(host.to_string());
        } else {
            s.offline_hosts.remove(host);
        }
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.script.lock().unwrap().read_delay = delay;
    }

    pub fn opens(&self) -> usize {
        self.script.lock().unwrap().opens
    }

    pub fn reads(&self, symbol: &str) -> usize {
        self.script.lock().unwrap().reads.get(symbol).copied().unwrap_or(0)
    }

    pub fn max_concurrent_reads(&self, host: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .max_in_flight
            .get(host)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl AdsConnector for ScriptedConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn AdsLink>, ConnectFailure> {
        let mut s = self.script.lock().unwrap();
        if s.offline_hosts.contains(&endpoint.host) {
            return Err(ConnectFailure::Unreachable(endpoint.host.clone()));
        }
        s.opens += 1;
        Ok(Box::new(ScriptedLink {
            host: endpoint.host.clone(),
            script: self.script.clone(),
        }))
    }
}

struct ScriptedLink {
    host: String,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl AdsLink for ScriptedLink {
    async fn read_symbol(&mut self, symbol: &str, _data_type: DataType) -> Result<PlcValue, ReadFailure> {
        let delay = {
            let mut s = self.script.lock().unwrap();
            let n = {
                let n = s.in_flight.entry(self.host.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let max = s.max_in_flight.entry(self.host.clone()).or_insert(0);
            *max = (*max).max(n);
            s.read_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut s = self.script.lock().unwrap();
        if let Some(n) = s.in_flight.get_mut(&self.host) {
            *n -= 1;
        }
        *s.reads.entry(symbol.to_string()).or_insert(0) += 1;

        if s.offline_hosts.contains(&self.host) {
            return Err(ReadFailure::ConnectionLost(self.host.clone()));
        }

        match s.results.get_mut(symbol) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| {
                Err(ReadFailure::SymbolNotFound(symbol.to_string()))
            }),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ReadFailure::SymbolNotFound(symbol.to_string()))),
            None => Err(ReadFailure::SymbolNotFound(symbol.to_string())),
        }
    }

    async fn close(&mut self) {}
}
