//! Pool of PLC links, one per endpoint.
//!
//! Every endpoint gets a slot guarded by a FIFO async mutex, so reads for the
//! same PLC run one at a time in arrival order while different PLCs proceed
//! in parallel. Links are opened lazily and dropped after failures that leave
//! them in an unknown state.

use crate::ads::{self, AdsConnector, AdsLink, Endpoint, PollFailure};
use crate::db::{DataType, PlcValue};

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Slot {
    link: Mutex<Option<Box<dyn AdsLink>>>,
    last_used: StdMutex<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self {
            link: Mutex::new(None),
            last_used: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// A successful read and how long the PLC took to answer.
#[derive(Debug, Clone)]
pub struct Reading {
    pub value: PlcValue,
    pub elapsed: Duration,
}

pub struct ConnectionPool {
    connector: Arc<dyn AdsConnector>,
    slots: StdMutex<HashMap<Endpoint, Arc<Slot>>>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn AdsConnector>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connector,
            slots: StdMutex::new(HashMap::new()),
            connect_timeout,
            read_timeout,
        }
    }

    fn slot(&self, endpoint: &Endpoint) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Read one symbol, opening the endpoint's link first if needed.
    pub async fn read(
        &self,
        endpoint: &Endpoint,
        symbol: &str,
        data_type: DataType,
    ) -> Result<Reading, PollFailure> {
        let slot = self.slot(endpoint);
        let mut guard = slot.link.lock().await;
        slot.touch();

        let mut link = match guard.take() {
            Some(link) => link,
            None => {
                let link = ads::open(self.connector.as_ref(), endpoint, self.connect_timeout).await?;
                tracing::info!("Connected to PLC {}", endpoint);
                link
            }
        };

        let started = Instant::now();
        let result = ads::read_symbol(link.as_mut(), symbol, data_type, self.read_timeout).await;
        let elapsed = started.elapsed();
        slot.touch();

        match result {
            Ok(value) => {
                *guard = Some(link);
                Ok(Reading { value, elapsed })
            }
            Err(failure) if failure.poisons_link() => {
                tracing::warn!("Dropping link to {} after {}", endpoint, failure);
                let _ = tokio::time::timeout(self.read_timeout, link.close()).await;
                Err(failure.into())
            }
            Err(failure) => {
                *guard = Some(link);
                Err(failure.into())
            }
        }
    }

    /// Close links unused for at least `idle`. Returns how many were closed.
    pub async fn close_idle(&self, idle: Duration) -> usize {
        let candidates: Vec<(Endpoint, Arc<Slot>)> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .filter(|(_, slot)| slot.idle_for() >= idle)
                .map(|(e, s)| (e.clone(), s.clone()))
                .collect()
        };

        let mut closed = 0;
        for (endpoint, slot) in candidates {
            // A read in progress holds the lock; leave that slot alone.
            let Ok(mut guard) = slot.link.try_lock() else {
                continue;
            };
            if let Some(mut link) = guard.take() {
                let _ = tokio::time::timeout(self.read_timeout, link.close()).await;
                tracing::info!("Closed idle link to {}", endpoint);
                closed += 1;
            }
        }

        // Forget empty slots no poll task is holding on to.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.idle_for() < idle
                || slot.link.try_lock().map_or(true, |link| link.is_some())
        });
        closed
    }

    /// Close every open link.
    pub async fn close_all(&self) {
        let slots: Vec<(Endpoint, Arc<Slot>)> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.drain().collect()
        };
        for (endpoint, slot) in slots {
            if let Some(mut link) = slot.link.lock().await.take() {
                let _ = tokio::time::timeout(self.read_timeout, link.close()).await;
                tracing::debug!("Closed link to {}", endpoint);
            }
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
