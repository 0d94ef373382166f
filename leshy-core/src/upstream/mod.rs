// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! An ordered pool of upstream resolvers, tried head-to-tail per query with
//! advisory health tracking so a known-dead upstream doesn't pay its
//! per-attempt timeout on every subsequent query.

mod transport;

use bytes::Bytes;
use domain::base::{iana::Rcode, Message};
use log::*;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::time::timeout;

pub use transport::TransportError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const COLD_THRESHOLD: u32 = 3;
const COLD_WINDOW: Duration = Duration::from_secs(60);

/// Errors from exhausting an entire upstream pool. Always recovered by
/// synthesizing SERVFAIL; never fatal.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("all upstreams in the pool failed")]
    AllFailed,
}

/// Advisory failure tracking for one upstream. Not persisted.
#[derive(Default)]
struct UpstreamHealth {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl UpstreamHealth {
    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure = Some(Instant::now());
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
    }

    fn is_cold(&self) -> bool {
        match self.last_failure {
            Some(t) => self.consecutive_failures >= COLD_THRESHOLD && t.elapsed() < COLD_WINDOW,
            None => false,
        }
    }
}

/// An ordered list of upstream resolvers.
pub struct UpstreamPool {
    upstreams: Vec<SocketAddr>,
    health: Mutex<HashMap<SocketAddr, UpstreamHealth>>,
    timeout: Duration,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<SocketAddr>) -> Self {
        Self {
            upstreams,
            health: Mutex::new(HashMap::new()),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_cold(&self, addr: &SocketAddr) -> bool {
        self.health
            .lock()
            .unwrap()
            .get(addr)
            .map(UpstreamHealth::is_cold)
            .unwrap_or(false)
    }

    fn record_failure(&self, addr: &SocketAddr) {
        self.health.lock().unwrap().entry(*addr).or_default().record_failure();
    }

    fn record_success(&self, addr: &SocketAddr) {
        self.health.lock().unwrap().entry(*addr).or_default().record_success();
    }

    /// Warm upstreams first (configured order), cold upstreams last, so a
    /// known-dead upstream is only tried once everything else has failed.
    fn ordered_attempts(&self) -> Vec<SocketAddr> {
        let (warm, cold): (Vec<_>, Vec<_>) =
            self.upstreams.iter().cloned().partition(|a| !self.is_cold(a));
        warm.into_iter().chain(cold).collect()
    }

    /// Resolve `query` by trying each upstream in turn until one returns a
    /// well-formed NOERROR/NXDOMAIN response, or the pool is exhausted.
    pub async fn resolve(&self, query: &Message<Bytes>) -> Result<Message<Bytes>, UpstreamError> {
        for addr in self.ordered_attempts() {
            match timeout(self.timeout, transport::query(addr, query)).await {
                Ok(Ok(resp)) => {
                    let rcode = resp.header().rcode();
                    if matches!(rcode, Rcode::NoError | Rcode::NXDomain) {
                        self.record_success(&addr);
                        return Ok(resp);
                    }
                    info!("upstream {} returned {}, trying next upstream", addr, rcode);
                    self.record_failure(&addr);
                }
                Ok(Err(e)) => {
                    warn!("upstream {} transport error: {}", addr, e);
                    self.record_failure(&addr);
                }
                Err(_) => {
                    warn!("upstream {} timed out after {:?}", addr, self.timeout);
                    self.record_failure(&addr);
                }
            }
        }
        Err(UpstreamError::AllFailed)
    }
}
