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

//! Owns the set of routes this process has installed and mediates every
//! mutation of the kernel routing table through one [`RouteBackend`]. A
//! route, once installed, lives for the process lifetime; dynamic routes are
//! best-effort withdrawn on shutdown, static routes are left in place.

pub mod netlink;

use crate::config::{NextHop, RoutePolicy, StaticRoute};
use crate::device;
use async_trait::async_trait;
use ipnet::IpNet;
use log::*;
use std::{collections::HashMap, net::IpAddr};
use thiserror::Error;
use tokio::sync::Mutex;

pub use netlink::NetlinkBackend;

/// Errors from a single route mutation. Always logged and swallowed by
/// [`RouteController`]; a failed route install never fails the DNS query
/// that triggered it.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("failed to open a netlink socket: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Netlink(#[from] rtnetlink::Error),
    #[error("interface '{0}' not found")]
    NoSuchDevice(String),
    #[error("destination and next hop address families do not match")]
    FamilyMismatch,
}

/// A next hop resolved to a concrete value: device files have already been
/// read by the time this is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHopResolved {
    Gateway(IpAddr),
    Device(String),
}

/// Why a route was installed. Only `Dynamic` routes are withdrawn on
/// shutdown.
#[derive(Debug, Clone)]
pub enum Provenance {
    Static,
    Dynamic { zone: String, name: String },
}

struct OwnedRoute {
    next_hop: NextHopResolved,
    provenance: Provenance,
}

/// The kernel-facing half of route installation. Swapped out in tests for a
/// backend that just records calls.
#[async_trait]
pub trait RouteBackend: Send + Sync {
    async fn add_route(&self, prefix: IpNet, next_hop: &NextHopResolved) -> Result<(), RouteError>;
    async fn remove_route(&self, prefix: IpNet, next_hop: &NextHopResolved) -> Result<(), RouteError>;
}

/// The set of routes this process owns, plus the backend used to mutate the
/// kernel table. One instance per process, shared across every zone.
pub struct RouteController<B: RouteBackend> {
    backend: B,
    owned: Mutex<HashMap<IpNet, OwnedRoute>>,
    aggregation_prefix: Option<u8>,
}

impl<B: RouteBackend> RouteController<B> {
    pub fn new(backend: B, aggregation_prefix: Option<u8>) -> Self {
        Self {
            backend,
            owned: Mutex::new(HashMap::new()),
            aggregation_prefix,
        }
    }

    /// Install a configured static route. Called once at startup, before the
    /// listener starts serving queries.
    pub async fn add_static(&self, route: &StaticRoute) {
        let next_hop = match &route.next_hop {
            NextHop::Gateway(ip) => NextHopResolved::Gateway(*ip),
            NextHop::Device(path) => match device::read_device(path).await {
                Some(name) => NextHopResolved::Device(name),
                None => {
                    warn!(
                        "static route for {} names a device file that is empty or missing, skipping",
                        route.prefix
                    );
                    return;
                }
            },
        };
        self.install(route.prefix, next_hop, Provenance::Static).await;
    }

    /// Apply a zone's route policy to the addresses carried in an answer.
    /// A `None` policy and a missing device file are both silent no-ops: the
    /// query is still answered either way.
    pub async fn observe_answer(&self, zone_name: &str, query_name: &str, ips: &[IpAddr], policy: &RoutePolicy) {
        let next_hop = match policy {
            RoutePolicy::None => return,
            RoutePolicy::Gateway(ip) => NextHopResolved::Gateway(*ip),
            RoutePolicy::Device(path) => match device::read_device(path).await {
                Some(name) => NextHopResolved::Device(name),
                None => {
                    debug!(
                        "zone {} has no device to route {} through right now, skipping",
                        zone_name, query_name
                    );
                    return;
                }
            },
        };

        for ip in ips {
            let prefix = self.destination_for(*ip);
            self.install(
                prefix,
                next_hop.clone(),
                Provenance::Dynamic {
                    zone: zone_name.to_string(),
                    name: query_name.to_string(),
                },
            )
            .await;
        }
    }

    fn destination_for(&self, ip: IpAddr) -> IpNet {
        let host_bits = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = self.aggregation_prefix.unwrap_or(host_bits).min(host_bits);
        IpNet::new(ip, prefix_len)
            .map(|n| n.trunc())
            .unwrap_or_else(|_| IpNet::new(ip, host_bits).expect("host_bits is always a valid prefix length"))
    }

    async fn install(&self, prefix: IpNet, next_hop: NextHopResolved, provenance: Provenance) {
        {
            let owned = self.owned.lock().await;
            if let Some(existing) = owned.get(&prefix) {
                if existing.next_hop == next_hop {
                    return;
                }
                warn!(
                    "route {} is already owned via a different next hop, keeping the first installer's route",
                    prefix
                );
                return;
            }
        }

        match self.backend.add_route(prefix, &next_hop).await {
            Ok(()) => {
                info!("installed route {} via {:?}", prefix, next_hop);
                self.owned.lock().await.insert(prefix, OwnedRoute { next_hop, provenance });
            }
            Err(e) => {
                warn!("failed to install route {}: {} (query was still answered)", prefix, e);
            }
        }
    }

    /// Best-effort withdrawal of every dynamic route. Static routes are left
    /// in place. Failures are logged and otherwise ignored: this runs once,
    /// on the way out.
    pub async fn shutdown(&self) {
        let mut owned = self.owned.lock().await;
        for (prefix, route) in owned.iter() {
            if matches!(route.provenance, Provenance::Dynamic { .. }) {
                if let Err(e) = self.backend.remove_route(*prefix, &route.next_hop).await {
                    warn!("failed to withdraw route {} on shutdown: {}", prefix, e);
                }
            }
        }
        owned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingBackend {
        added: StdMutex<Vec<(IpNet, NextHopResolved)>>,
        removed: StdMutex<Vec<(IpNet, NextHopResolved)>>,
    }

    #[async_trait]
    impl RouteBackend for RecordingBackend {
        async fn add_route(&self, prefix: IpNet, next_hop: &NextHopResolved) -> Result<(), RouteError> {
            self.added.lock().unwrap().push((prefix, next_hop.clone()));
            Ok(())
        }

        async fn remove_route(&self, prefix: IpNet, next_hop: &NextHopResolved) -> Result<(), RouteError> {
            self.removed.lock().unwrap().push((prefix, next_hop.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn reinstalling_the_same_route_is_a_no_op() {
        let backend = RecordingBackend::default();
        let controller = RouteController::new(backend, None);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let policy = RoutePolicy::Gateway("172.28.0.1".parse().unwrap());
        controller.observe_answer("corp", "host.corp.", &[ip], &policy).await;
        controller.observe_answer("corp", "host.corp.", &[ip], &policy).await;
        assert_eq!(controller.backend.added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aggregation_prefix_truncates_the_destination() {
        let backend = RecordingBackend::default();
        let controller = RouteController::new(backend, Some(24));
        let ip: IpAddr = "10.0.0.42".parse().unwrap();
        let policy = RoutePolicy::Gateway("172.28.0.1".parse().unwrap());
        controller.observe_answer("corp", "host.corp.", &[ip], &policy).await;
        let added = controller.backend.added.lock().unwrap();
        assert_eq!(added[0].0, "10.0.0.0/24".parse::<IpNet>().unwrap());
    }

    #[tokio::test]
    async fn shutdown_withdraws_dynamic_but_not_static_routes() {
        let backend = RecordingBackend::default();
        let controller = RouteController::new(backend, None);
        controller
            .add_static(&StaticRoute {
                prefix: "192.0.2.0/24".parse().unwrap(),
                next_hop: NextHop::Gateway("172.28.0.1".parse().unwrap()),
            })
            .await;
        let policy = RoutePolicy::Gateway("172.28.0.1".parse().unwrap());
        controller
            .observe_answer("corp", "host.corp.", &["10.0.0.1".parse().unwrap()], &policy)
            .await;
        controller.shutdown().await;
        let removed = controller.backend.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "10.0.0.1/32".parse::<IpNet>().unwrap());
    }
}
