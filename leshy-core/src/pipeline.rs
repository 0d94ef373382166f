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

//! Wires the zone matcher, the response cache, the upstream pools and the
//! route controller into the per-query state machine: a query is matched to
//! a zone, answered from cache or forwarded, and — once a reply is ready to
//! go out — any addresses in the answer are handed to the route controller
//! in a detached task, so route installation never adds latency to the
//! reply the client is waiting on.

use crate::cache::{self, RespCache};
use crate::config::{Config, RoutePolicy, Zone};
use crate::route::{RouteBackend, RouteController};
use crate::upstream::UpstreamPool;
use crate::zone;
use bytes::{Bytes, BytesMut};
use domain::{
    base::{iana::Rcode, Message, MessageBuilder},
    rdata::AllRecordData,
};
use log::*;
use std::{net::IpAddr, num::NonZeroUsize, sync::Arc};

use crate::MAX_LEN;

/// The assembled query-handling pipeline for one running configuration.
pub struct Pipeline<B: RouteBackend> {
    zones: Vec<Zone>,
    default_zone: Zone,
    pools: Vec<UpstreamPool>,
    default_pool: UpstreamPool,
    cache: RespCache,
    routes: Arc<RouteController<B>>,
}

impl<B: RouteBackend + Send + Sync + 'static> Pipeline<B> {
    pub fn new(config: &Config, routes: Arc<RouteController<B>>) -> Self {
        let pools = config
            .zones
            .iter()
            .map(|z| UpstreamPool::new(z.upstreams.clone()))
            .collect();
        let default_pool = UpstreamPool::new(config.default.upstreams.clone());
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or_else(|| NonZeroUsize::new(1).unwrap());
        let cache = RespCache::new(cache_size, config.negative_ttl);

        Self {
            zones: config.zones.clone(),
            default_zone: config.default.clone(),
            pools,
            default_pool,
            cache,
            routes,
        }
    }

    /// Handle one client query end to end, returning the reply to send back.
    pub async fn handle(&self, query: &Message<Bytes>) -> Message<Bytes> {
        let id = query.header().id();

        let question = match query.first_question() {
            Some(q) => q,
            None => return error_reply(id, Rcode::FormErr),
        };
        let name = question.qname().to_string();
        let (zone, pool) = self.zone_for(&name);
        let key = RespCache::key_for(query);

        if let Some(key) = &key {
            if let Some(cached) = self.cache.lookup(key, id) {
                self.spawn_route_apply(zone, name, &cached);
                return cached;
            }
        }

        match pool.resolve(query).await {
            Ok(resp) => {
                if let Some(key) = key {
                    self.cache.insert(key, resp.clone());
                }
                self.spawn_route_apply(zone, name.clone(), &resp);
                match cache::rebuild(&resp, id, None) {
                    Ok(restamped) => restamped,
                    Err(e) => {
                        warn!("failed to restamp upstream response, answering SERVFAIL: {}", e);
                        error_reply(id, Rcode::ServFail)
                    }
                }
            }
            Err(e) => {
                info!("zone '{}' exhausted its upstream pool for '{}': {}", zone.name, name, e);
                error_reply(id, Rcode::ServFail)
            }
        }
    }

    fn zone_for(&self, name: &str) -> (&Zone, &UpstreamPool) {
        let matched = zone::match_zone(&self.zones, &self.default_zone, name);
        match self.zones.iter().position(|z| std::ptr::eq(z, matched)) {
            Some(i) => (&self.zones[i], &self.pools[i]),
            None => (&self.default_zone, &self.default_pool),
        }
    }

    /// Route installation never blocks the reply: it runs in a detached
    /// task spawned after the answer is already on its way out.
    fn spawn_route_apply(&self, zone: &Zone, name: String, response: &Message<Bytes>) {
        if matches!(zone.route, RoutePolicy::None) {
            return;
        }
        let ips = extract_ips(response);
        if ips.is_empty() {
            return;
        }
        let zone_name = zone.name.clone();
        let policy = zone.route.clone();
        let routes = self.routes.clone();
        tokio::spawn(async move {
            routes.observe_answer(&zone_name, &name, &ips, &policy).await;
        });
    }
}

fn extract_ips(msg: &Message<Bytes>) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    let answer = match msg.answer() {
        Ok(a) => a,
        Err(_) => return ips,
    };
    for item in answer {
        let record = match item.and_then(|r| r.into_record::<AllRecordData<_, _>>()) {
            Ok(Some(record)) => record,
            _ => continue,
        };
        match record.data() {
            AllRecordData::A(a) => ips.push(IpAddr::V4(a.addr())),
            AllRecordData::Aaaa(aaaa) => ips.push(IpAddr::V6(aaaa.addr())),
            _ => {}
        }
    }
    ips
}

fn error_reply(id: u16, rcode: Rcode) -> Message<Bytes> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
        .expect("a freshly allocated buffer always fits an empty message");
    builder.header_mut().set_id(id);
    builder.header_mut().set_qr(true);
    builder.header_mut().set_rcode(rcode);
    builder.additional().into_message()
}
