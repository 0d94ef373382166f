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

//! Typed configuration: the raw `serde` shape parsed off disk, and the
//! compiled form the rest of the library runs against. Compiling precompiles
//! every [`crate::pattern::Pattern`] and parses every address exactly once,
//! so the query path never touches string parsing.

use crate::pattern::Pattern;
use ipnet::IpNet;
use serde::Deserialize;
use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;

/// Errors that can occur while compiling a [`RawConfig`] into a [`Config`].
/// These are the only errors that terminate the process at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file did not parse as YAML into the expected shape.
    #[error("malformed configuration: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// An `ip:port` upstream string did not parse.
    #[error("invalid upstream address '{0}': {1}")]
    InvalidUpstream(String, AddrParseError),

    /// A static route's prefix string did not parse as a CIDR network.
    #[error("invalid static route prefix '{0}': {1}")]
    InvalidPrefix(String, ipnet::AddrParseError),

    /// A static route named neither a gateway nor a device.
    #[error("static route for '{0}' names neither a gateway nor a device")]
    StaticRouteWithoutNextHop(String),

    /// A zone's route block set `none` alongside a gateway or device.
    #[error("zone '{0}' declares a contradictory route policy")]
    ContradictoryRoute(String),

    /// A zone (or the default zone) listed no upstreams.
    #[error("zone '{0}' has no upstreams configured")]
    EmptyUpstreams(String),

    /// `route_aggregation_prefix` was out of range for any IP family.
    #[error("route_aggregation_prefix {0} is out of range")]
    InvalidAggregationPrefix(u8),
}

/// The raw, directly-deserialized configuration tree. Field names follow
/// §6 of the external interface reference.
#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cache: Option<RawCache>,
    pub route_aggregation_prefix: Option<u8>,
    #[serde(default)]
    pub static_routes: Vec<RawStaticRoute>,
    #[serde(default)]
    pub zones: Vec<RawZone>,
    pub default: RawDefaultZone,
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:53".parse().unwrap()
}

#[derive(Debug, Deserialize)]
pub struct RawCache {
    #[serde(default = "default_cache_size")]
    pub size: usize,
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_seconds: u32,
}

fn default_cache_size() -> usize {
    1024
}

fn default_negative_ttl() -> u32 {
    30
}

#[derive(Debug, Deserialize)]
pub struct RawStaticRoute {
    pub prefix: String,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub device: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct RawZone {
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub route: RawRoute,
}

#[derive(Debug, Deserialize)]
pub struct RawDefaultZone {
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub route: RawRoute,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawRoute {
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub device_file: Option<PathBuf>,
    #[serde(default)]
    pub none: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub exclude: Vec<Pattern>,
}

/// The compiled configuration the rest of the library operates on.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub cache_size: usize,
    pub negative_ttl: Duration,
    pub aggregation_prefix: Option<u8>,
    pub static_routes: Vec<StaticRoute>,
    pub zones: Vec<Zone>,
    pub default: Zone,
}

#[derive(Debug, Clone)]
pub struct StaticRoute {
    pub prefix: IpNet,
    pub next_hop: NextHop,
}

#[derive(Debug, Clone)]
pub enum NextHop {
    Gateway(IpAddr),
    Device(PathBuf),
}

/// A named classification rule. See spec §3/§4.1.
#[derive(Debug, Clone)]
pub struct Zone {
    /// A human-readable label used only in logs; not part of matching.
    pub name: String,
    pub kind: ZoneKind,
    pub upstreams: Vec<SocketAddr>,
    pub route: RoutePolicy,
}

/// How a zone decides it matches a name. Orthogonal to [`RoutePolicy`]: an
/// exclusive zone can still carry a gateway or device route, since
/// "exclusive" here describes *zone membership*, not the action taken once
/// matched.
#[derive(Debug, Clone)]
pub enum ZoneKind {
    /// Matches if any pattern in `patterns` matches the name.
    Inclusive { patterns: Vec<Pattern> },
    /// Matches any name not caught by an earlier zone in the list, unless
    /// the name also matches one of `exclude`.
    Exclusive { exclude: Vec<Pattern> },
}

/// Where a zone's matched answers get routed.
#[derive(Debug, Clone)]
pub enum RoutePolicy {
    None,
    Gateway(IpAddr),
    Device(PathBuf),
}

impl Config {
    /// Compile a [`RawConfig`] into a validated [`Config`].
    pub fn compile(raw: RawConfig) -> Result<Config, ConfigError> {
        if let Some(prefix) = raw.route_aggregation_prefix {
            if prefix > 128 {
                return Err(ConfigError::InvalidAggregationPrefix(prefix));
            }
        }

        let static_routes = raw
            .static_routes
            .into_iter()
            .map(compile_static_route)
            .collect::<Result<Vec<_>, _>>()?;

        let zones = raw
            .zones
            .into_iter()
            .enumerate()
            .map(|(i, z)| compile_zone(format!("zone[{i}]"), z))
            .collect::<Result<Vec<_>, _>>()?;

        let default = compile_default(raw.default)?;

        let (cache_size, negative_ttl) = match raw.cache {
            Some(c) => (c.size, Duration::from_secs(u64::from(c.negative_ttl_seconds))),
            None => (default_cache_size(), Duration::from_secs(u64::from(default_negative_ttl()))),
        };

        Ok(Config {
            listen: raw.listen,
            cache_size,
            negative_ttl,
            aggregation_prefix: raw.route_aggregation_prefix,
            static_routes,
            zones,
            default,
        })
    }
}

fn compile_static_route(raw: RawStaticRoute) -> Result<StaticRoute, ConfigError> {
    let prefix = raw
        .prefix
        .parse::<IpNet>()
        .map_err(|e| ConfigError::InvalidPrefix(raw.prefix.clone(), e))?;
    let next_hop = match (raw.gateway, raw.device) {
        (Some(gw), None) => NextHop::Gateway(gw),
        (None, Some(dev)) => NextHop::Device(dev),
        _ => return Err(ConfigError::StaticRouteWithoutNextHop(prefix.to_string())),
    };
    Ok(StaticRoute { prefix, next_hop })
}

fn compile_upstreams(name: &str, raw: Vec<String>) -> Result<Vec<SocketAddr>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::EmptyUpstreams(name.to_string()));
    }
    raw.into_iter()
        .map(|s| {
            s.parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidUpstream(s.clone(), e))
        })
        .collect()
}

fn compile_route(name: &str, raw: RawRoute) -> Result<(RoutePolicy, Option<Vec<Pattern>>), ConfigError> {
    let policy = match (raw.none, raw.gateway, raw.device_file) {
        (true, None, None) => RoutePolicy::None,
        (false, Some(gw), None) => RoutePolicy::Gateway(gw),
        (false, None, Some(dev)) => RoutePolicy::Device(dev),
        (false, None, None) => RoutePolicy::None,
        _ => return Err(ConfigError::ContradictoryRoute(name.to_string())),
    };
    let exclude = if raw.exclusive { Some(raw.exclude) } else { None };
    Ok((policy, exclude))
}

fn compile_zone(name: String, raw: RawZone) -> Result<Zone, ConfigError> {
    let upstreams = compile_upstreams(&name, raw.upstreams)?;
    let (route, exclude) = compile_route(&name, raw.route)?;
    let kind = match exclude {
        Some(exclude) => ZoneKind::Exclusive { exclude },
        None => ZoneKind::Inclusive { patterns: raw.patterns },
    };
    Ok(Zone {
        name,
        kind,
        upstreams,
        route,
    })
}

fn compile_default(raw: RawDefaultZone) -> Result<Zone, ConfigError> {
    let upstreams = compile_upstreams("default", raw.upstreams)?;
    let (route, _exclude) = compile_route("default", raw.route)?;
    Ok(Zone {
        name: "default".to_string(),
        kind: ZoneKind::Inclusive { patterns: vec![] },
        upstreams,
        route,
    })
}
