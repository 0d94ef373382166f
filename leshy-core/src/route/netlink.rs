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

//! Linux kernel routing table mutation via `rtnetlink`.

use super::{NextHopResolved, RouteBackend, RouteError};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::RT_SCOPE_UNIVERSE;
use rtnetlink::{new_connection, Handle};
use std::net::IpAddr;

/// netlink's way of saying "this route already exists". Re-adding an
/// already-owned route is idempotent, so this is treated as success.
const FILE_ALREADY_EXISTS: i32 = -17;

pub struct NetlinkBackend {
    handle: Handle,
}

impl NetlinkBackend {
    pub fn new() -> Result<Self, RouteError> {
        let (connection, handle, _) = new_connection().map_err(RouteError::Io)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn interface_index(&self, name: &str) -> Result<u32, RouteError> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(RouteError::Netlink)?
            .ok_or_else(|| RouteError::NoSuchDevice(name.to_string()))?;
        Ok(link.header.index)
    }
}

#[async_trait]
impl RouteBackend for NetlinkBackend {
    async fn add_route(&self, prefix: IpNet, next_hop: &NextHopResolved) -> Result<(), RouteError> {
        let result = match (prefix, next_hop) {
            (IpNet::V4(net), NextHopResolved::Gateway(IpAddr::V4(gw))) => {
                self.handle
                    .route()
                    .add()
                    .scope(RT_SCOPE_UNIVERSE)
                    .v4()
                    .destination_prefix(net.network(), net.prefix_len())
                    .gateway(*gw)
                    .execute()
                    .await
            }
            (IpNet::V6(net), NextHopResolved::Gateway(IpAddr::V6(gw))) => {
                self.handle
                    .route()
                    .add()
                    .scope(RT_SCOPE_UNIVERSE)
                    .v6()
                    .destination_prefix(net.network(), net.prefix_len())
                    .gateway(*gw)
                    .execute()
                    .await
            }
            (IpNet::V4(net), NextHopResolved::Device(name)) => {
                let index = self.interface_index(name).await?;
                self.handle
                    .route()
                    .add()
                    .output_interface(index)
                    .scope(RT_SCOPE_UNIVERSE)
                    .v4()
                    .destination_prefix(net.network(), net.prefix_len())
                    .execute()
                    .await
            }
            (IpNet::V6(net), NextHopResolved::Device(name)) => {
                let index = self.interface_index(name).await?;
                self.handle
                    .route()
                    .add()
                    .output_interface(index)
                    .scope(RT_SCOPE_UNIVERSE)
                    .v6()
                    .destination_prefix(net.network(), net.prefix_len())
                    .execute()
                    .await
            }
            _ => return Err(RouteError::FamilyMismatch),
        };

        match result {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref e)) if e.raw_code() == FILE_ALREADY_EXISTS => Ok(()),
            Err(e) => Err(RouteError::Netlink(e)),
        }
    }

    async fn remove_route(&self, prefix: IpNet, next_hop: &NextHopResolved) -> Result<(), RouteError> {
        let message = match (prefix, next_hop) {
            (IpNet::V4(net), NextHopResolved::Gateway(IpAddr::V4(gw))) => self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(net.network(), net.prefix_len())
                .gateway(*gw)
                .message_mut()
                .clone(),
            (IpNet::V6(net), NextHopResolved::Gateway(IpAddr::V6(gw))) => self
                .handle
                .route()
                .add()
                .v6()
                .destination_prefix(net.network(), net.prefix_len())
                .gateway(*gw)
                .message_mut()
                .clone(),
            (IpNet::V4(net), NextHopResolved::Device(name)) => {
                let index = self.interface_index(name).await?;
                self.handle
                    .route()
                    .add()
                    .output_interface(index)
                    .v4()
                    .destination_prefix(net.network(), net.prefix_len())
                    .message_mut()
                    .clone()
            }
            (IpNet::V6(net), NextHopResolved::Device(name)) => {
                let index = self.interface_index(name).await?;
                self.handle
                    .route()
                    .add()
                    .output_interface(index)
                    .v6()
                    .destination_prefix(net.network(), net.prefix_len())
                    .message_mut()
                    .clone()
            }
            _ => return Err(RouteError::FamilyMismatch),
        };

        self.handle
            .route()
            .del(message)
            .execute()
            .await
            .map_err(RouteError::Netlink)
    }
}
