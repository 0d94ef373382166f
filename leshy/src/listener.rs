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

//! Accepts client queries over UDP and TCP and dispatches each one to the
//! pipeline. One task per query, mirroring `dcompass`'s own worker-per-packet
//! shape; a UDP reply that would not fit in 512 bytes is replaced with an
//! empty, truncated (`TC`) response so a conforming client retries over TCP.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use domain::base::{Message, MessageBuilder};
use leshy_core::{
    pipeline::Pipeline,
    route::RouteBackend,
};
use log::*;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};

/// Matches `leshy_core::MAX_LEN`: the largest datagram this listener ever
/// allocates a receive buffer for. EDNS0 allows larger UDP responses but
/// leshy never advertises an OPT record larger than this.
const MAX_LEN: usize = 1232;

const UDP_REPLY_LIMIT: usize = 512;

/// Run the UDP and TCP listeners side by side until either fails. Each
/// accepted query is handled in its own detached task so one slow client
/// (or one slow upstream) never head-of-line blocks another.
pub async fn run<B>(addr: SocketAddr, pipeline: Arc<Pipeline<B>>) -> Result<()>
where
    B: RouteBackend + Send + Sync + 'static,
{
    let udp = UdpSocket::bind(addr).await?;
    info!("udp listener bound to {}", addr);
    let tcp = TcpListener::bind(addr).await?;
    info!("tcp listener bound to {}", addr);

    tokio::try_join!(run_udp(udp, pipeline.clone()), run_tcp(tcp, pipeline))?;
    Ok(())
}

async fn run_udp<B>(socket: UdpSocket, pipeline: Arc<Pipeline<B>>) -> Result<()>
where
    B: RouteBackend + Send + Sync + 'static,
{
    let socket = Arc::new(socket);
    loop {
        let mut buf = BytesMut::with_capacity(MAX_LEN);
        buf.resize(MAX_LEN, 0);
        let (len, src) = socket.recv_from(&mut buf).await?;
        buf.resize(len, 0);
        let query = buf.freeze();

        let socket = socket.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_udp_datagram(&socket, src, query, &pipeline).await {
                warn!("failed to answer udp query from {}: {}", src, e);
            }
        });
    }
}

async fn handle_udp_datagram<B>(
    socket: &UdpSocket,
    src: SocketAddr,
    query: Bytes,
    pipeline: &Pipeline<B>,
) -> Result<()>
where
    B: RouteBackend + Send + Sync + 'static,
{
    let query = match Message::from_octets(query) {
        Ok(m) => m,
        Err(e) => {
            debug!("dropping malformed query from {}: {}", src, e);
            return Ok(());
        }
    };

    let reply = pipeline.handle(&query).await;
    let wire = if reply.as_slice().len() > UDP_REPLY_LIMIT {
        truncated(&reply)?
    } else {
        reply
    };
    socket.send_to(wire.as_slice(), src).await?;
    Ok(())
}

/// Build an empty, truncated response carrying the same header and question
/// as `reply`, for when the real answer would not fit in a UDP datagram.
fn truncated(reply: &Message<Bytes>) -> Result<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(UDP_REPLY_LIMIT))?;
    *builder.header_mut() = reply.header();
    builder.header_mut().set_tc(true);
    let mut builder = builder.question();
    for item in reply.question().flatten() {
        builder.push(item)?;
    }
    Ok(builder.additional().into_message())
}

async fn run_tcp<B>(listener: TcpListener, pipeline: Arc<Pipeline<B>>) -> Result<()>
where
    B: RouteBackend + Send + Sync + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(stream, &pipeline).await {
                debug!("tcp connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Serve queries off one TCP connection until the client disconnects.
/// Disconnect cancels whatever query is in flight for this connection; it
/// does not affect any other client.
async fn handle_tcp_connection<B>(mut stream: TcpStream, pipeline: &Pipeline<B>) -> Result<()>
where
    B: RouteBackend + Send + Sync + 'static,
{
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut buf = BytesMut::with_capacity(len);
        buf.resize(len, 0);
        stream.read_exact(&mut buf).await?;

        let query = match Message::from_octets(buf.freeze()) {
            Ok(m) => m,
            Err(_) => continue,
        };

        let reply = pipeline.handle(&query).await;
        let wire = reply.as_slice();
        let mut framed = BytesMut::with_capacity(2 + wire.len());
        framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        framed.extend_from_slice(wire);
        stream.write_all(&framed).await?;
    }
}
