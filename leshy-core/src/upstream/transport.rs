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

//! A single query attempt against one upstream: UDP first, falling back to
//! TCP when the UDP response comes back truncated. `domain` has no TCP
//! transport of its own, so the 2-byte length prefix from RFC 1035 §4.2.2
//! is framed by hand here.

use crate::MAX_LEN;
use bytes::{Bytes, BytesMut};
use domain::base::{Message, ShortBuf};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};

/// Errors from a single transport attempt. All are failover-eligible from
/// the pool's perspective.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ShortBuf(#[from] ShortBuf),
}

/// Query `addr`, retrying over TCP if the UDP response is truncated.
pub async fn query(addr: SocketAddr, msg: &Message<Bytes>) -> Result<Message<Bytes>, TransportError> {
    let resp = query_udp(addr, msg).await?;
    if resp.header().tc() {
        query_tcp(addr, msg).await
    } else {
        Ok(resp)
    }
}

fn randomize(msg: &Message<Bytes>) -> Result<Message<BytesMut>, TransportError> {
    let mut randomized = Message::from_octets(BytesMut::from(msg.as_slice()))?;
    randomized.header_mut().set_random_id();
    Ok(randomized)
}

fn bind_addr(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}

async fn query_udp(addr: SocketAddr, msg: &Message<Bytes>) -> Result<Message<Bytes>, TransportError> {
    let socket = UdpSocket::bind(bind_addr(addr.is_ipv4())).await?;
    socket.connect(addr).await?;

    let randomized = randomize(msg)?;
    let sent = randomized.for_slice();
    socket.send(sent.as_slice()).await?;

    loop {
        let mut buf = BytesMut::with_capacity(MAX_LEN);
        buf.resize(MAX_LEN, 0);
        let len = socket.recv(&mut buf).await?;
        buf.resize(len, 0);

        // Garbage on the wire is ignored; the caller's per-attempt timeout
        // bounds how long this loop can spin.
        let answer = match Message::from_octets(buf.freeze()) {
            Ok(answer) => answer,
            Err(_) => continue,
        };
        if !answer.is_answer(&sent) {
            continue;
        }
        return Ok(answer);
    }
}

async fn query_tcp(addr: SocketAddr, msg: &Message<Bytes>) -> Result<Message<Bytes>, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;

    let randomized = randomize(msg)?;
    let sent = randomized.for_slice();

    let len = sent.as_slice().len() as u16;
    let mut framed = BytesMut::with_capacity(2 + len as usize);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(sent.as_slice());
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let resp_len = u16::from_be_bytes(len_buf) as usize;

    let mut resp_buf = BytesMut::with_capacity(resp_len);
    resp_buf.resize(resp_len, 0);
    stream.read_exact(&mut resp_buf).await?;

    Ok(Message::from_octets(resp_buf.freeze())?)
}
