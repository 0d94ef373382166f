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

//! End-to-end tests against [`Pipeline`], using [`leshy_core::mock::Server`]
//! as a stand-in upstream so no real network or kernel route table is
//! touched. These exercise the scenarios from the spec's testable
//! properties section: zone split, cache hits, and upstream failover.

use async_trait::async_trait;
use bytes::Bytes;
use domain::base::{
    iana::{Class, Rcode, Rtype},
    Dname, Message, MessageBuilder, Record,
};
use domain::rdata::{AllRecordData, A};
use ipnet::IpNet;
use leshy_core::{
    config::{Config, RawConfig},
    mock::Server,
    pipeline::Pipeline,
    route::{NextHopResolved, RouteBackend, RouteController, RouteError},
};
use std::{
    net::IpAddr,
    str::FromStr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::net::UdpSocket;

/// A route backend that never touches the kernel, recording every call
/// instead. Used in place of [`leshy_core::route::NetlinkBackend`] so these
/// tests run without elevated privileges. Clones share the same log, so a
/// test can keep one handle for assertions while the controller owns
/// another.
#[derive(Default, Clone)]
struct RecordingBackend {
    added: Arc<StdMutex<Vec<(IpNet, NextHopResolved)>>>,
}

#[async_trait]
impl RouteBackend for RecordingBackend {
    async fn add_route(&self, prefix: IpNet, next_hop: &NextHopResolved) -> Result<(), RouteError> {
        self.added.lock().unwrap().push((prefix, next_hop.clone()));
        Ok(())
    }

    async fn remove_route(&self, _prefix: IpNet, _next_hop: &NextHopResolved) -> Result<(), RouteError> {
        Ok(())
    }
}

fn answer_a(qname: &str, ip: [u8; 4], ttl: u32) -> Message<Bytes> {
    let name = Dname::<Bytes>::from_str(qname).unwrap();
    let mut builder = MessageBuilder::from_target(bytes::BytesMut::with_capacity(1232))
        .unwrap()
        .question();
    builder.push((&name, Rtype::A)).unwrap();
    let mut builder = builder.answer();
    builder
        .push(Record::new(
            name,
            Class::In,
            ttl,
            AllRecordData::A(A::from_octets(ip[0], ip[1], ip[2], ip[3])),
        ))
        .unwrap();
    builder.into_message()
}

fn servfail(qname: &str) -> Message<Bytes> {
    let mut msg = answer_a(qname, [0, 0, 0, 0], 0);
    msg.header_mut().set_rcode(Rcode::ServFail);
    msg
}

fn query(qname: &str, id: u16) -> Message<Bytes> {
    let name = Dname::<Bytes>::from_str(qname).unwrap();
    let mut builder = MessageBuilder::from_target(bytes::BytesMut::with_capacity(1232)).unwrap();
    builder.header_mut().set_id(id);
    let mut builder = builder.question();
    builder.push((&name, Rtype::A)).unwrap();
    builder.into_message()
}

/// Spawn a mock upstream on `addr` that always replies with `reply`,
/// regardless of what it's asked. Returns a handle the caller can abort to
/// simulate the upstream disappearing.
async fn spawn_upstream(addr: &str, reply: Message<Bytes>) -> tokio::task::JoinHandle<()> {
    let socket = UdpSocket::bind(addr).await.unwrap();
    let server = Server::new(socket, vec![0; 1024], None);
    tokio::spawn(async move {
        let _ = server.run(reply).await;
    })
}

fn compile(yaml: &str) -> Config {
    let raw: RawConfig = serde_yaml::from_str(yaml).unwrap();
    Config::compile(raw).unwrap()
}

fn ip_of(msg: &Message<Bytes>) -> IpAddr {
    let record = msg
        .answer()
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .into_record::<AllRecordData<_, _>>()
        .unwrap()
        .unwrap();
    match record.data() {
        AllRecordData::A(a) => IpAddr::V4(a.addr()),
        other => panic!("unexpected record data: {:?}", other),
    }
}

#[tokio::test]
async fn basic_forwarding() {
    let _ = spawn_upstream("127.0.0.1:15301", answer_a("example.com.", [93, 184, 216, 34], 300)).await;

    let config = compile(
        r#"
default:
  upstreams: ["127.0.0.1:15301"]
"#,
    );
    let routes = Arc::new(RouteController::new(RecordingBackend::default(), None));
    let pipeline = Pipeline::new(&config, routes);

    let reply = pipeline.handle(&query("example.com.", 1)).await;
    assert_eq!(reply.header().rcode(), Rcode::NoError);
    assert_eq!(ip_of(&reply), "93.184.216.34".parse::<IpAddr>().unwrap());
}

#[tokio::test]
async fn zone_split_routes_to_the_matching_upstream() {
    let _ = spawn_upstream("127.0.0.1:15302", answer_a("internal.company.com.", [10, 0, 1, 1], 300)).await;
    let _ = spawn_upstream("127.0.0.1:15303", answer_a("google.com.", [142, 250, 80, 46], 300)).await;

    let config = compile(
        r#"
zones:
  - patterns: ["company.com"]
    upstreams: ["127.0.0.1:15302"]
default:
  upstreams: ["127.0.0.1:15303"]
"#,
    );
    let routes = Arc::new(RouteController::new(RecordingBackend::default(), None));
    let pipeline = Pipeline::new(&config, routes);

    let internal = pipeline.handle(&query("internal.company.com.", 2)).await;
    assert_eq!(ip_of(&internal), "10.0.1.1".parse::<IpAddr>().unwrap());

    let external = pipeline.handle(&query("google.com.", 3)).await;
    assert_eq!(ip_of(&external), "142.250.80.46".parse::<IpAddr>().unwrap());
}

#[tokio::test]
async fn cache_hit_survives_the_upstream_disappearing() {
    let upstream = spawn_upstream("127.0.0.1:15304", answer_a("www.example.com.", [93, 184, 216, 34], 300)).await;

    let config = compile(
        r#"
default:
  upstreams: ["127.0.0.1:15304"]
"#,
    );
    let routes = Arc::new(RouteController::new(RecordingBackend::default(), None));
    let pipeline = Pipeline::new(&config, routes);

    let first = pipeline.handle(&query("www.example.com.", 4)).await;
    assert_eq!(first.header().rcode(), Rcode::NoError);

    // Kill the upstream: the second lookup can only succeed from cache.
    upstream.abort();

    let second = pipeline.handle(&query("www.example.com.", 5)).await;
    assert_eq!(second.header().rcode(), Rcode::NoError);
    assert_eq!(ip_of(&second), ip_of(&first));
    assert_eq!(second.header().id(), 5);
}

#[tokio::test]
async fn failover_skips_a_servfailing_upstream() {
    let _ = spawn_upstream("127.0.0.1:15305", servfail("docker.io.")).await;
    let _ = spawn_upstream("127.0.0.1:15306", answer_a("docker.io.", [185, 199, 108, 153], 300)).await;

    let config = compile(
        r#"
default:
  upstreams: ["127.0.0.1:15305", "127.0.0.1:15306"]
"#,
    );
    let routes = Arc::new(RouteController::new(RecordingBackend::default(), None));
    let pipeline = Pipeline::new(&config, routes);

    let reply = pipeline.handle(&query("docker.io.", 6)).await;
    assert_eq!(reply.header().rcode(), Rcode::NoError);
    assert_eq!(ip_of(&reply), "185.199.108.153".parse::<IpAddr>().unwrap());
}

#[tokio::test]
async fn all_upstreams_failing_synthesizes_servfail() {
    // Nothing listens on these ports: every attempt times out or is refused.
    let config = compile(
        r#"
default:
  upstreams: ["127.0.0.1:15399", "127.0.0.1:15398"]
"#,
    );
    let routes = Arc::new(RouteController::new(RecordingBackend::default(), None));
    let pipeline = Pipeline::new(&config, routes);

    let reply = pipeline.handle(&query("unreachable.example.", 7)).await;
    assert_eq!(reply.header().rcode(), Rcode::ServFail);
}

#[tokio::test]
async fn successful_answer_triggers_a_route_install() {
    let _ = spawn_upstream("127.0.0.1:15307", answer_a("cloudflare.com.", [104, 16, 132, 229], 300)).await;

    let config = compile(
        r#"
default:
  upstreams: ["127.0.0.1:15307"]
  route: { gateway: "172.28.0.1" }
"#,
    );
    let backend = RecordingBackend::default();
    let added = backend.added.clone();
    let routes = Arc::new(RouteController::new(backend, None));
    let pipeline = Pipeline::new(&config, routes);

    let reply = pipeline.handle(&query("cloudflare.com.", 8)).await;
    assert_eq!(reply.header().rcode(), Rcode::NoError);

    // Route application is a detached task off the reply path; give it a
    // moment to run before inspecting the owned set.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let installed = added.lock().unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].0, "104.16.132.229/32".parse::<IpNet>().unwrap());
    assert_eq!(installed[0].1, NextHopResolved::Gateway("172.28.0.1".parse().unwrap()));
}

#[tokio::test]
async fn route_install_failure_does_not_fail_the_query() {
    struct FailingBackend;

    #[async_trait]
    impl RouteBackend for FailingBackend {
        async fn add_route(&self, _prefix: IpNet, _next_hop: &NextHopResolved) -> Result<(), RouteError> {
            Err(RouteError::NoSuchDevice("nonexistent0".into()))
        }
        async fn remove_route(&self, _prefix: IpNet, _next_hop: &NextHopResolved) -> Result<(), RouteError> {
            Ok(())
        }
    }

    let _ = spawn_upstream("127.0.0.1:15308", answer_a("example.com.", [93, 184, 216, 34], 300)).await;

    let config = compile(
        r#"
default:
  upstreams: ["127.0.0.1:15308"]
  route: { gateway: "10.255.255.254" }
"#,
    );
    let routes = Arc::new(RouteController::new(FailingBackend, None));
    let pipeline = Pipeline::new(&config, routes);

    let reply = pipeline.handle(&query("example.com.", 9)).await;
    assert_eq!(reply.header().rcode(), Rcode::NoError);
    assert_eq!(ip_of(&reply), "93.184.216.34".parse::<IpAddr>().unwrap());
}
