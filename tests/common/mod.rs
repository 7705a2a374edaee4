//! Collaborators standing in for the IP layer, routing and the random source.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ktcp::net::{NetworkAdapter, RandomSource, Router, RoutingDecision};
use ktcp::protocol::headers::{Flags, TcpHeader};
use ktcp::protocol::segment::{self, Segment};
use ktcp::protocol::{ConnectOutcome, ShouldBlock, SocketAddr, TcpSocket};
use ktcp::{Stack, TcpConfig};

pub const MTU: u16 = 1500;

/// Segment handed to a [`RecordingAdapter`].
#[derive(Debug, Clone)]
pub struct Sent {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub bytes: Vec<u8>,
}

impl Sent {
    pub fn header(&self) -> TcpHeader {
        Segment::parse(&self.bytes).unwrap().header
    }

    pub fn payload(&self) -> Vec<u8> {
        Segment::parse(&self.bytes).unwrap().payload.to_vec()
    }

    pub fn flags(&self) -> Flags {
        self.header().flags()
    }
}

/// Adapter recording every segment instead of putting it on a wire.
#[derive(Debug)]
pub struct RecordingAdapter {
    address: Ipv4Addr,
    sent: Mutex<Vec<Sent>>,
    failing: AtomicBool,
}

impl RecordingAdapter {
    pub fn new(address: Ipv4Addr) -> Arc<Self> {
        Arc::new(Self {
            address,
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last(&self) -> Sent {
        self.sent.lock().unwrap().last().cloned().unwrap()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Blocks until at least `count` segments were sent.
    pub fn wait_for(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);

        while self.sent_count() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {count} segments");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl NetworkAdapter for RecordingAdapter {
    fn ipv4_address(&self) -> Ipv4Addr {
        self.address
    }

    fn mtu(&self) -> u16 {
        MTU
    }

    fn send_ipv4(
        &self,
        source: Ipv4Addr,
        _next_hop: Ipv4Addr,
        destination: Ipv4Addr,
        segment: &[u8],
        _ttl: u8,
    ) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("link down"));
        }

        self.sent.lock().unwrap().push(Sent {
            source,
            destination,
            bytes: segment.to_vec(),
        });

        Ok(())
    }
}

/// Router reaching every peer directly through its adapters.
pub struct StaticRouter {
    adapters: Vec<Arc<RecordingAdapter>>,
    down: AtomicBool,
}

impl StaticRouter {
    pub fn new(adapters: Vec<Arc<RecordingAdapter>>) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            down: AtomicBool::new(false),
        })
    }

    /// Makes every route lookup fail while `down` is set.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

impl Router for StaticRouter {
    fn route_to(&self, peer: Ipv4Addr, local: Ipv4Addr) -> Option<RoutingDecision> {
        if self.down.load(Ordering::SeqCst) {
            return None;
        }

        let adapter = if local.is_unspecified() {
            self.adapters.first()?
        } else {
            self.adapters
                .iter()
                .find(|adapter| adapter.ipv4_address() == local)?
        };

        Some(RoutingDecision {
            adapter: Arc::clone(adapter) as Arc<dyn NetworkAdapter>,
            next_hop: peer,
        })
    }

    fn adapter_for(&self, address: Ipv4Addr) -> Option<Arc<dyn NetworkAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.ipv4_address() == address)
            .map(|adapter| Arc::clone(adapter) as Arc<dyn NetworkAdapter>)
    }
}

/// Random source returning queued values, then a fixed fallback.
#[derive(Debug)]
pub struct ScriptedRandom {
    values: Mutex<VecDeque<u32>>,
    fallback: u32,
}

impl ScriptedRandom {
    pub fn new(values: &[u32]) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(values.iter().copied().collect()),
            fallback: 0x4000_0000,
        })
    }
}

impl RandomSource for ScriptedRandom {
    fn next_u32(&self) -> u32 {
        self.values.lock().unwrap().pop_front().unwrap_or(self.fallback)
    }

    fn next_u16(&self) -> u16 {
        self.next_u32() as u16
    }
}

pub fn stack(adapter: &Arc<RecordingAdapter>, random: &[u32]) -> Arc<Stack> {
    stack_with(TcpConfig::default(), adapter, random)
}

pub fn stack_with(
    config: TcpConfig,
    adapter: &Arc<RecordingAdapter>,
    random: &[u32],
) -> Arc<Stack> {
    Stack::new(
        config,
        StaticRouter::new(vec![Arc::clone(adapter)]),
        ScriptedRandom::new(random),
    )
    .unwrap()
}

/// Builds a stack whose router can be taken down by the test.
pub fn stack_with_router(
    adapter: &Arc<RecordingAdapter>,
    random: &[u32],
) -> (Arc<Stack>, Arc<StaticRouter>) {
    let router = StaticRouter::new(vec![Arc::clone(adapter)]);
    let stack = Stack::new(
        TcpConfig::default(),
        Arc::clone(&router) as Arc<dyn Router>,
        ScriptedRandom::new(random),
    )
    .unwrap();

    (stack, router)
}

/// Encodes a segment sent by the peer at `from` to `to`.
pub fn peer_segment(
    from: SocketAddr,
    to: SocketAddr,
    seq: u32,
    ack: u32,
    flags: Flags,
    payload: &[u8],
) -> Vec<u8> {
    let mut header = TcpHeader::new(from.port, to.port, seq, u16::MAX);
    header.set_flags(flags);
    if flags.contains(Flags::ACK) {
        header.set_ack_number(ack);
    }

    segment::encode(&header, payload, from.addr, to.addr).unwrap()
}

/// Delivers a segment from `from` to `to` into `stack`.
pub fn deliver(
    stack: &Stack,
    from: SocketAddr,
    to: SocketAddr,
    seq: u32,
    ack: u32,
    flags: Flags,
    payload: &[u8],
) {
    let bytes = peer_segment(from, to, seq, ack, flags, payload);
    stack.deliver_segment(from.addr, to.addr, &bytes).unwrap();
}

/// Initial sequence number every scripted peer starts from.
pub const PEER_ISN: u32 = 7000;

/// An actively opened connection driven to `Established`.
pub struct Connection {
    pub socket: Arc<TcpSocket>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Next sequence number we send.
    pub seq: u32,
    /// Next sequence number the peer sends.
    pub peer_seq: u32,
}

/// Connects from `local_ip` to `remote` and answers the SYN.
pub fn establish(
    stack: &Arc<Stack>,
    adapter: &RecordingAdapter,
    local_ip: Ipv4Addr,
    remote: SocketAddr,
) -> Connection {
    let socket = stack.socket();
    socket.bind(SocketAddr::new(local_ip, 0)).unwrap();

    let outcome = socket.connect(remote, ShouldBlock::No).unwrap();
    assert_eq!(outcome, ConnectOutcome::Pending);

    let syn = adapter.last().header();
    assert_eq!(syn.flags(), Flags::SYN);

    let local = socket.tuple().local;
    let seq = syn.seq_number().wrapping_add(1);

    deliver(stack, remote, local, PEER_ISN, seq, Flags::SYN | Flags::ACK, &[]);

    Connection {
        socket,
        local,
        remote,
        seq,
        peer_seq: PEER_ISN.wrapping_add(1),
    }
}
