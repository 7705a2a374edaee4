mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

use common::{PEER_ISN, RecordingAdapter, StaticRouter, ScriptedRandom, deliver};
use ktcp::protocol::headers::Flags;
use ktcp::protocol::{ConnectOutcome, ConnectionState, Direction, Role, ShouldBlock, SocketAddr};
use ktcp::{Error, Stack, TcpConfig};

const LOCAL: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);
const REMOTE: SocketAddr = SocketAddr::new(Ipv4Addr::new(5, 6, 7, 8), 80);

#[test]
fn connect_blocking_handshake_valid() {
    let adapter = RecordingAdapter::new(LOCAL);
    // Port offset, then initial sequence number.
    let stack = common::stack(&adapter, &[5, 1000]);

    let socket = stack.socket();
    socket.bind(SocketAddr::new(LOCAL, 0)).unwrap();

    let connecting = {
        let socket = Arc::clone(&socket);
        thread::spawn(move || socket.connect(REMOTE, ShouldBlock::Yes))
    };

    adapter.wait_for(1);

    let syn = adapter.last();
    assert_eq!(syn.flags(), Flags::SYN);
    assert_eq!(syn.header().seq_number(), 1000);
    assert_eq!(syn.header().ack_number(), 0);
    assert_eq!(syn.header().window(), u16::MAX);
    assert_eq!(syn.header().options().mss(), Some(common::MTU - 40));
    assert_eq!((syn.source, syn.destination), (LOCAL, REMOTE.addr));

    let local = SocketAddr::new(LOCAL, 32768 + 5);
    assert_eq!(syn.header().src_port(), local.port);
    assert_eq!(socket.tuple().local, local);
    assert_eq!(socket.state(), ConnectionState::SynSent);
    assert_eq!(socket.direction(), Direction::Outgoing);
    assert!(stack.table().lookup(&socket.tuple()).is_some());

    deliver(&stack, REMOTE, local, PEER_ISN, 1001, Flags::SYN | Flags::ACK, &[]);

    assert_eq!(connecting.join().unwrap().unwrap(), ConnectOutcome::Connected);
    assert_eq!(socket.state(), ConnectionState::Established);
    assert_eq!(socket.role(), Role::Connected);
    assert!(!socket.is_disconnected());

    let ack = adapter.last();
    assert_eq!(ack.flags(), Flags::ACK);
    assert_eq!(ack.header().seq_number(), 1001);
    assert_eq!(ack.header().ack_number(), PEER_ISN + 1);

    // The SYN was retired by the SYN/ACK.
    assert!(socket.unacked_segments().is_empty());
}

#[test]
fn connect_adopts_adapter_address_valid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[0, 1]);

    let socket = stack.socket();
    let outcome = socket.connect(REMOTE, ShouldBlock::No).unwrap();

    assert_eq!(outcome, ConnectOutcome::Pending);
    assert_eq!(socket.tuple().local, SocketAddr::new(LOCAL, 32768));
    assert_eq!(socket.role(), Role::Connecting);
}

#[test]
fn connect_bad_syn_ack_refused_invalid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[0, 1000]);

    let socket = stack.socket();
    let connecting = {
        let socket = Arc::clone(&socket);
        thread::spawn(move || socket.connect(REMOTE, ShouldBlock::Yes))
    };

    adapter.wait_for(1);
    let local = socket.tuple().local;

    deliver(&stack, REMOTE, local, PEER_ISN, 999, Flags::SYN | Flags::ACK, &[]);

    assert!(matches!(connecting.join().unwrap(), Err(Error::ConnectionRefused)));
    assert_eq!(adapter.last().flags(), Flags::RST);
    assert_eq!(socket.state(), ConnectionState::Closed);
    assert_eq!(socket.role(), Role::None);
    assert!(stack.table().is_empty());
}

#[test]
fn connect_reset_refused_invalid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[0, 1000]);

    let socket = stack.socket();
    let connecting = {
        let socket = Arc::clone(&socket);
        thread::spawn(move || socket.connect(REMOTE, ShouldBlock::Yes))
    };

    adapter.wait_for(1);
    let local = socket.tuple().local;

    deliver(&stack, REMOTE, local, 0, 1001, Flags::RST | Flags::ACK, &[]);

    assert!(matches!(connecting.join().unwrap(), Err(Error::ConnectionRefused)));
    assert_eq!(socket.role(), Role::None);
}

#[test]
fn connect_interrupted_invalid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[0, 1000]);

    let socket = stack.socket();
    let connecting = {
        let socket = Arc::clone(&socket);
        thread::spawn(move || socket.connect(REMOTE, ShouldBlock::Yes))
    };

    adapter.wait_for(1);
    socket.interrupt();

    let result = connecting.join().unwrap();
    assert!(matches!(result, Err(Error::Interrupted)));
    assert_eq!(result.unwrap_err().errno(), libc::EINTR);
    assert_eq!(socket.role(), Role::None);
    assert_eq!(socket.state(), ConnectionState::SynSent);
}

#[test]
fn connect_no_route_invalid() {
    let stack = Stack::new(
        TcpConfig::default(),
        StaticRouter::new(Vec::new()),
        ScriptedRandom::new(&[]),
    )
    .unwrap();

    let socket = stack.socket();
    let result = socket.connect(REMOTE, ShouldBlock::Yes);

    assert!(matches!(result, Err(Error::HostUnreachable)));
    assert!(stack.table().is_empty());
}

#[test]
fn bind_foreign_address_invalid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[]);

    let socket = stack.socket();
    let result = socket.bind(SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1), 4000));

    assert!(matches!(result, Err(Error::AddressNotAvailable)));
    assert_eq!(socket.tuple().local, SocketAddr::UNSPECIFIED);
}

#[test]
fn connect_explicit_port_in_use_invalid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[]);

    let first = stack.socket();
    first.bind(SocketAddr::new(LOCAL, 4000)).unwrap();
    first.connect(REMOTE, ShouldBlock::No).unwrap();

    let second = stack.socket();
    second.bind(SocketAddr::new(LOCAL, 4000)).unwrap();

    assert!(matches!(
        second.connect(REMOTE, ShouldBlock::No),
        Err(Error::AddressInUse)
    ));
    assert_eq!(stack.table().len(), 1);
}

#[test]
fn connect_ephemeral_ports_exhausted_invalid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let config = TcpConfig {
        ephemeral_ports: 50000..=50001,
        ..TcpConfig::default()
    };
    let stack = common::stack_with(config, &adapter, &[]);

    let sockets: Vec<_> = (0..2).map(|_| stack.socket()).collect();
    for socket in &sockets {
        socket.connect(REMOTE, ShouldBlock::No).unwrap();
    }

    let mut ports: Vec<u16> = sockets.iter().map(|socket| socket.tuple().local.port).collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![50000, 50001]);

    let third = stack.socket();
    assert!(matches!(
        third.connect(REMOTE, ShouldBlock::No),
        Err(Error::AddressInUse)
    ));
}

#[test]
fn connect_twice_invalid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[]);

    let socket = stack.socket();
    socket.connect(REMOTE, ShouldBlock::No).unwrap();

    assert!(matches!(
        socket.connect(REMOTE, ShouldBlock::No),
        Err(Error::InvalidState {
            state: ConnectionState::SynSent
        })
    ));
}

#[test]
fn dropped_socket_unregistered_valid() {
    let adapter = RecordingAdapter::new(LOCAL);
    let stack = common::stack(&adapter, &[]);

    let socket = stack.socket();
    socket.connect(REMOTE, ShouldBlock::No).unwrap();
    assert_eq!(stack.sockets().len(), 1);

    drop(socket);
    assert!(stack.table().is_empty());
}
