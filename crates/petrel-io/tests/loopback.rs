// End-to-end socket layer tests: two loops, real TCP, framed streams.
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;

use bytes::Bytes;
use petrel_common::{HostId, TenantId};
use petrel_io::{EventLoop, IoConfig, Stream, StreamEvent};
use petrel_wire::{GoodbyeCode, Message};

/// Send-safe summary of what a client stream observed.
#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Cookie(Vec<u8>),
    Goodbye(GoodbyeCode),
    Health(bool),
}

/// Echo server: pings come back with the same cookie; a "bye" cookie closes
/// the stream gracefully.
fn spawn_echo_server(config: IoConfig) -> (EventLoop, HostId) {
    let server = EventLoop::spawn("echo-server", config).expect("spawn server");
    let (addr_tx, addr_rx) = channel();
    server
        .submit(move |ctx| {
            let accept_ctx = ctx.clone();
            ctx.spawn(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind");
                addr_tx
                    .send(listener.local_addr().expect("local addr"))
                    .expect("send addr");
                loop {
                    let Ok((tcp, _)) = listener.accept().await else {
                        break;
                    };
                    let std_tcp = tcp.into_std().expect("into std");
                    accept_ctx
                        .adopt_inbound(std_tcp, |_ctx, stream, first| {
                            echo(&stream, &first);
                            let echo_stream = stream.clone();
                            stream.set_receiver(Box::new(move |_flow, event| {
                                if let StreamEvent::Message(message) = event {
                                    echo(&echo_stream, &message);
                                }
                            }));
                        })
                        .expect("adopt");
                }
            });
        })
        .expect("submit listener");
    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).expect("addr");
    (server, HostId::local(addr.port()))
}

fn echo(stream: &Stream, message: &Message) {
    if let Message::Ping { tenant, cookie } = message {
        if cookie.as_ref() == b"bye" {
            stream.close(true);
        } else {
            stream.send(&Message::Ping {
                tenant: *tenant,
                cookie: cookie.clone(),
            });
        }
    }
}

/// Client loop with one stream to `host`; everything the stream observes is
/// summarized onto the returned channel.
fn spawn_client(config: IoConfig, host: HostId, cookies: Vec<&'static [u8]>) -> (EventLoop, Receiver<Seen>) {
    let client = EventLoop::spawn("client", config).expect("spawn client");
    let (seen_tx, seen_rx) = channel::<Seen>();
    client
        .submit(move |ctx| {
            let ctx = ctx.clone();
            ctx.clone().spawn(async move {
                let stream = ctx.open_stream(&host).await.expect("open stream");
                stream.set_receiver(Box::new(make_observer(seen_tx)));
                for cookie in cookies {
                    stream.send(&Message::Ping {
                        tenant: TenantId::GUEST,
                        cookie: Bytes::from_static(cookie),
                    });
                }
            });
        })
        .expect("submit client");
    (client, seen_rx)
}

fn make_observer(seen_tx: Sender<Seen>) -> impl FnMut(&mut petrel_io::Flow, StreamEvent) {
    move |_flow, event| {
        let seen = match event {
            StreamEvent::Message(Message::Ping { cookie, .. }) => Seen::Cookie(cookie.to_vec()),
            StreamEvent::Message(Message::Goodbye { code, .. }) => Seen::Goodbye(code),
            StreamEvent::Message(_) => return,
            StreamEvent::Health(healthy) => Seen::Health(healthy),
        };
        let _ = seen_tx.send(seen);
    }
}

fn recv(seen_rx: &Receiver<Seen>) -> Seen {
    seen_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("event within deadline")
}

#[test]
fn ping_echo_round_trip() {
    let (_server, host) = spawn_echo_server(IoConfig::default());
    let (_client, seen_rx) = spawn_client(IoConfig::default(), host, vec![b"one", b"two"]);

    // Per-stream ordering: echoes come back in send order.
    assert_eq!(recv(&seen_rx), Seen::Cookie(b"one".to_vec()));
    assert_eq!(recv(&seen_rx), Seen::Cookie(b"two".to_vec()));
}

#[test]
fn two_streams_multiplex_over_one_socket() {
    let (_server, host) = spawn_echo_server(IoConfig::default());
    let client = EventLoop::spawn("client", IoConfig::default()).expect("spawn client");
    let (seen_tx, seen_rx) = channel::<(u64, Vec<u8>)>();

    client
        .submit(move |ctx| {
            let ctx = ctx.clone();
            ctx.clone().spawn(async move {
                let first = ctx.open_stream(&host).await.expect("open first");
                let second = ctx.open_stream(&host).await.expect("open second");
                assert_ne!(first.id(), second.id());
                for stream in [&first, &second] {
                    let tx = seen_tx.clone();
                    let id = stream.id();
                    stream.set_receiver(Box::new(move |_flow, event| {
                        if let StreamEvent::Message(Message::Ping { cookie, .. }) = event {
                            let _ = tx.send((id, cookie.to_vec()));
                        }
                    }));
                }
                first.send(&Message::Ping {
                    tenant: TenantId::GUEST,
                    cookie: Bytes::from_static(b"first"),
                });
                second.send(&Message::Ping {
                    tenant: TenantId::GUEST,
                    cookie: Bytes::from_static(b"second"),
                });
            });
        })
        .expect("submit");

    let mut seen: Vec<(u64, Vec<u8>)> = (0..2)
        .map(|_| seen_rx.recv_timeout(Duration::from_secs(5)).expect("echo"))
        .collect();
    seen.sort();
    let cookies: Vec<&[u8]> = seen.iter().map(|(_, c)| c.as_slice()).collect();
    assert_eq!(cookies, vec![b"first" as &[u8], b"second"]);
    assert_ne!(seen[0].0, seen[1].0, "responses arrived on distinct streams");
}

#[test]
fn graceful_goodbye_reaches_the_client() {
    let (_server, host) = spawn_echo_server(IoConfig::default());
    let (_client, seen_rx) = spawn_client(IoConfig::default(), host, vec![b"one", b"bye"]);

    assert_eq!(recv(&seen_rx), Seen::Cookie(b"one".to_vec()));
    assert_eq!(recv(&seen_rx), Seen::Goodbye(GoodbyeCode::Graceful));
}

#[test]
fn dead_socket_synthesizes_socket_error_goodbye() {
    let (server, host) = spawn_echo_server(IoConfig::default());
    let (_client, seen_rx) = spawn_client(IoConfig::default(), host, vec![b"one"]);

    assert_eq!(recv(&seen_rx), Seen::Cookie(b"one".to_vec()));
    // Killing the server loop drops the TCP connection; the client stream
    // must observe exactly one synthesized goodbye.
    drop(server);
    assert_eq!(recv(&seen_rx), Seen::Goodbye(GoodbyeCode::SocketError));
}

#[test]
fn silent_server_flips_stream_health() {
    // Server never heartbeats; client times out quickly.
    let server_config = IoConfig {
        heartbeat_period: Duration::from_secs(3600),
        ..IoConfig::default()
    };
    let client_config = IoConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..IoConfig::default()
    };
    let (_server, host) = spawn_echo_server(server_config);

    let client = EventLoop::spawn("client", client_config).expect("spawn client");
    let (seen_tx, seen_rx) = channel::<Seen>();
    client
        .submit(move |ctx| {
            let ctx = ctx.clone();
            ctx.clone().spawn(async move {
                let stream = ctx.open_stream(&host).await.expect("open stream");
                stream.set_receiver(Box::new(make_observer(seen_tx)));
                stream.send(&Message::Ping {
                    tenant: TenantId::GUEST,
                    cookie: Bytes::from_static(b"one"),
                });
                // Go quiet long enough for the timeout scan to flag the
                // stream, then traffic on it brings it back.
                tokio::time::sleep(Duration::from_millis(700)).await;
                stream.send(&Message::Ping {
                    tenant: TenantId::GUEST,
                    cookie: Bytes::from_static(b"again"),
                });
            });
        })
        .expect("submit client");

    assert_eq!(recv(&seen_rx), Seen::Cookie(b"one".to_vec()));
    assert_eq!(recv(&seen_rx), Seen::Health(false));
    assert_eq!(recv(&seen_rx), Seen::Health(true));
    assert_eq!(recv(&seen_rx), Seen::Cookie(b"again".to_vec()));
}

#[test]
fn aggregated_heartbeats_keep_streams_healthy() {
    // Server heartbeats fast enough to beat the client timeout; no Health
    // transitions should ever surface.
    let server_config = IoConfig {
        heartbeat_period: Duration::from_millis(50),
        ..IoConfig::default()
    };
    let client_config = IoConfig {
        heartbeat_timeout: Duration::from_millis(400),
        ..IoConfig::default()
    };
    let (_server, host) = spawn_echo_server(server_config);
    let (_client, seen_rx) = spawn_client(client_config, host, vec![b"one"]);

    assert_eq!(recv(&seen_rx), Seen::Cookie(b"one".to_vec()));
    assert!(
        seen_rx.recv_timeout(Duration::from_millis(900)).is_err(),
        "no health transitions expected while heartbeats flow"
    );
}
