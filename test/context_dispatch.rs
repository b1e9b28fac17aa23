//! Context event dispatch tests
//!
//! Full host-facing flows over the in-process engine: connect, receive,
//! echo, channels, stop, error routing and statistics.

mod common;

use common::{delegated_context, native_context, settle, RecordingListener};
use netbridge::config::BridgeConfig;
use netbridge::context::{Context, ErrorHandler};
use netbridge::host::{HostException, HostObjectId, PromiseState};
use netbridge::{BridgeError, ChannelMode, EngineError, EntityKind, SocketListener};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

struct Pair {
    server: HostObjectId,
    client: HostObjectId,
    at_server: Rc<RecordingListener>,
    at_client: Rc<RecordingListener>,
}

fn connect_pair(ctx: &Context, address: SocketAddr, modes: &[ChannelMode], server: RecordingListener) -> Pair {
    let at_server = Rc::new(server);
    let at_client = Rc::new(RecordingListener::default());

    let server = ctx.create_socket(modes).unwrap();
    ctx.set_listener(server, at_server.clone()).unwrap();
    ctx.listen(server, address).unwrap();

    let client = ctx.create_socket(modes).unwrap();
    ctx.set_listener(client, at_client.clone()).unwrap();
    let connected = ctx.connect(client, address).unwrap();
    settle(ctx, |_| !connected.is_pending());
    assert_eq!(connected.state(), PromiseState::Resolved(0));

    Pair {
        server,
        client,
        at_server,
        at_client,
    }
}

impl Pair {
    fn client_session(&self) -> HostObjectId {
        self.at_client.sessions.borrow()[0]
    }
}

fn send_text(ctx: &Context, session: HostObjectId, channel: usize, text: &str) {
    let message = ctx.acquire_message().unwrap();
    ctx.message_write(message, text.as_bytes()).unwrap();
    assert!(ctx.session_send(session, channel, message).unwrap());
}

#[test]
fn test_connect_receive_and_echo() {
    let ctx = native_context(BridgeConfig::default(), None);
    let pair = connect_pair(
        &ctx,
        "10.0.0.1:9000".parse().unwrap(),
        &[ChannelMode::Reliable, ChannelMode::Unreliable],
        RecordingListener::echoing(),
    );
    assert_eq!(pair.at_server.count("connected"), 1);
    assert_eq!(pair.at_client.count("connected"), 1);

    send_text(&ctx, pair.client_session(), 1, "hello");
    settle(&ctx, |_| pair.at_client.count("received") == 1);

    assert_eq!(*pair.at_server.events.borrow().last().unwrap(), "received:1:hello");
    assert_eq!(*pair.at_client.events.borrow().last().unwrap(), "received:1:hello");
}

#[test]
fn test_received_message_does_not_outlive_callback() {
    struct Keep(RefCell<Vec<HostObjectId>>);

    impl SocketListener for Keep {
        fn on_received(
            &self,
            _ctx: &Context,
            _session: HostObjectId,
            _channel: usize,
            message: HostObjectId,
        ) -> Result<(), HostException> {
            self.0.borrow_mut().push(message);
            Ok(())
        }
    }

    let ctx = native_context(BridgeConfig::default(), None);
    let address = "10.0.0.2:9000".parse().unwrap();
    let keep = Rc::new(Keep(RefCell::new(Vec::new())));
    let server = ctx.create_socket(&[ChannelMode::Reliable]).unwrap();
    ctx.set_listener(server, keep.clone()).unwrap();
    ctx.listen(server, address).unwrap();
    let client = ctx.create_socket(&[ChannelMode::Reliable]).unwrap();
    let at_client = Rc::new(RecordingListener::default());
    ctx.set_listener(client, at_client.clone()).unwrap();
    let connected = ctx.connect(client, address).unwrap();
    settle(&ctx, |_| !connected.is_pending());

    send_text(&ctx, at_client.sessions.borrow()[0], 0, "short-lived");
    settle(&ctx, |_| !keep.0.borrow().is_empty());

    let message = keep.0.borrow()[0];
    assert!(matches!(
        ctx.message_read(message, 16),
        Err(BridgeError::Detached(EntityKind::Message))
    ));
}

#[test]
fn test_listener_exception_reaches_error_handler() {
    let caught: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = Rc::clone(&caught);
    let handler: ErrorHandler =
        Box::new(move |err: &HostException| sink.borrow_mut().push(err.message().to_string()));

    let ctx = native_context(BridgeConfig::default(), Some(handler));
    let pair = connect_pair(
        &ctx,
        "10.0.0.3:9000".parse().unwrap(),
        &[ChannelMode::Reliable],
        RecordingListener::throwing(),
    );

    send_text(&ctx, pair.client_session(), 0, "first");
    send_text(&ctx, pair.client_session(), 0, "second");
    settle(&ctx, |_| caught.borrow().len() == 2);

    assert_eq!(*caught.borrow(), vec!["listener failed", "listener failed"]);
    // Dispatch keeps going after a throw.
    assert_eq!(pair.at_server.count("received"), 2);
}

#[test]
fn test_session_channels() {
    let ctx = native_context(BridgeConfig::default(), None);
    let pair = connect_pair(
        &ctx,
        "10.0.0.4:9000".parse().unwrap(),
        &[ChannelMode::Reliable, ChannelMode::Unreliable],
        RecordingListener::default(),
    );
    let session = pair.at_server.sessions.borrow()[0];

    let channel = ctx.session_channel(session, 1).unwrap();
    assert_eq!(ctx.session_channel(session, 1).unwrap(), channel);
    assert_eq!(ctx.channel_mode(channel).unwrap(), ChannelMode::Unreliable);

    ctx.channel_set_mode(channel, ChannelMode::Sequenced).unwrap();
    assert_eq!(ctx.channel_mode(channel).unwrap(), ChannelMode::Sequenced);

    assert!(matches!(
        ctx.session_channel(session, 5),
        Err(BridgeError::Engine(EngineError::InvalidChannel(5)))
    ));

    let message = ctx.acquire_message().unwrap();
    ctx.message_write(message, b"over channel").unwrap();
    assert!(ctx.channel_send(channel, message).unwrap());
    settle(&ctx, |_| pair.at_client.count("received") == 1);
    assert_eq!(
        *pair.at_client.events.borrow().last().unwrap(),
        "received:1:over channel"
    );

    // Disconnect releases the session and its channels.
    ctx.session_disconnect(session).unwrap();
    settle(&ctx, |_| pair.at_server.count("disconnected") == 1);
    assert!(ctx.channel_mode(channel).is_err());
    assert!(ctx.session_channel(session, 0).is_err());
}

#[test]
fn test_stop_resolves_and_disconnects() {
    let ctx = native_context(BridgeConfig::default(), None);
    let pair = connect_pair(
        &ctx,
        "10.0.0.5:9000".parse().unwrap(),
        &[ChannelMode::Reliable],
        RecordingListener::default(),
    );

    let stopped = ctx.stop(pair.server).unwrap();
    settle(&ctx, |_| !stopped.is_pending());
    assert_eq!(stopped.state(), PromiseState::Resolved(0));
    assert_eq!(pair.at_server.count("disconnected"), 1);
    assert_eq!(pair.at_client.count("disconnected"), 1);

    assert!(matches!(
        ctx.listen(pair.server, "10.0.0.5:9001".parse().unwrap()),
        Err(BridgeError::Engine(EngineError::Closed(EntityKind::Socket)))
    ));
    ctx.close_socket(pair.server).unwrap();
    ctx.close_socket(pair.client).unwrap();
    assert_eq!(ctx.pool_stats(EntityKind::Socket).idle, 2);
}

#[test]
fn test_oversized_payload_is_rejected() {
    let ctx = native_context(BridgeConfig::default(), None);
    let pair = connect_pair(
        &ctx,
        "10.0.0.6:9000".parse().unwrap(),
        &[ChannelMode::Reliable],
        RecordingListener::default(),
    );
    let message = ctx.acquire_message().unwrap();
    ctx.message_write(message, &vec![7u8; 4096]).unwrap();
    assert!(!ctx.session_send(pair.client_session(), 0, message).unwrap());

    // A refused message stays with the caller, payload intact.
    assert_eq!(ctx.message_read(message, 8).unwrap(), vec![7u8; 8]);
    assert_eq!(ctx.pool_stats(EntityKind::Message).idle, 0);
    ctx.release_message(message).unwrap();
}

#[test]
fn test_successful_send_recycles_message() {
    let ctx = native_context(BridgeConfig::default(), None);
    let pair = connect_pair(
        &ctx,
        "10.0.0.9:9000".parse().unwrap(),
        &[ChannelMode::Reliable],
        RecordingListener::default(),
    );

    let message = ctx.acquire_message().unwrap();
    ctx.message_write(message, b"once").unwrap();
    assert!(ctx.session_send(pair.client_session(), 0, message).unwrap());
    assert!(matches!(
        ctx.message_read(message, 4),
        Err(BridgeError::Detached(EntityKind::Message))
    ));
    assert_eq!(ctx.pool_stats(EntityKind::Message).idle, 1);

    // The next acquire reuses the same twin.
    assert_eq!(ctx.acquire_message().unwrap(), message);
    settle(&ctx, |_| pair.at_server.count("received") == 1);
}

#[test]
fn test_socket_send_broadcasts_to_sessions() {
    let ctx = native_context(BridgeConfig::default(), None);
    let address = "10.0.0.10:9000".parse().unwrap();
    let at_server = Rc::new(RecordingListener::default());
    let server = ctx.create_socket(&[ChannelMode::Reliable]).unwrap();
    ctx.set_listener(server, at_server.clone()).unwrap();
    ctx.listen(server, address).unwrap();

    let clients: Vec<Rc<RecordingListener>> = (0..3)
        .map(|_| {
            let listener = Rc::new(RecordingListener::default());
            let client = ctx.create_socket(&[ChannelMode::Reliable]).unwrap();
            ctx.set_listener(client, listener.clone()).unwrap();
            let connected = ctx.connect(client, address).unwrap();
            settle(&ctx, |_| !connected.is_pending());
            listener
        })
        .collect();
    settle(&ctx, |_| at_server.sessions.borrow().len() == 3);
    let sessions = at_server.sessions.borrow().clone();

    let message = ctx.acquire_message().unwrap();
    ctx.message_write(message, b"to all").unwrap();
    assert_eq!(ctx.socket_send(server, 0, message, &sessions).unwrap(), 3);
    assert_eq!(ctx.pool_stats(EntityKind::Message).idle, 1);
    settle(&ctx, |_| clients.iter().all(|c| c.count("received") == 1));
    for client in &clients {
        assert_eq!(*client.events.borrow().last().unwrap(), "received:0:to all");
    }

    // Invalid targets are skipped and counted out; the message is still
    // released.
    let message = ctx.acquire_message().unwrap();
    ctx.message_write(message, b"some").unwrap();
    let targets = [sessions[0], message, sessions[2]];
    assert_eq!(ctx.socket_send(server, 5, message, &targets).unwrap(), 0);
    assert!(ctx.message_read(message, 1).is_err());

    let message = ctx.acquire_message().unwrap();
    assert_eq!(ctx.socket_send(server, 0, message, &targets).unwrap(), 2);

    // No targets: nothing is sent and the message stays usable.
    let message = ctx.acquire_message().unwrap();
    assert_eq!(ctx.socket_send(server, 0, message, &[]).unwrap(), 0);
    ctx.message_write(message, b"kept").unwrap();
}

#[test]
fn test_delegated_backend_dispatches_the_same() {
    let (host, ctx) = delegated_context(BridgeConfig::default());
    assert_eq!(ctx.platform().name(), "delegated");

    let pair = connect_pair(
        &ctx,
        "10.0.0.7:9000".parse().unwrap(),
        &[ChannelMode::Reliable],
        RecordingListener::echoing(),
    );
    send_text(&ctx, pair.client_session(), 0, "via host");
    settle(&ctx, |_| pair.at_client.count("received") == 1);
    assert_eq!(*pair.at_client.events.borrow().last().unwrap(), "received:0:via host");

    // The engine never needs host I/O primitives.
    assert!(host.calls.borrow().is_empty());
}

#[test]
fn test_statistic_serializes() {
    let ctx = native_context(BridgeConfig::default(), None);
    let message = ctx.acquire_message().unwrap();
    ctx.release_message(message).unwrap();

    let value = serde_json::to_value(ctx.statistic()).unwrap();
    assert_eq!(value["platform"]["backend"], "native");
    assert_eq!(value["platform"]["live_executors"], 1);

    let pools = value["pools"].as_array().unwrap();
    assert_eq!(pools.len(), 4);
    assert_eq!(pools[3]["kind"], "message");
    assert_eq!(pools[3]["idle"], 1);
}

#[test]
fn test_teardown_is_idempotent() {
    let ctx = native_context(BridgeConfig::default(), None);
    let socket = ctx.create_socket(&[ChannelMode::Reliable]).unwrap();
    ctx.teardown();
    ctx.teardown();
    assert!(ctx.is_torn_down());
    assert!(!ctx.platform().is_running());
    assert!(ctx.poll(None).is_err());
    // Teardown destroyed every twin.
    assert!(!ctx.heap().is_alive(socket));
    assert!(ctx.listen(socket, "10.0.0.8:1".parse().unwrap()).is_err());
}
