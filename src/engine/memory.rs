//! In-process engine
//!
//! Connects sockets created by the same engine instance by address, without
//! touching the network. Every effect is reported through the event sink, so
//! it follows the same asynchronous path as a threaded engine would.

use super::{ChannelMode, Engine, EngineError, EngineEvent, EventSink};
use crate::entity::{EntityKind, NativeHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Largest payload accepted by [`MemoryEngine`] by default.
pub const DEFAULT_MAX_PAYLOAD: usize = 1200;

struct SocketState {
    handle: NativeHandle,
    modes: Vec<ChannelMode>,
    listening: Option<SocketAddr>,
    stopped: bool,
}

struct SessionState {
    handle: NativeHandle,
    socket: u64,
    peer: u64,
    channels: Vec<Option<NativeHandle>>,
}

struct ChannelState {
    session: u64,
    index: usize,
    mode: ChannelMode,
}

pub struct MemoryEngine {
    sink: Option<EventSink>,
    next_id: u64,
    max_payload: usize,
    sockets: HashMap<u64, SocketState>,
    sessions: HashMap<u64, SessionState>,
    channels: HashMap<u64, ChannelState>,
    listeners: HashMap<SocketAddr, u64>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            sink: None,
            next_id: 1,
            max_payload,
            sockets: HashMap::new(),
            sessions: HashMap::new(),
            channels: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// Number of open sessions, both sides counted.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn allocate(&mut self, kind: EntityKind) -> NativeHandle {
        let id = self.next_id;
        self.next_id += 1;
        NativeHandle::new(kind, id)
    }

    fn emit(&self, event: EngineEvent) {
        match &self.sink {
            Some(sink) => {
                if let Err(err) = sink.emit(event) {
                    warn!(%err, "engine event dropped");
                }
            }
            None => warn!("engine event without sink"),
        }
    }

    fn open_socket(&self, socket: &NativeHandle) -> Result<&SocketState, EngineError> {
        match self.sockets.get(&socket.id()) {
            Some(state) if state.stopped => Err(EngineError::Closed(EntityKind::Socket)),
            Some(state) => Ok(state),
            None => Err(EngineError::Unknown(EntityKind::Socket)),
        }
    }

    fn open_session(&mut self, socket: u64, peer: u64) -> u64 {
        let handle = self.allocate(EntityKind::Session);
        let id = handle.id();
        let channel_count = self.sockets.get(&socket).map_or(0, |s| s.modes.len());
        self.sessions.insert(
            id,
            SessionState {
                handle,
                socket,
                peer,
                channels: vec![None; channel_count],
            },
        );
        id
    }

    fn send_on(&self, session: u64, channel: usize, payload: &[u8]) -> Result<(), EngineError> {
        let state = self
            .sessions
            .get(&session)
            .ok_or(EngineError::Closed(EntityKind::Session))?;
        if channel >= state.channels.len() {
            return Err(EngineError::InvalidChannel(channel));
        }
        if payload.len() > self.max_payload {
            return Err(EngineError::PayloadTooLarge(payload.len()));
        }
        let peer = self
            .sessions
            .get(&state.peer)
            .ok_or(EngineError::Closed(EntityKind::Session))?;
        let socket = self
            .sockets
            .get(&peer.socket)
            .ok_or(EngineError::Closed(EntityKind::Socket))?;
        self.emit(EngineEvent::Received {
            socket: socket.handle.clone(),
            session: peer.handle.clone(),
            channel,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    /// Close both sides of a session pair and report it.
    fn close_session(&mut self, session: u64) {
        let Some(state) = self.sessions.remove(&session) else {
            return;
        };
        let peer = self.sessions.remove(&state.peer);
        for closed in std::iter::once(state).chain(peer) {
            self.channels.retain(|_, channel| channel.session != closed.handle.id());
            if let Some(socket) = self.sockets.get(&closed.socket) {
                let socket = socket.handle.clone();
                self.emit(EngineEvent::Disconnected {
                    socket,
                    session: closed.handle,
                });
            }
        }
    }

    fn close_sessions_of(&mut self, socket: u64) {
        let owned: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.socket == socket)
            .map(|(&id, _)| id)
            .collect();
        for session in owned {
            self.close_session(session);
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    fn attach(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn create_socket(&mut self, channel_modes: &[ChannelMode]) -> Result<NativeHandle, EngineError> {
        let handle = self.allocate(EntityKind::Socket);
        self.sockets.insert(
            handle.id(),
            SocketState {
                handle: handle.clone(),
                modes: channel_modes.to_vec(),
                listening: None,
                stopped: false,
            },
        );
        Ok(handle)
    }

    fn listen(&mut self, socket: &NativeHandle, address: SocketAddr) -> Result<(), EngineError> {
        self.open_socket(socket)?;
        if self.listeners.contains_key(&address) {
            return Err(EngineError::AddressInUse(address));
        }
        self.listeners.insert(address, socket.id());
        if let Some(state) = self.sockets.get_mut(&socket.id()) {
            state.listening = Some(address);
        }
        debug!(socket = socket.id(), %address, "listening");
        Ok(())
    }

    fn connect(&mut self, socket: &NativeHandle, address: SocketAddr) -> Result<(), EngineError> {
        self.open_socket(socket)?;
        let Some(&listener) = self.listeners.get(&address) else {
            self.emit(EngineEvent::ConnectResult {
                socket: socket.clone(),
                status: -libc::ECONNREFUSED,
            });
            return Ok(());
        };

        let server_session = self.open_session(listener, 0);
        let client_session = self.open_session(socket.id(), server_session);
        if let Some(state) = self.sessions.get_mut(&server_session) {
            state.peer = client_session;
        }

        for (owner, session) in [(listener, server_session), (socket.id(), client_session)] {
            if let (Some(owner), Some(session)) = (self.sockets.get(&owner), self.sessions.get(&session)) {
                self.emit(EngineEvent::Connected {
                    socket: owner.handle.clone(),
                    session: session.handle.clone(),
                });
            }
        }
        self.emit(EngineEvent::ConnectResult {
            socket: socket.clone(),
            status: 0,
        });
        Ok(())
    }

    fn stop(&mut self, socket: &NativeHandle) -> Result<(), EngineError> {
        let listening = self.open_socket(socket)?.listening;
        if let Some(address) = listening {
            self.listeners.remove(&address);
        }
        self.close_sessions_of(socket.id());
        if let Some(state) = self.sockets.get_mut(&socket.id()) {
            state.stopped = true;
            state.listening = None;
        }
        self.emit(EngineEvent::Stopped {
            socket: socket.clone(),
        });
        Ok(())
    }

    fn destroy_socket(&mut self, socket: &NativeHandle) {
        self.close_sessions_of(socket.id());
        if let Some(state) = self.sockets.remove(&socket.id()) {
            if let Some(address) = state.listening {
                self.listeners.remove(&address);
            }
        }
    }

    fn session_send(&mut self, session: &NativeHandle, channel: usize, payload: &[u8]) -> Result<(), EngineError> {
        self.send_on(session.id(), channel, payload)
    }

    fn session_disconnect(&mut self, session: &NativeHandle) -> Result<(), EngineError> {
        if !self.sessions.contains_key(&session.id()) {
            return Err(EngineError::Closed(EntityKind::Session));
        }
        self.close_session(session.id());
        Ok(())
    }

    fn session_channel(&mut self, session: &NativeHandle, index: usize) -> Result<NativeHandle, EngineError> {
        let existing = {
            let state = self
                .sessions
                .get(&session.id())
                .ok_or(EngineError::Closed(EntityKind::Session))?;
            state
                .channels
                .get(index)
                .ok_or(EngineError::InvalidChannel(index))?
                .clone()
        };
        if let Some(channel) = existing {
            return Ok(channel);
        }

        let mode = self
            .sessions
            .get(&session.id())
            .and_then(|s| self.sockets.get(&s.socket))
            .and_then(|s| s.modes.get(index).copied())
            .unwrap_or_default();
        let handle = self.allocate(EntityKind::Channel);
        self.channels.insert(
            handle.id(),
            ChannelState {
                session: session.id(),
                index,
                mode,
            },
        );
        if let Some(state) = self.sessions.get_mut(&session.id()) {
            state.channels[index] = Some(handle.clone());
        }
        Ok(handle)
    }

    fn channel_send(&mut self, channel: &NativeHandle, payload: &[u8]) -> Result<(), EngineError> {
        let state = self
            .channels
            .get(&channel.id())
            .ok_or(EngineError::Closed(EntityKind::Channel))?;
        self.send_on(state.session, state.index, payload)
    }

    fn channel_mode(&self, channel: &NativeHandle) -> Result<ChannelMode, EngineError> {
        self.channels
            .get(&channel.id())
            .map(|c| c.mode)
            .ok_or(EngineError::Closed(EntityKind::Channel))
    }

    fn channel_set_mode(&mut self, channel: &NativeHandle, mode: ChannelMode) -> Result<(), EngineError> {
        let state = self
            .channels
            .get_mut(&channel.id())
            .ok_or(EngineError::Closed(EntityKind::Channel))?;
        state.mode = mode;
        Ok(())
    }

    fn create_message(&mut self) -> NativeHandle {
        self.allocate(EntityKind::Message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, NoopWake};
    use crate::config::BridgeConfig;
    use crossbeam_channel::Receiver;
    use std::sync::Arc;

    fn engine() -> (Bridge, MemoryEngine, Receiver<EngineEvent>) {
        let bridge = Bridge::new(&BridgeConfig::default(), Arc::new(NoopWake)).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut engine = MemoryEngine::new();
        engine.attach(EventSink::new(bridge.acquire_executor().unwrap(), tx));
        (bridge, engine, rx)
    }

    fn events(bridge: &Bridge, rx: &Receiver<EngineEvent>) -> Vec<EngineEvent> {
        bridge.drain();
        rx.try_iter().collect()
    }

    #[test]
    fn test_connect_refused_without_listener() {
        let (bridge, mut engine, rx) = engine();
        let client = engine.create_socket(&[ChannelMode::Reliable]).unwrap();
        engine.connect(&client, "10.0.0.1:40000".parse().unwrap()).unwrap();

        let events = events(&bridge, &rx);
        assert!(matches!(
            events.as_slice(),
            [EngineEvent::ConnectResult { status, .. }] if *status == -libc::ECONNREFUSED
        ));
    }

    #[test]
    fn test_connect_send_disconnect() {
        let (bridge, mut engine, rx) = engine();
        let address: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let server = engine.create_socket(&[ChannelMode::Reliable]).unwrap();
        let client = engine.create_socket(&[ChannelMode::Reliable]).unwrap();
        engine.listen(&server, address).unwrap();
        assert_eq!(
            engine.listen(&client, address),
            Err(EngineError::AddressInUse(address))
        );

        engine.connect(&client, address).unwrap();
        let connected = events(&bridge, &rx);
        assert_eq!(connected.len(), 3);
        assert_eq!(engine.session_count(), 2);
        let session = connected
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::Connected { socket, session } if socket.ptr_eq(&client) => Some(session),
                _ => None,
            })
            .unwrap();

        engine.session_send(&session, 0, b"hello").unwrap();
        assert_eq!(
            engine.session_send(&session, 1, b"x"),
            Err(EngineError::InvalidChannel(1))
        );
        match events(&bridge, &rx).as_slice() {
            [EngineEvent::Received { socket, payload, channel, .. }] => {
                assert!(socket.ptr_eq(&server));
                assert_eq!(*channel, 0);
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected events: {other:?}"),
        }

        engine.stop(&server).unwrap();
        let stopped = events(&bridge, &rx);
        let disconnects = stopped
            .iter()
            .filter(|e| matches!(e, EngineEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 2);
        assert!(matches!(stopped.last(), Some(EngineEvent::Stopped { .. })));
        assert_eq!(engine.session_count(), 0);
        assert_eq!(
            engine.session_send(&session, 0, b"x"),
            Err(EngineError::Closed(EntityKind::Session))
        );
    }

    #[test]
    fn test_channel_mode_follows_socket() {
        let (bridge, mut engine, rx) = engine();
        let address: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let server = engine
            .create_socket(&[ChannelMode::Unreliable, ChannelMode::Sequenced])
            .unwrap();
        let client = engine
            .create_socket(&[ChannelMode::Unreliable, ChannelMode::Sequenced])
            .unwrap();
        engine.listen(&server, address).unwrap();
        engine.connect(&client, address).unwrap();

        let session = events(&bridge, &rx)
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::Connected { socket, session } if socket.ptr_eq(&client) => Some(session),
                _ => None,
            })
            .unwrap();
        let channel = engine.session_channel(&session, 1).unwrap();
        assert!(engine.session_channel(&session, 1).unwrap().ptr_eq(&channel));
        assert_eq!(engine.channel_mode(&channel), Ok(ChannelMode::Sequenced));
        engine.channel_set_mode(&channel, ChannelMode::Reliable).unwrap();
        assert_eq!(engine.channel_mode(&channel), Ok(ChannelMode::Reliable));
        assert!(matches!(
            engine.session_channel(&session, 2),
            Err(EngineError::InvalidChannel(2))
        ));
    }
}
