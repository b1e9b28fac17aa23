//! Per-kind wrapper state

use super::{Entity, EntityKind, SocketListener};
use crate::host::Deferred;
use crate::pool::WrapperId;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Delivery mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Unreliable,
    Sequenced,
    Reliable,
}

/// Socket wrapper state.
#[derive(Default)]
pub struct SocketData {
    pub listener: Option<Rc<dyn SocketListener>>,
    /// Settled by the engine's connect result
    pub connect_result: Option<Deferred>,
    /// Settled once the socket has stopped
    pub stopped: Option<Deferred>,
    pub channel_modes: Vec<ChannelMode>,
}

impl Entity for SocketData {
    const KIND: EntityKind = EntityKind::Socket;

    fn reset(&mut self) {
        self.listener = None;
        self.connect_result = None;
        self.stopped = None;
        self.channel_modes.clear();
    }
}

/// Session wrapper state.
#[derive(Debug, Default)]
pub struct SessionData {
    /// Channel wrappers created for this session, by channel index
    pub channels: Vec<Option<WrapperId>>,
}

impl SessionData {
    pub fn channel(&self, index: usize) -> Option<WrapperId> {
        self.channels.get(index).copied().flatten()
    }

    pub fn set_channel(&mut self, index: usize, channel: WrapperId) {
        if self.channels.len() <= index {
            self.channels.resize(index + 1, None);
        }
        self.channels[index] = Some(channel);
    }

    /// Remove every nested channel wrapper id.
    pub fn take_channels(&mut self) -> Vec<WrapperId> {
        self.channels.drain(..).flatten().collect()
    }
}

impl Entity for SessionData {
    const KIND: EntityKind = EntityKind::Session;

    fn reset(&mut self) {
        self.channels.clear();
    }
}

/// Channel wrapper state.
#[derive(Debug, Default)]
pub struct ChannelData {
    pub index: usize,
    pub mode: ChannelMode,
}

impl Entity for ChannelData {
    const KIND: EntityKind = EntityKind::Channel;

    fn reset(&mut self) {
        self.index = 0;
        self.mode = ChannelMode::default();
    }
}

/// Message wrapper state: a byte payload with a read cursor.
#[derive(Debug, Default)]
pub struct MessageData {
    payload: Vec<u8>,
    read_pos: usize,
}

impl MessageData {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn write(&mut self, data: &[u8]) {
        self.payload.extend_from_slice(data);
    }

    /// Copy up to `len` unread bytes out of the message.
    pub fn read(&mut self, len: usize) -> Vec<u8> {
        let end = self.read_pos.saturating_add(len).min(self.payload.len());
        let out = self.payload[self.read_pos..end].to_vec();
        self.read_pos = end;
        out
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.read_pos
    }

    /// Replace the contents with received bytes.
    pub fn fill(&mut self, data: &[u8]) {
        self.payload.clear();
        self.payload.extend_from_slice(data);
        self.read_pos = 0;
    }
}

impl Entity for MessageData {
    const KIND: EntityKind = EntityKind::Message;

    fn reset(&mut self) {
        self.payload.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{promise, PromiseState};

    #[test]
    fn test_message_read_cursor() {
        let mut message = MessageData::default();
        message.write(b"hello ");
        message.write(b"world");
        assert_eq!(message.read(5), b"hello");
        assert_eq!(message.remaining(), 6);
        assert_eq!(message.read(100), b" world");
        assert_eq!(message.remaining(), 0);

        message.reset();
        assert!(message.payload().is_empty());
    }

    #[test]
    fn test_socket_reset_abandons_pending_promises() {
        let mut socket = SocketData::default();
        let (deferred, promise) = promise();
        socket.connect_result = Some(deferred);
        socket.reset();
        assert_eq!(promise.state(), PromiseState::Abandoned);
    }

    #[test]
    fn test_session_channels() {
        let mut session = SessionData::default();
        let id = WrapperId::from_bits(5);
        session.set_channel(2, id);
        assert_eq!(session.channel(2), Some(id));
        assert_eq!(session.channel(0), None);
        assert_eq!(session.take_channels(), vec![id]);
        assert_eq!(session.channel(2), None);
    }
}
