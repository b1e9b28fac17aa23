use crate::context::Context;
use crate::host::{HostException, HostObjectId};

/// Host callbacks attached to a socket.
///
/// Called on the consumer thread while dispatching engine events. A thrown
/// exception is routed to the context's error handler; it never reaches the
/// engine.
pub trait SocketListener {
    fn on_connected(&self, _ctx: &Context, _session: HostObjectId) -> Result<(), HostException> {
        Ok(())
    }

    fn on_disconnected(&self, _ctx: &Context, _session: HostObjectId) -> Result<(), HostException> {
        Ok(())
    }

    /// `message` is only valid for the duration of the call.
    fn on_received(
        &self,
        _ctx: &Context,
        _session: HostObjectId,
        _channel: usize,
        _message: HostObjectId,
    ) -> Result<(), HostException> {
        Ok(())
    }
}
