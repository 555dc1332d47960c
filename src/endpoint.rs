//! The application-facing callback surface.

use crate::{error::Error, message::Message, session::CloseInfo};
use bytes::Bytes;

/// Callbacks a [`Connection`](crate::connection::Connection) delivers
/// protocol events to.
///
/// Every method has a no-op default, so an implementor only overrides what
/// it cares about. Callbacks run on the thread driving the connection.
pub trait Endpoint {
    /// One whole TEXT or BINARY message.
    fn on_message(&mut self, message: Message) {
        let _ = message;
    }

    /// An inbound PING. The pong reply is queued automatically unless the
    /// policy opted out; send a custom one here if it did.
    fn on_ping(&mut self, payload: &Bytes) {
        let _ = payload;
    }

    /// An inbound PONG.
    fn on_pong(&mut self, payload: &Bytes) {
        let _ = payload;
    }

    /// The connection reached its terminal state. Delivered exactly once,
    /// with the effective close code (possibly the synthetic 1005/1006).
    fn on_close(&mut self, close: &CloseInfo) {
        let _ = close;
    }

    /// The connection failed. Delivered at most once, before `on_close`.
    fn on_error(&mut self, error: &Error) {
        let _ = error;
    }
}
