//! Connection role and resource policy.

use std::time::Duration;

/// Indicates a Client or Server role of the websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This socket is a server.
    Server,
    /// This socket is a client.
    Client,
}

/// Limits and timers applied to one connection.
///
/// # Example
/// ```
/// # use scheelite::policy::Policy;
/// # use std::time::Duration;
/// let policy = Policy::default()
///     .max_message_size(Some(1 << 20))
///     .close_timeout(Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct Policy {
    /// The maximum size of an incoming message (the concatenation of one
    /// fragment chain). `None` means no size limit. The default value is
    /// 64 MiB, big enough for all normal use-cases but small enough to
    /// prevent memory eating by a malicious peer.
    pub max_message_size: Option<usize>,
    /// The maximum payload size of a single incoming frame, checked against
    /// the declared length before any payload is buffered. `None` means no
    /// size limit. The default value is 16 MiB.
    pub max_frame_payload_size: Option<usize>,
    /// Close the connection with 1001 when no inbound traffic arrives for
    /// this long. `None` (the default) disables the idle timer.
    pub idle_timeout: Option<Duration>,
    /// The longest wait between queuing our CLOSE frame and dropping the
    /// transport if the peer never answers. The default value is 10 seconds.
    pub close_timeout: Duration,
    /// Reject sends once this many bytes sit in the outbound queue, instead
    /// of buffering without bound. `None` (the default) means unbounded.
    pub max_outbound_queue_bytes: Option<usize>,
    /// Reply to inbound pings automatically. Defaults to `true`; opt out to
    /// take over pong scheduling in the application.
    pub auto_pong: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_message_size: Some(64 << 20),
            max_frame_payload_size: Some(16 << 20),
            idle_timeout: None,
            close_timeout: Duration::from_secs(10),
            max_outbound_queue_bytes: None,
            auto_pong: true,
        }
    }
}

impl Policy {
    /// Set [`Self::max_message_size`].
    pub fn max_message_size(mut self, max_message_size: Option<usize>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set [`Self::max_frame_payload_size`].
    pub fn max_frame_payload_size(mut self, max_frame_payload_size: Option<usize>) -> Self {
        self.max_frame_payload_size = max_frame_payload_size;
        self
    }

    /// Set [`Self::idle_timeout`].
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set [`Self::close_timeout`].
    pub fn close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Set [`Self::max_outbound_queue_bytes`].
    pub fn max_outbound_queue_bytes(mut self, max_outbound_queue_bytes: Option<usize>) -> Self {
        self.max_outbound_queue_bytes = max_outbound_queue_bytes;
        self
    }

    /// Set [`Self::auto_pong`].
    pub fn auto_pong(mut self, auto_pong: bool) -> Self {
        self.auto_pong = auto_pong;
        self
    }
}
