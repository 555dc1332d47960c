use std::fmt;

/// Indicates the specific type/cause of a capacity error.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum CapacityError {
    /// Message is bigger than the maximum allowed size.
    MessageTooLong {
        /// The size of the message.
        size: usize,
        /// The maximum allowed message size.
        max_size: usize,
    },
    /// A single frame payload is bigger than the maximum allowed size.
    FrameTooLong {
        /// The payload size declared by the frame header.
        size: usize,
        /// The maximum allowed frame payload size.
        max_size: usize,
    },
    /// The outbound queue is full; the send was rejected rather than blocked.
    SendQueueFull {
        /// Bytes currently queued for the transport.
        queued: usize,
        /// The configured queue bound.
        max_bytes: usize,
    },
}

impl fmt::Debug for CapacityError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MessageTooLong { size, max_size } => {
                write!(f, "Message too long: {} > {}", size, max_size)
            }
            Self::FrameTooLong { size, max_size } => {
                write!(f, "Frame too long: {} > {}", size, max_size)
            }
            Self::SendQueueFull { queued, max_bytes } => {
                write!(f, "Outbound queue full: {} queued, limit {}", queued, max_bytes)
            }
        }
    }
}

impl fmt::Display for CapacityError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for CapacityError {}
