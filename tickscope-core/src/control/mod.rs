//! Display/agent control protocol.
//!
//! ```text
//! agent ──┐                      ┌── display (at most one)
//! agent ──┼──▶ ControlChannel ◀──┘
//! agent ──┘      │    ▲
//!                │    └── publish(capture_*)  ◀── store pump, derivation jobs
//!                └──────▶ Dispatch::Server    ──▶ store.handle_server_command
//! ```
//!
//! - [`protocol`]: envelopes, classification, close codes, capture builders
//! - [`queue`]: drop-oldest buffers used while no display is connected
//! - [`channel`]: session table, routing, replay on display (re)connect

mod channel;
mod protocol;
mod queue;

pub use channel::{
    ChannelStatus, ControlChannel, Dispatch, Registration, SessionHandle, SessionSender,
};
pub use protocol::{
    capture_append, capture_components, capture_end, capture_init, capture_removed, capture_tick,
    classify, CommandClass, Envelope, Outbound, RegisterRequest, Role, CAPTURE_STREAM,
    CLOSE_DISPLAY_BUSY, CLOSE_DISPLAY_REPLACED, CLOSE_PROTOCOL_ERROR, MAX_MESSAGE_BYTES,
    QUEUEABLE, RESPONSE_REQUIRED, SERVER_COMMANDS,
};
pub use queue::{BoundedQueue, CaptureBuffers};
