//! Sidecar connectivity core for the Scholar desktop client.
//!
//! The tutoring backend runs as a locally-spawned process (the sidecar) and
//! is reachable over HTTP on a dynamically assigned port, only after an
//! asynchronous discovery handshake. This crate owns everything between the
//! UI layer and that transport:
//!
//! - [`discovery::DiscoveryCoordinator`] races the host runtime's push
//!   notifications against a bounded pull poll to establish a
//!   [`client::ConnectionDescriptor`], and publishes a tri-state
//!   [`discovery::SidecarStatus`].
//! - [`client::ApiClient`] holds the descriptor and executes
//!   `get`/`post`/`delete`/`stream` calls with host fallback, rate-limit
//!   backoff, and error normalization into [`error::ApiError`].
//! - [`stream`] turns raw stream chunks into semantic text/error events.
//!
//! Construction and teardown are explicit: the host runtime builds an
//! `Arc<ApiClient>` and a `SidecarEvents` hub, starts the coordinator, and
//! calls `shutdown()` on exit. There are no ambient globals.

pub mod client;
pub mod discovery;
pub mod error;
pub mod stream;

pub use client::{ApiClient, ConnectionDescriptor, TOKEN_HEADER};
pub use discovery::{
    DiscoveryCoordinator, SidecarEvent, SidecarEvents, SidecarStatus, POLL_ATTEMPTS, POLL_INTERVAL,
};
pub use error::{ApiError, Result};
pub use stream::{decode_chat_chunk, decode_chunk, extract_chat_text, StreamEvent};
