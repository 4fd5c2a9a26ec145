mod dialer;
mod handler;
mod http1;
mod mitm;
mod server;
mod transport;

pub use dialer::SafeDialer;
pub use server::{ProxyServer, ServerError};

/// Read/write chunk size on both legs.
pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;

/// Cap on an inbound request head.
pub const MAX_REQUEST_HEAD_BYTES: usize = 1 << 20;

/// Cap on an outbound response head.
pub(crate) const MAX_RESPONSE_HEAD_BYTES: usize = 1 << 20;
