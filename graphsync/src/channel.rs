//! Transport to the rendering surface.

use async_trait::async_trait;
use log::warn;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::protocol::OutboundMessage;

/// Best-effort, duplex-capable message transport.
///
/// `post` reports whether the message reached the surface. A `false` return is
/// an ordinary outcome the dispatcher recovers from, never an error.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn post(&self, message: &OutboundMessage) -> bool;
}

/// Writes one JSON message per line to stdout.
///
/// The writer sits behind an async mutex so concurrent posts never interleave
/// partial lines.
pub struct StdioChannel {
    out: Mutex<Stdout>,
}

impl StdioChannel {
    pub fn new() -> Self {
        Self { out: Mutex::new(tokio::io::stdout()) }
    }
}

impl Default for StdioChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageChannel for StdioChannel {
    async fn post(&self, message: &OutboundMessage) -> bool {
        let mut line = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping unserializable message {}: {e}", message.id);
                return false;
            }
        };
        line.push(b'\n');

        let mut out = self.out.lock().await;
        if let Err(e) = out.write_all(&line).await {
            warn!("stdout write failed: {e}");
            return false;
        }
        if let Err(e) = out.flush().await {
            warn!("stdout flush failed: {e}");
            return false;
        }
        true
    }
}
