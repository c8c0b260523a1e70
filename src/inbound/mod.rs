//! Inbound listeners

mod socks5;

pub use socks5::Socks5Listener;

use crate::Result;
use async_trait::async_trait;

/// A listening front end that accepts client connections
#[async_trait]
pub trait InboundListener: Send + Sync {
    /// Listener name for logging
    fn name(&self) -> &str;

    /// Run the accept loop until stopped
    async fn start(&self) -> Result<()>;

    /// Stop accepting new connections
    async fn stop(&self) -> Result<()>;
}
