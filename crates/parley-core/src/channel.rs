//! Boundary to the encrypted store-and-forward transport.

use async_trait::async_trait;

use crate::error::ChannelError;

/// Remote address together with the identity key we currently trust for
/// it.  `trusted_key` is `None` until a key has been pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub address: String,
    pub trusted_key: Option<[u8; 32]>,
}

/// Sends opaque payloads to a remote peer.
///
/// Implementations must attempt delivery on every call and must report a
/// changed remote identity as [`ChannelError::UntrustedIdentity`] rather
/// than as a transport failure.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    async fn send(&self, recipient: &RemoteIdentity, payload: &[u8]) -> Result<(), ChannelError>;
}
