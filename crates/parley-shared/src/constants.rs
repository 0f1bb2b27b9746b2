/// Wire protocol version carried in every envelope
pub const PROTOCOL_VERSION: u16 = 1;

/// Wallet address length in bytes (before hex encoding)
pub const ADDRESS_SIZE: usize = 20;

/// Gap between two consecutive messages after which a timestamp marker is
/// inserted into the conversation (15 minutes).
pub const TIMESTAMP_MARKER_GAP_SECS: i64 = 15 * 60;

/// Maximum serialized payload size in bytes (256 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 262_144;

/// Key derivation context (BLAKE3)
pub const KDF_CONTEXT_ADDRESS: &str = "parley-wallet-address-v1";
