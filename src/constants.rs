//! `Unibird` Constants
//!
//! Compile-time capacities and protocol values used throughout the `Unibird` library.
//! Every table in the crate is fixed-size, so these limits decide how many peers,
//! endpoints and streams a build can track.

/// Maximum number of simultaneous LE ACL connections
pub const MAX_CONNECTIONS: usize = 4;

/// Maximum number of bonded peers kept while disconnected
pub const MAX_PAIRED: usize = 4;

/// Number of peer slots in the registry
pub const MAX_PEERS: usize = MAX_CONNECTIONS + MAX_PAIRED;

/// Audio stream endpoints per direction embedded in every peer
pub const MAX_ASE_PER_DIR: usize = 2;

/// Remote endpoints remembered per direction during discovery
pub const MAX_ENDPOINTS_PER_DIR: usize = 2;

/// Codec capability records remembered per direction
pub const MAX_CODEC_CAPS: usize = 4;

/// Maximum size of a codec capability or configuration LTV blob in bytes
pub const MAX_CODEC_DATA: usize = 19;

/// Maximum number of sink/source pairs in the unicast group
pub const MAX_GROUP_PAIRS: usize = MAX_CONNECTIONS * MAX_ASE_PER_DIR;

/// Maximum number of streams in the unicast group
pub const MAX_GROUP_STREAMS: usize = MAX_GROUP_PAIRS * 2;

/// Maximum number of procedures waiting behind the one in flight
pub const MAX_PENDING_PROCEDURES: usize = MAX_GROUP_STREAMS;

/// Maximum device name length in bytes
pub const MAX_DEVICE_NAME_LENGTH: usize = 32;

/// `BD_ADDR` length in bytes
pub const BD_ADDR_LENGTH: usize = 6;

/// Identifier of the single unicast group
pub const GROUP_ID: u8 = 0;

/// Default wait for the registry lock in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;
