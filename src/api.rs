//! `Unibird` API Functions
//!
//! Async entry points around the global peer registry. Each call takes the registry
//! lock, waiting at most the given timeout, and releases it before returning.
//! [`registry`] hands the lock out for as long as the caller needs it, e.g. to feed
//! events into a [`UnicastClient`](crate::client::UnicastClient).
//!
//! # Usage
//!
//! ```rust,no_run
//! use embassy_time::Duration;
//! use unibird::api::{add_bonded_peer, get_locations, peer_count};
//! use unibird::{Direction, PeerAddress};
//!
//! # async fn example() -> Result<(), unibird::AudioError> {
//! let timeout = Duration::from_millis(100);
//!
//! // Restore a bonded headset before it reconnects
//! add_bonded_peer(PeerAddress::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]), timeout).await?;
//! assert_eq!(peer_count(timeout).await?, 1);
//!
//! // Which channels the sinks render
//! let locations = get_locations(Direction::Sink, timeout).await?;
//! # let _ = locations;
//! # Ok(())
//! # }
//! ```

use crate::ase::StreamRef;
use crate::client::{self, StreamConfig};
use crate::registry::RegistryGuard;
use crate::{AudioError, AudioLocation, Direction, PEER_REGISTRY, PeerAddress};
use embassy_time::Duration;

/// Lock the global peer registry.
///
/// A zero `timeout` does not wait at all.
///
/// # Errors
/// - `AudioError::Busy` if the lock is taken and `timeout` is zero
/// - `AudioError::Timeout` if the lock was not released in time
#[track_caller]
pub fn registry(
    timeout: Duration,
) -> impl Future<Output = Result<RegistryGuard<'static>, AudioError>> {
    PEER_REGISTRY.lock(timeout)
}

/// Union of the audio locations of every known peer in `dir`
///
/// # Errors
/// Lock errors of [`registry`].
pub async fn get_locations(dir: Direction, timeout: Duration) -> Result<AudioLocation, AudioError> {
    let guard = PEER_REGISTRY.lock(timeout).await?;
    Ok(client::get_locations(&guard, dir))
}

/// Codec parameters of a configured stream
///
/// # Errors
/// Lock errors of [`registry`], or errors of [`client::config_get`].
pub async fn config_get(stream: StreamRef, timeout: Duration) -> Result<StreamConfig, AudioError> {
    let guard = PEER_REGISTRY.lock(timeout).await?;
    client::config_get(&guard, stream)
}

/// Number of known peers, connected or not
///
/// # Errors
/// Lock errors of [`registry`].
pub async fn peer_count(timeout: Duration) -> Result<usize, AudioError> {
    let guard = PEER_REGISTRY.lock(timeout).await?;
    Ok(guard.count())
}

/// Pre-seed a bonded peer so it is known before it reconnects
///
/// # Errors
/// Lock errors of [`registry`], `AudioError::AlreadyExists` or `AudioError::NoSpace`.
pub async fn add_bonded_peer(addr: PeerAddress, timeout: Duration) -> Result<(), AudioError> {
    let mut guard = PEER_REGISTRY.lock(timeout).await?;
    guard.add_by_address(addr)?;
    guard.lookup_by_address(&addr)?.set_bonded(true);
    Ok(())
}

/// Forget a peer
///
/// # Errors
/// Lock errors of [`registry`], `AudioError::NotFound`, or
/// `AudioError::HasActiveConnection` if it is connected and `force` is not set.
pub async fn remove_peer(addr: PeerAddress, force: bool, timeout: Duration) -> Result<(), AudioError> {
    let mut guard = PEER_REGISTRY.lock(timeout).await?;
    guard.remove(&addr, force)
}
