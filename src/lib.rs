#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines)]

#[macro_use]
mod fmt;

mod address;
pub mod api;
pub mod ase;
pub mod client;
pub mod codec;
pub mod constants;
pub mod group;
pub mod procedure;
pub mod qos;
pub mod registry;
pub mod transport;

use crate::constants::DEFAULT_LOCK_TIMEOUT_MS;
use crate::group::PackingMode;
use crate::registry::SharedRegistry;

pub use address::{AddressType, Connection, PeerAddress};
pub use ase::{AudioStreamEndpoint, EndpointState, StreamRef, Trigger};
pub use client::{StreamConfig, UnicastClient};
pub use registry::{PeerDevice, PeerRegistry, RegistryGuard};
pub use transport::{AudioEvent, AudioTransport};

/// Global peer registry, reached through [`api::registry`]
pub(crate) static PEER_REGISTRY: SharedRegistry = SharedRegistry::new();

/// Audio direction as seen from the remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// The remote renders audio sent by this client
    Sink,
    /// The remote captures audio sent to this client
    Source,
}

impl Direction {
    /// Both directions, sink first
    pub const ALL: [Direction; 2] = [Direction::Sink, Direction::Source];

    /// Array index of the direction
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Direction::Sink => 0,
            Direction::Source => 1,
        }
    }

    /// The other direction
    #[must_use]
    pub const fn opposite(self) -> Direction {
        match self {
            Direction::Sink => Direction::Source,
            Direction::Source => Direction::Sink,
        }
    }
}

/// Directions covered by a discovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoverDirection {
    /// Sink endpoints only
    Sink,
    /// Source endpoints only
    Source,
    /// Sink endpoints, then source endpoints
    #[default]
    Bidirectional,
}

/// Audio location bitmask
///
/// An empty mask means mono audio, which still counts as one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioLocation(pub u32);

impl AudioLocation {
    /// Mono audio, no specific location
    pub const MONO_AUDIO: AudioLocation = AudioLocation(0);
    /// Front left
    pub const FRONT_LEFT: AudioLocation = AudioLocation(0x0000_0001);
    /// Front right
    pub const FRONT_RIGHT: AudioLocation = AudioLocation(0x0000_0002);
    /// Front center
    pub const FRONT_CENTER: AudioLocation = AudioLocation(0x0000_0004);
    /// Low frequency effects 1
    pub const LOW_FREQ_EFFECTS_1: AudioLocation = AudioLocation(0x0000_0008);
    /// Back left
    pub const BACK_LEFT: AudioLocation = AudioLocation(0x0000_0010);
    /// Back right
    pub const BACK_RIGHT: AudioLocation = AudioLocation(0x0000_0020);
    /// Side left
    pub const SIDE_LEFT: AudioLocation = AudioLocation(0x0400_0000);
    /// Side right
    pub const SIDE_RIGHT: AudioLocation = AudioLocation(0x0800_0000);

    /// Number of audio channels the mask describes
    #[must_use]
    pub const fn channel_count(self) -> u32 {
        let count = self.0.count_ones();
        if count == 0 { 1 } else { count }
    }

    /// The `n`th location bit of the mask, counting from the least significant.
    ///
    /// Mono, or `n` past the last channel, gives [`AudioLocation::MONO_AUDIO`].
    #[must_use]
    pub const fn nth_channel(self, n: usize) -> AudioLocation {
        let mut remaining = self.0;
        let mut i = 0;
        while remaining != 0 {
            let bit = remaining & remaining.wrapping_neg();
            if i == n {
                return AudioLocation(bit);
            }
            remaining &= !bit;
            i += 1;
        }
        AudioLocation::MONO_AUDIO
    }

    /// Locations present in either mask
    #[must_use]
    pub const fn union(self, other: AudioLocation) -> AudioLocation {
        AudioLocation(self.0 | other.0)
    }

    /// Whether every location of `other` is present
    #[must_use]
    pub const fn contains(self, other: AudioLocation) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Audio context bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioContext(pub u16);

impl AudioContext {
    /// No context allowed
    pub const PROHIBITED: AudioContext = AudioContext(0);
    /// Unspecified
    pub const UNSPECIFIED: AudioContext = AudioContext(0x0001);
    /// Conversation between humans
    pub const CONVERSATIONAL: AudioContext = AudioContext(0x0002);
    /// Media playback
    pub const MEDIA: AudioContext = AudioContext(0x0004);
    /// Game audio
    pub const GAME: AudioContext = AudioContext(0x0008);
    /// Instructional audio
    pub const INSTRUCTIONAL: AudioContext = AudioContext(0x0010);
    /// Man-machine communication
    pub const VOICE_ASSISTANTS: AudioContext = AudioContext(0x0020);
    /// Live audio
    pub const LIVE: AudioContext = AudioContext(0x0040);
    /// Sound effects
    pub const SOUND_EFFECTS: AudioContext = AudioContext(0x0080);
    /// Notifications
    pub const NOTIFICATIONS: AudioContext = AudioContext(0x0100);
    /// Ringtone
    pub const RINGTONE: AudioContext = AudioContext(0x0200);
    /// Alerts
    pub const ALERTS: AudioContext = AudioContext(0x0400);
    /// Emergency alarm
    pub const EMERGENCY_ALARM: AudioContext = AudioContext(0x0800);

    /// Contexts present in either mask
    #[must_use]
    pub const fn union(self, other: AudioContext) -> AudioContext {
        AudioContext(self.0 | other.0)
    }

    /// Whether every context of `other` is present
    #[must_use]
    pub const fn contains(self, other: AudioContext) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Options for configuring a [`UnicastClient`]
///
/// # Examples
///
/// ```rust
/// use unibird::UnicastClientOptions;
/// use unibird::group::PackingMode;
///
/// // Headsets that only do 24 kHz, interleaved CISes
/// let options = UnicastClientOptions {
///     preferred_sink_rate_hz: 24_000,
///     preferred_source_rate_hz: 24_000,
///     packing: PackingMode::Interleaved,
///     ..UnicastClientOptions::default()
/// };
/// assert!(options.discover_on_connect);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UnicastClientOptions {
    /// Sampling rate preferred when picking a sink preset
    pub preferred_sink_rate_hz: u32,
    /// Sampling rate preferred when picking a source preset
    pub preferred_source_rate_hz: u32,
    /// CIS packing of the group
    pub packing: PackingMode,
    /// How long API calls wait for the registry lock, in milliseconds.
    /// Zero fails at once with `AudioError::Busy` when the lock is taken.
    pub lock_timeout_ms: u64,
    /// Discover a peer as soon as it connects
    pub discover_on_connect: bool,
    /// Directions discovered on connection
    pub discover_direction: DiscoverDirection,
}

impl Default for UnicastClientOptions {
    fn default() -> Self {
        Self {
            preferred_sink_rate_hz: 48_000,
            preferred_source_rate_hz: 48_000,
            packing: PackingMode::Sequential,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            discover_on_connect: true,
            discover_direction: DiscoverDirection::Bidirectional,
        }
    }
}

impl UnicastClientOptions {
    /// Preferred sampling rate for `dir`
    #[must_use]
    pub const fn preferred_sample_rate(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Sink => self.preferred_sink_rate_hz,
            Direction::Source => self.preferred_source_rate_hz,
        }
    }
}

/// Unicast audio errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AudioError {
    /// Malformed or missing parameter
    InvalidArgument,
    /// No such peer or stream
    NotFound,
    /// The peer has no live connection, or another one
    NotConnected,
    /// The entry already exists
    AlreadyExists,
    /// Another connection is already bound
    AlreadyBound,
    /// This connection is already bound
    AlreadySame,
    /// The connection leads to another peer
    AddressMismatch,
    /// The operation is not allowed on this entry
    PermissionDenied,
    /// The peer still has a live connection
    HasActiveConnection,
    /// A fixed-capacity store is full
    NoSpace,
    /// QoS ranges of the group do not overlap
    NoCommonGround,
    /// Illegal endpoint transition
    InvalidState,
    /// Lock or procedure gate is taken
    Busy,
    /// Gave up waiting for a lock
    Timeout,
    /// Iteration stopped early by the callback
    Cancelled,
    /// The host stack does not provide this request
    Unsupported,
    /// More than one entry claims the same stream
    Ambiguous,
    /// Internal state is inconsistent
    Corruption,
    /// No peer has a stream to build a group from
    NoValidStreams,
}

impl AudioError {
    /// Whether the error only reports that the request was already satisfied
    #[must_use]
    pub const fn is_already(self) -> bool {
        matches!(
            self,
            AudioError::AlreadyExists | AudioError::AlreadyBound | AudioError::AlreadySame
        )
    }

    /// Whether the error means a broken internal invariant
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, AudioError::Ambiguous | AudioError::Corruption)
    }
}

impl core::fmt::Display for AudioError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            AudioError::InvalidArgument => "invalid argument",
            AudioError::NotFound => "not found",
            AudioError::NotConnected => "not connected",
            AudioError::AlreadyExists => "already exists",
            AudioError::AlreadyBound => "already bound to another connection",
            AudioError::AlreadySame => "already bound to this connection",
            AudioError::AddressMismatch => "address mismatch",
            AudioError::PermissionDenied => "permission denied",
            AudioError::HasActiveConnection => "peer still connected",
            AudioError::NoSpace => "no space left",
            AudioError::NoCommonGround => "no common QoS ground",
            AudioError::InvalidState => "invalid endpoint state",
            AudioError::Busy => "busy",
            AudioError::Timeout => "timed out",
            AudioError::Cancelled => "cancelled",
            AudioError::Unsupported => "unsupported",
            AudioError::Ambiguous => "ambiguous stream owner",
            AudioError::Corruption => "registry corruption",
            AudioError::NoValidStreams => "no valid streams",
        };
        f.write_str(msg)
    }
}

/// Report a broken invariant: loud in debug builds, logged and refused in release.
///
/// Only the fatal kinds (`Ambiguous`, `Corruption`) trip the debug assertion; any
/// other error is logged and handed back unchanged.
#[track_caller]
pub(crate) fn fatal(err: AudioError) -> AudioError {
    error!("[UNIBIRD] Invariant violated: {}", err);
    debug_assert!(!err.is_fatal(), "invariant violated: {}", err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_count() {
        assert_eq!(AudioLocation::MONO_AUDIO.channel_count(), 1);
        assert_eq!(AudioLocation::FRONT_LEFT.channel_count(), 1);
        assert_eq!(
            AudioLocation::FRONT_LEFT
                .union(AudioLocation::FRONT_RIGHT)
                .channel_count(),
            2
        );
    }

    #[test]
    fn test_nth_channel() {
        let stereo = AudioLocation::FRONT_LEFT.union(AudioLocation::FRONT_RIGHT);
        assert_eq!(stereo.nth_channel(0), AudioLocation::FRONT_LEFT);
        assert_eq!(stereo.nth_channel(1), AudioLocation::FRONT_RIGHT);
        assert_eq!(stereo.nth_channel(2), AudioLocation::MONO_AUDIO);
        assert_eq!(
            AudioLocation::MONO_AUDIO.nth_channel(0),
            AudioLocation::MONO_AUDIO
        );

        let sides = AudioLocation::SIDE_RIGHT.union(AudioLocation::FRONT_CENTER);
        assert_eq!(sides.nth_channel(1), AudioLocation::SIDE_RIGHT);
    }

    #[test]
    fn test_context_contains() {
        let ctx = AudioContext::MEDIA.union(AudioContext::CONVERSATIONAL);
        assert!(ctx.contains(AudioContext::MEDIA));
        assert!(!ctx.contains(AudioContext::GAME));
        assert!(ctx.contains(AudioContext::PROHIBITED));
    }

    #[test]
    fn test_direction_helpers() {
        assert_eq!(Direction::Sink.opposite(), Direction::Source);
        assert_eq!(Direction::ALL.map(Direction::index), [0, 1]);
    }

    #[test]
    fn test_error_kinds() {
        assert!(AudioError::AlreadySame.is_already());
        assert!(!AudioError::NotFound.is_already());
        assert!(AudioError::Corruption.is_fatal());
        assert!(!AudioError::Busy.is_fatal());
    }

    #[test]
    fn test_options_default() {
        let options = UnicastClientOptions::default();
        assert_eq!(options.preferred_sample_rate(Direction::Sink), 48_000);
        assert_eq!(options.packing, PackingMode::Sequential);
        assert_eq!(options.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
        assert_eq!(options.discover_direction, DiscoverDirection::Bidirectional);
    }

    #[test]
    fn test_fatal_passes_other_errors_through() {
        assert_eq!(fatal(AudioError::NotFound), AudioError::NotFound);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn test_fatal_trips_on_corruption() {
        assert_eq!(fatal(AudioError::Corruption), AudioError::Corruption);
    }
}
