//! Peer Registry
//!
//! Fixed-capacity store of remote audio devices. Each occupied slot owns a
//! [`PeerDevice`], and each device owns its embedded audio stream endpoints, so an
//! endpoint is only ever reached through the registry.
//!
//! The registry itself is only handed out behind [`SharedRegistry`]'s lock:
//!
//! ```rust,compile_fail
//! // There is no public constructor; a registry comes from `SharedRegistry::lock`.
//! let registry = unibird::registry::PeerRegistry::new();
//! ```

use crate::address::{Connection, PeerAddress};
use crate::ase::{AudioStreamEndpoint, EndpointDescriptor, EndpointState, StreamRef};
use crate::codec::{CodecCapability, Preset};
use crate::constants::{
    MAX_ASE_PER_DIR, MAX_CODEC_CAPS, MAX_DEVICE_NAME_LENGTH, MAX_ENDPOINTS_PER_DIR, MAX_PEERS,
};
use crate::{AudioContext, AudioError, AudioLocation, Direction, fatal};
use core::cell::Cell;
use core::ops::{ControlFlow, Deref, DerefMut};
use core::panic::Location;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, Timer};
use heapless::{String, Vec};

/// Per-direction discovery state of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionInfo {
    pub(crate) endpoints: Vec<EndpointDescriptor, MAX_ENDPOINTS_PER_DIR>,
    pub(crate) codec_caps: Vec<CodecCapability, MAX_CODEC_CAPS>,
    pub(crate) preset: Option<Preset>,
    pub(crate) locations: AudioLocation,
    pub(crate) supported_ctx: AudioContext,
    pub(crate) available_ctx: AudioContext,
    pub(crate) waiting_for_disc: bool,
    pub(crate) streams: [AudioStreamEndpoint; MAX_ASE_PER_DIR],
}

impl DirectionInfo {
    fn new(slot: u8, generation: u8, dir: Direction) -> Self {
        Self {
            endpoints: Vec::new(),
            codec_caps: Vec::new(),
            preset: None,
            locations: AudioLocation::MONO_AUDIO,
            supported_ctx: AudioContext::PROHIBITED,
            available_ctx: AudioContext::PROHIBITED,
            waiting_for_disc: false,
            streams: core::array::from_fn(|i| {
                AudioStreamEndpoint::new(StreamRef::new(slot, generation, dir, i as u8))
            }),
        }
    }

    /// Everything learned during a session; endpoints are left alone
    fn clear_session(&mut self) {
        self.endpoints.clear();
        self.codec_caps.clear();
        self.preset = None;
        self.locations = AudioLocation::MONO_AUDIO;
        self.supported_ctx = AudioContext::PROHIBITED;
        self.available_ctx = AudioContext::PROHIBITED;
        self.waiting_for_disc = false;
    }

    /// Drop what an earlier discovery of this direction found
    pub(crate) fn begin_discovery(&mut self) {
        self.endpoints.clear();
        self.codec_caps.clear();
        self.preset = None;
        self.waiting_for_disc = true;
    }

    /// Remote endpoints found during discovery
    #[must_use]
    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    /// Codec capability records found during discovery
    #[must_use]
    pub fn codec_capabilities(&self) -> &[CodecCapability] {
        &self.codec_caps
    }

    /// Selected preset
    #[must_use]
    pub fn preset(&self) -> Option<&Preset> {
        self.preset.as_ref()
    }

    /// Audio locations
    #[must_use]
    pub fn locations(&self) -> AudioLocation {
        self.locations
    }

    /// Supported audio contexts
    #[must_use]
    pub fn supported_contexts(&self) -> AudioContext {
        self.supported_ctx
    }

    /// Available audio contexts
    #[must_use]
    pub fn available_contexts(&self) -> AudioContext {
        self.available_ctx
    }

    /// Whether discovery of this direction is in progress
    #[must_use]
    pub fn waiting_for_discovery(&self) -> bool {
        self.waiting_for_disc
    }

    /// Embedded audio stream endpoints
    #[must_use]
    pub fn streams(&self) -> &[AudioStreamEndpoint] {
        &self.streams
    }

    /// Number of endpoints this direction can stream with:
    /// one per discovered endpoint, at most one per audio channel.
    #[must_use]
    pub fn stream_budget(&self) -> usize {
        self.endpoints
            .len()
            .min(self.locations.channel_count() as usize)
            .min(MAX_ASE_PER_DIR)
    }
}

/// A remote audio device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDevice {
    pub(crate) addr: PeerAddress,
    pub(crate) name: String<MAX_DEVICE_NAME_LENGTH>,
    pub(crate) conn: Option<Connection>,
    pub(crate) bonded: bool,
    pub(crate) sink: DirectionInfo,
    pub(crate) source: DirectionInfo,
}

impl PeerDevice {
    fn new(addr: PeerAddress, slot: u8, generation: u8) -> Self {
        Self {
            addr,
            name: String::new(),
            conn: None,
            bonded: false,
            sink: DirectionInfo::new(slot, generation, Direction::Sink),
            source: DirectionInfo::new(slot, generation, Direction::Source),
        }
    }

    /// Peer address
    #[must_use]
    pub fn address(&self) -> PeerAddress {
        self.addr
    }

    /// Device name, empty until known
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the device name, truncated to `MAX_DEVICE_NAME_LENGTH` bytes
    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars() {
            if self.name.push(c).is_err() {
                break;
            }
        }
    }

    /// Live connection, if any
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.conn
    }

    /// Whether a live connection is attached
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Whether the peer is bonded
    #[must_use]
    pub fn is_bonded(&self) -> bool {
        self.bonded
    }

    /// Mark the peer as bonded
    pub fn set_bonded(&mut self, bonded: bool) {
        self.bonded = bonded;
    }

    /// Per-direction state
    #[must_use]
    pub fn dir(&self, dir: Direction) -> &DirectionInfo {
        match dir {
            Direction::Sink => &self.sink,
            Direction::Source => &self.source,
        }
    }

    pub(crate) fn dir_mut(&mut self, dir: Direction) -> &mut DirectionInfo {
        match dir {
            Direction::Sink => &mut self.sink,
            Direction::Source => &mut self.source,
        }
    }

    /// Every embedded endpoint, sinks first
    pub fn streams(&self) -> impl Iterator<Item = &AudioStreamEndpoint> {
        self.sink.streams.iter().chain(self.source.streams.iter())
    }

    pub(crate) fn streams_mut(&mut self) -> impl Iterator<Item = &mut AudioStreamEndpoint> {
        self.sink
            .streams
            .iter_mut()
            .chain(self.source.streams.iter_mut())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u8,
    device: Option<PeerDevice>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        generation: 0,
        device: None,
    };
}

/// Store of every known peer
#[derive(Debug)]
pub struct PeerRegistry {
    slots: [Slot; MAX_PEERS],
}

impl PeerRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { Slot::EMPTY }; MAX_PEERS],
        }
    }

    fn find_mut(&mut self, addr: &PeerAddress) -> Option<&mut PeerDevice> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.device.as_mut())
            .find(|device| device.addr == *addr)
    }

    fn insert(&mut self, addr: PeerAddress, conn: Option<Connection>) -> Result<(), AudioError> {
        let Some((index, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.device.is_none())
        else {
            warn!("[REGISTRY] No free slot for {}", addr);
            return Err(AudioError::NoSpace);
        };

        let mut device = PeerDevice::new(addr, index as u8, slot.generation);
        device.conn = conn;
        slot.device = Some(device);
        debug!("[REGISTRY] Added {} in slot {}", addr, index);
        Ok(())
    }

    /// Create an entry for a freshly connected peer.
    ///
    /// If the peer is already known the connection is re-attached to it.
    ///
    /// # Errors
    /// - `AudioError::AlreadyExists` if the peer was already known (the connection is
    ///   attached anyway)
    /// - `AudioError::NoSpace` if every slot is taken
    pub fn add_by_connection(&mut self, conn: Connection) -> Result<(), AudioError> {
        if let Some(device) = self.find_mut(&conn.peer) {
            match device.conn {
                Some(current) if current == conn => {}
                Some(current) => {
                    warn!(
                        "[REGISTRY] {} replacing connection {} with {}",
                        conn.peer,
                        current.raw_handle(),
                        conn.raw_handle()
                    );
                }
                None => debug!("[REGISTRY] Re-attaching {}", conn.peer),
            }
            device.conn = Some(conn);
            return Err(AudioError::AlreadyExists);
        }
        self.insert(conn.peer, Some(conn))
    }

    /// Pre-seed an entry with no live connection, e.g. from bonding data.
    ///
    /// # Errors
    /// - `AudioError::AlreadyExists` if the peer is already known
    /// - `AudioError::NoSpace` if every slot is taken
    pub fn add_by_address(&mut self, addr: PeerAddress) -> Result<(), AudioError> {
        if self.exists(&addr) {
            return Err(AudioError::AlreadyExists);
        }
        self.insert(addr, None)
    }

    /// Whether `addr` has an entry
    #[must_use]
    pub fn exists(&self, addr: &PeerAddress) -> bool {
        self.peer(addr).is_some()
    }

    /// Number of occupied entries
    #[must_use]
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.device.is_some()).count()
    }

    /// Read-only lookup by address
    #[must_use]
    pub fn peer(&self, addr: &PeerAddress) -> Option<&PeerDevice> {
        self.peers().find(|device| device.addr == *addr)
    }

    /// Every occupied entry in slot order
    pub fn peers(&self) -> impl Iterator<Item = &PeerDevice> {
        self.slots.iter().filter_map(|slot| slot.device.as_ref())
    }

    /// # Errors
    /// `AudioError::NotFound` if `addr` has no entry.
    pub fn lookup_by_address(&mut self, addr: &PeerAddress) -> Result<&mut PeerDevice, AudioError> {
        self.find_mut(addr).ok_or(AudioError::NotFound)
    }

    /// Look up the entry a connection belongs to.
    ///
    /// # Errors
    /// - `AudioError::NotFound` if the connection's peer has no entry
    /// - `AudioError::NotConnected` if the entry holds a different connection or none
    pub fn lookup_by_connection(&mut self, conn: Connection) -> Result<&mut PeerDevice, AudioError> {
        let device = self.find_mut(&conn.peer).ok_or(AudioError::NotFound)?;
        if device.conn != Some(conn) {
            return Err(AudioError::NotConnected);
        }
        Ok(device)
    }

    /// Find the entry owning the endpoint `stream` by scanning every embedded endpoint.
    ///
    /// # Errors
    /// - `AudioError::NotFound` if no entry owns the endpoint
    /// - `AudioError::Ambiguous` if more than one does (fatal in debug builds)
    pub fn lookup_by_stream(&mut self, stream: StreamRef) -> Result<&mut PeerDevice, AudioError> {
        let mut owner = None;
        let mut matches = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(device) = &slot.device else {
                continue;
            };
            if device.streams().any(|ase| ase.stream == stream) {
                matches += 1;
                owner.get_or_insert(index);
            }
        }

        match (matches, owner) {
            (1, Some(index)) => self.slots[index]
                .device
                .as_mut()
                .ok_or(AudioError::NotFound),
            (0, _) | (_, None) => Err(AudioError::NotFound),
            _ => Err(fatal(AudioError::Ambiguous)),
        }
    }

    /// Visit every connected entry until `f` breaks.
    ///
    /// # Errors
    /// `AudioError::Cancelled` if `f` stopped the walk early.
    pub fn for_each<F>(&mut self, mut f: F) -> Result<(), AudioError>
    where
        F: FnMut(&mut PeerDevice) -> ControlFlow<()>,
    {
        for device in self.slots.iter_mut().filter_map(|slot| slot.device.as_mut()) {
            if device.conn.is_none() {
                continue;
            }
            if f(device).is_break() {
                return Err(AudioError::Cancelled);
            }
        }
        Ok(())
    }

    /// Bind an address-only entry to a live connection.
    ///
    /// # Errors
    /// - `AudioError::NotFound` if `addr` has no entry
    /// - `AudioError::AddressMismatch` if the connection leads to another peer
    /// - `AudioError::AlreadySame` if this connection is already attached
    /// - `AudioError::AlreadyBound` if another connection is attached
    pub fn attach_connection(
        &mut self,
        conn: Connection,
        addr: &PeerAddress,
    ) -> Result<(), AudioError> {
        let device = self.find_mut(addr).ok_or(AudioError::NotFound)?;
        if conn.peer != device.addr {
            warn!(
                "[REGISTRY] Connection to {} does not lead to {}",
                conn.peer,
                device.addr
            );
            return Err(AudioError::AddressMismatch);
        }
        match device.conn {
            Some(current) if current == conn => Err(AudioError::AlreadySame),
            Some(_) => Err(AudioError::AlreadyBound),
            None => {
                device.conn = Some(conn);
                Ok(())
            }
        }
    }

    /// Forget everything learned during the session on `conn`.
    ///
    /// The address survives, and so does the state of the embedded endpoints, which is
    /// torn down by its own transitions. An unknown peer is not an error.
    ///
    /// # Errors
    /// Currently infallible.
    pub fn clear_on_disconnect(&mut self, conn: Connection) -> Result<(), AudioError> {
        let Some(device) = self.find_mut(&conn.peer) else {
            debug!("[REGISTRY] No entry to clear for {}", conn.peer);
            return Ok(());
        };
        if device.conn.is_some_and(|current| current != conn) {
            warn!("[REGISTRY] Clearing {} from a stale connection", conn.peer);
        }
        device.name.clear();
        device.conn = None;
        device.sink.clear_session();
        device.source.clear_session();
        Ok(())
    }

    /// Remove an entry.
    ///
    /// # Errors
    /// - `AudioError::NotFound` if `addr` has no entry
    /// - `AudioError::HasActiveConnection` if the entry is connected and `force` is not set
    pub fn remove(&mut self, addr: &PeerAddress, force: bool) -> Result<(), AudioError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.device.as_ref().is_some_and(|d| d.addr == *addr))
            .ok_or(AudioError::NotFound)?;

        if slot.device.as_ref().is_some_and(PeerDevice::is_connected) && !force {
            warn!("[REGISTRY] {} still connected, not removed", addr);
            return Err(AudioError::HasActiveConnection);
        }

        slot.device = None;
        slot.generation = slot.generation.wrapping_add(1);
        debug!("[REGISTRY] Removed {}", addr);
        Ok(())
    }

    /// Remove every entry, stopping at the first that refuses.
    ///
    /// # Errors
    /// `AudioError::HasActiveConnection` if a connected entry is met without `force`.
    pub fn remove_all(&mut self, force: bool) -> Result<(), AudioError> {
        for index in 0..MAX_PEERS {
            let Some(addr) = self.slots[index].device.as_ref().map(PeerDevice::address) else {
                continue;
            };
            self.remove(&addr, force)?;
        }
        Ok(())
    }

    /// The entry owning a stream handle, found directly through the handle's slot.
    ///
    /// # Errors
    /// `AudioError::NotFound` if the handle is stale.
    pub fn peer_of(&self, stream: StreamRef) -> Result<&PeerDevice, AudioError> {
        self.slots
            .get(usize::from(stream.slot))
            .filter(|slot| slot.generation == stream.generation)
            .and_then(|slot| slot.device.as_ref())
            .ok_or(AudioError::NotFound)
    }

    /// Resolve a stream handle to its endpoint.
    ///
    /// # Errors
    /// `AudioError::NotFound` if the handle is stale or out of range.
    pub fn endpoint(&self, stream: StreamRef) -> Result<&AudioStreamEndpoint, AudioError> {
        self.peer_of(stream)?
            .dir(stream.dir)
            .streams
            .get(usize::from(stream.index))
            .ok_or(AudioError::NotFound)
    }

    /// Resolve a stream handle to its endpoint, mutably.
    ///
    /// # Errors
    /// `AudioError::NotFound` if the handle is stale or out of range.
    pub fn endpoint_mut(&mut self, stream: StreamRef) -> Result<&mut AudioStreamEndpoint, AudioError> {
        let slot = self
            .slots
            .get_mut(usize::from(stream.slot))
            .filter(|slot| slot.generation == stream.generation)
            .ok_or(AudioError::NotFound)?;
        let device = slot.device.as_mut().ok_or(AudioError::NotFound)?;
        device
            .dir_mut(stream.dir)
            .streams
            .get_mut(usize::from(stream.index))
            .ok_or(AudioError::NotFound)
    }

    /// Every embedded endpoint of every entry
    pub fn streams(&self) -> impl Iterator<Item = &AudioStreamEndpoint> {
        self.peers().flat_map(PeerDevice::streams)
    }

    pub(crate) fn streams_mut(&mut self) -> impl Iterator<Item = &mut AudioStreamEndpoint> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.device.as_mut())
            .flat_map(PeerDevice::streams_mut)
    }

    /// Number of `dir` endpoints in `state` across connected entries
    #[must_use]
    pub fn state_count(&self, state: EndpointState, dir: Direction) -> usize {
        self.peers()
            .filter(|device| device.is_connected())
            .flat_map(|device| device.dir(dir).streams.iter())
            .filter(|ase| ase.state == state)
            .count()
    }

    /// Record the audio locations of a direction
    ///
    /// # Errors
    /// Lookup errors of [`PeerRegistry::lookup_by_connection`].
    pub fn set_location(
        &mut self,
        conn: Connection,
        dir: Direction,
        locations: AudioLocation,
    ) -> Result<(), AudioError> {
        let device = self.lookup_by_connection(conn)?;
        device.dir_mut(dir).locations = locations;
        Ok(())
    }

    /// Record supported audio contexts
    ///
    /// # Errors
    /// Lookup errors of [`PeerRegistry::lookup_by_connection`].
    pub fn set_supported_contexts(
        &mut self,
        conn: Connection,
        snk: AudioContext,
        src: AudioContext,
    ) -> Result<(), AudioError> {
        let device = self.lookup_by_connection(conn)?;
        device.sink.supported_ctx = snk;
        device.source.supported_ctx = src;
        Ok(())
    }

    /// Record available audio contexts
    ///
    /// # Errors
    /// Lookup errors of [`PeerRegistry::lookup_by_connection`].
    pub fn set_available_contexts(
        &mut self,
        conn: Connection,
        snk: AudioContext,
        src: AudioContext,
    ) -> Result<(), AudioError> {
        let device = self.lookup_by_connection(conn)?;
        device.sink.available_ctx = snk;
        device.source.available_ctx = src;
        Ok(())
    }

    /// Remember a codec capability record
    ///
    /// # Errors
    /// - `AudioError::NoSpace` if `MAX_CODEC_CAPS` records are already stored
    /// - lookup errors of [`PeerRegistry::lookup_by_connection`]
    pub fn add_codec_capability(
        &mut self,
        conn: Connection,
        dir: Direction,
        cap: CodecCapability,
    ) -> Result<(), AudioError> {
        let device = self.lookup_by_connection(conn)?;
        device.dir_mut(dir).codec_caps.push(cap).map_err(|_| {
            warn!("[REGISTRY] No room for more {} codec capabilities", dir);
            AudioError::NoSpace
        })
    }

    /// Remember a discovered remote endpoint and bind the next embedded endpoint to it
    ///
    /// # Errors
    /// - `AudioError::NoSpace` if `MAX_ENDPOINTS_PER_DIR` endpoints are already stored
    /// - lookup errors of [`PeerRegistry::lookup_by_connection`]
    pub fn add_endpoint(
        &mut self,
        conn: Connection,
        dir: Direction,
        endpoint: EndpointDescriptor,
    ) -> Result<(), AudioError> {
        let device = self.lookup_by_connection(conn)?;
        let info = device.dir_mut(dir);
        let index = info.endpoints.len();
        info.endpoints.push(endpoint).map_err(|_| AudioError::NoSpace)?;
        if let Some(ase) = info.streams.get_mut(index) {
            ase.bind_remote(conn, endpoint.ase_id);
        }
        Ok(())
    }

    /// Pick the best preset the stored capability records of `dir` allow.
    ///
    /// Returns a bitmask with bit `i` set when capability record `i` was usable. The
    /// direction's preset is replaced, or cleared when nothing was usable.
    ///
    /// # Errors
    /// Lookup errors of [`PeerRegistry::lookup_by_connection`].
    pub fn select_presets(
        &mut self,
        conn: Connection,
        dir: Direction,
        preferred_hz: u32,
    ) -> Result<u32, AudioError> {
        let device = self.lookup_by_connection(conn)?;
        let info = device.dir_mut(dir);

        let mut valid = 0u32;
        let mut best: Option<Preset> = None;
        for (i, cap) in info.codec_caps.iter().enumerate() {
            match Preset::for_capability(cap, preferred_hz) {
                Ok(preset) => {
                    valid |= 1 << i;
                    if preset.is_better_than(best.as_ref(), preferred_hz) {
                        best = Some(preset);
                    }
                }
                Err(e) => debug!("[REGISTRY] {} capability {} unusable: {}", dir, i, e),
            }
        }
        info.preset = best;
        Ok(valid)
    }
}

/// A [`PeerRegistry`] behind an async mutex.
///
/// Locking is the only way to reach the registry. The lock is not re-entrant; in debug
/// builds the call site of the current holder is kept for diagnostics.
pub struct SharedRegistry {
    inner: Mutex<CriticalSectionRawMutex, PeerRegistry>,
    holder: BlockingMutex<CriticalSectionRawMutex, Cell<Option<&'static Location<'static>>>>,
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedRegistry {
    /// Create an empty registry
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(PeerRegistry::new()),
            holder: BlockingMutex::new(Cell::new(None)),
        }
    }

    fn guard<'a>(
        &'a self,
        guard: MutexGuard<'a, CriticalSectionRawMutex, PeerRegistry>,
        caller: &'static Location<'static>,
    ) -> RegistryGuard<'a> {
        if cfg!(debug_assertions) {
            self.holder.lock(|holder| holder.set(Some(caller)));
        }
        RegistryGuard {
            guard,
            holder: &self.holder,
        }
    }

    fn report_holder(&self) {
        if let Some(holder) = self.holder() {
            warn!(
                "[REGISTRY] Lock held by {}:{}",
                holder.file(),
                holder.line()
            );
        }
    }

    /// Call site of the current lock holder (debug builds only)
    #[must_use]
    pub fn holder(&self) -> Option<&'static Location<'static>> {
        self.holder.lock(Cell::get)
    }

    /// Take the lock without waiting.
    ///
    /// # Errors
    /// `AudioError::Busy` if the lock is held.
    #[track_caller]
    pub fn try_lock(&self) -> Result<RegistryGuard<'_>, AudioError> {
        let caller = Location::caller();
        match self.inner.try_lock() {
            Ok(guard) => Ok(self.guard(guard, caller)),
            Err(_) => {
                self.report_holder();
                Err(AudioError::Busy)
            }
        }
    }

    /// Take the lock, waiting at most `timeout`. A zero timeout behaves like
    /// [`SharedRegistry::try_lock`].
    ///
    /// # Errors
    /// - `AudioError::Busy` if the lock is held and `timeout` is zero
    /// - `AudioError::Timeout` if the lock was not released in time
    #[track_caller]
    pub fn lock(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<RegistryGuard<'_>, AudioError>> + '_ {
        let caller = Location::caller();
        async move {
            if timeout.as_ticks() == 0 {
                return match self.inner.try_lock() {
                    Ok(guard) => Ok(self.guard(guard, caller)),
                    Err(_) => {
                        self.report_holder();
                        Err(AudioError::Busy)
                    }
                };
            }

            match select(self.inner.lock(), Timer::after(timeout)).await {
                Either::First(guard) => Ok(self.guard(guard, caller)),
                Either::Second(()) => {
                    error!(
                        "[REGISTRY] Lock wait of {} ms from {}:{} timed out",
                        timeout.as_millis(),
                        caller.file(),
                        caller.line()
                    );
                    self.report_holder();
                    Err(AudioError::Timeout)
                }
            }
        }
    }
}

/// Exclusive access to a [`PeerRegistry`]; the lock is released on drop
pub struct RegistryGuard<'a> {
    guard: MutexGuard<'a, CriticalSectionRawMutex, PeerRegistry>,
    holder: &'a BlockingMutex<CriticalSectionRawMutex, Cell<Option<&'static Location<'static>>>>,
}

impl Deref for RegistryGuard<'_> {
    type Target = PeerRegistry;

    fn deref(&self) -> &PeerRegistry {
        &self.guard
    }
}

impl DerefMut for RegistryGuard<'_> {
    fn deref_mut(&mut self) -> &mut PeerRegistry {
        &mut self.guard
    }
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        self.holder.lock(|holder| holder.set(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ase::Trigger;
    use crate::codec::{SupportedFrequencies, cap_type};
    use embassy_futures::block_on;

    fn addr(n: u8) -> PeerAddress {
        PeerAddress::new([n, 0x11, 0x22, 0x33, 0x44, 0x55])
    }

    fn conn(n: u8) -> Connection {
        Connection::new(u16::from(n), addr(n))
    }

    fn capability(freqs: u16) -> CodecCapability {
        let f = freqs.to_le_bytes();
        CodecCapability::from_ltv(&[0x03, cap_type::FREQ, f[0], f[1]]).unwrap()
    }

    #[test]
    fn test_add_by_address_is_idempotent() {
        let mut registry = PeerRegistry::new();
        assert_eq!(registry.add_by_address(addr(1)), Ok(()));
        assert_eq!(
            registry.add_by_address(addr(1)),
            Err(AudioError::AlreadyExists)
        );
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_add_by_connection_reattaches() {
        let mut registry = PeerRegistry::new();
        registry.add_by_address(addr(1)).unwrap();
        assert_eq!(
            registry.add_by_connection(conn(1)),
            Err(AudioError::AlreadyExists)
        );
        assert_eq!(registry.count(), 1);
        assert_eq!(
            registry.lookup_by_connection(conn(1)).unwrap().connection(),
            Some(conn(1))
        );
    }

    #[test]
    fn test_registry_full() {
        let mut registry = PeerRegistry::new();
        for n in 0..MAX_PEERS as u8 {
            registry.add_by_address(addr(n)).unwrap();
        }
        assert_eq!(registry.add_by_address(addr(200)), Err(AudioError::NoSpace));
        assert_eq!(registry.add_by_connection(conn(200)), Err(AudioError::NoSpace));
    }

    #[test]
    fn test_lookup_by_connection_checks_owner() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();

        let other_handle = Connection::new(99, addr(1));
        assert_eq!(
            registry.lookup_by_connection(other_handle).err(),
            Some(AudioError::NotConnected)
        );
        assert_eq!(
            registry.lookup_by_connection(conn(2)).err(),
            Some(AudioError::NotFound)
        );
    }

    #[test]
    fn test_attach_connection() {
        let mut registry = PeerRegistry::new();
        registry.add_by_address(addr(1)).unwrap();

        assert_eq!(
            registry.attach_connection(conn(2), &addr(1)),
            Err(AudioError::AddressMismatch)
        );
        assert_eq!(
            registry.attach_connection(conn(1), &addr(3)),
            Err(AudioError::NotFound)
        );
        assert_eq!(registry.attach_connection(conn(1), &addr(1)), Ok(()));
        assert_eq!(
            registry.attach_connection(conn(1), &addr(1)),
            Err(AudioError::AlreadySame)
        );
        assert_eq!(
            registry.attach_connection(Connection::new(7, addr(1)), &addr(1)),
            Err(AudioError::AlreadyBound)
        );
    }

    #[test]
    fn test_remove_round_trip() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();

        assert_eq!(
            registry.remove(&addr(1), false),
            Err(AudioError::HasActiveConnection)
        );
        assert_eq!(registry.remove(&addr(1), true), Ok(()));
        assert_eq!(
            registry.lookup_by_address(&addr(1)).err(),
            Some(AudioError::NotFound)
        );
        assert_eq!(registry.remove(&addr(1), true), Err(AudioError::NotFound));
    }

    #[test]
    fn test_remove_invalidates_stream_handles() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        let stream = registry.peer(&addr(1)).unwrap().sink.streams[0].stream();
        assert!(registry.endpoint(stream).is_ok());

        registry.remove(&addr(1), true).unwrap();
        registry.add_by_connection(conn(2)).unwrap();
        assert_eq!(registry.endpoint(stream).err(), Some(AudioError::NotFound));
        assert_eq!(
            registry.lookup_by_stream(stream).err(),
            Some(AudioError::NotFound)
        );
    }

    #[test]
    fn test_clear_on_disconnect_keeps_address_and_streams() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        registry
            .add_endpoint(conn(1), Direction::Sink, EndpointDescriptor { ase_id: 1 })
            .unwrap();
        registry
            .add_codec_capability(
                conn(1),
                Direction::Sink,
                capability(SupportedFrequencies::HZ_48000),
            )
            .unwrap();
        registry
            .lookup_by_connection(conn(1))
            .unwrap()
            .set_name("Left bud");
        let stream = registry.peer(&addr(1)).unwrap().sink.streams[0].stream();
        registry
            .endpoint_mut(stream)
            .unwrap()
            .apply(Trigger::Configure)
            .unwrap();

        registry.clear_on_disconnect(conn(1)).unwrap();

        assert_eq!(
            registry.lookup_by_connection(conn(1)).err(),
            Some(AudioError::NotConnected)
        );
        let device = registry.lookup_by_address(&addr(1)).unwrap();
        assert_eq!(device.name(), "");
        assert!(device.dir(Direction::Sink).endpoints().is_empty());
        assert!(device.dir(Direction::Sink).codec_capabilities().is_empty());
        assert_eq!(
            registry.endpoint(stream).unwrap().state(),
            EndpointState::CodecConfigured
        );

        // Unknown peers are fine
        assert_eq!(registry.clear_on_disconnect(conn(9)), Ok(()));
    }

    #[test]
    fn test_for_each_visits_connected_only() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        registry.add_by_address(addr(2)).unwrap();
        registry.add_by_connection(conn(3)).unwrap();

        let mut visited = 0;
        assert_eq!(
            registry.for_each(|_| {
                visited += 1;
                ControlFlow::Continue(())
            }),
            Ok(())
        );
        assert_eq!(visited, 2);

        assert_eq!(
            registry.for_each(|_| ControlFlow::Break(())),
            Err(AudioError::Cancelled)
        );
    }

    #[test]
    fn test_remove_all_stops_at_connected_entry() {
        let mut registry = PeerRegistry::new();
        registry.add_by_address(addr(1)).unwrap();
        registry.add_by_connection(conn(2)).unwrap();
        registry.add_by_address(addr(3)).unwrap();

        assert_eq!(
            registry.remove_all(false),
            Err(AudioError::HasActiveConnection)
        );
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.remove_all(true), Ok(()));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_lookup_by_stream() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        registry.add_by_connection(conn(2)).unwrap();
        let stream = registry.peer(&addr(2)).unwrap().source.streams[1].stream();

        let device = registry.lookup_by_stream(stream).unwrap();
        assert_eq!(device.address(), addr(2));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic)]
    fn test_lookup_by_stream_ambiguous_is_fatal() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        registry.add_by_connection(conn(2)).unwrap();
        let stream = registry.peer(&addr(1)).unwrap().sink.streams[0].stream();
        registry.lookup_by_address(&addr(2)).unwrap().sink.streams[0].stream = stream;

        assert_eq!(
            registry.lookup_by_stream(stream).err(),
            Some(AudioError::Ambiguous)
        );
    }

    #[test]
    fn test_add_endpoint_binds_streams() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        for ase_id in 1..=MAX_ENDPOINTS_PER_DIR as u8 {
            registry
                .add_endpoint(conn(1), Direction::Source, EndpointDescriptor { ase_id })
                .unwrap();
        }
        assert_eq!(
            registry.add_endpoint(conn(1), Direction::Source, EndpointDescriptor { ase_id: 9 }),
            Err(AudioError::NoSpace)
        );

        let device = registry.peer(&addr(1)).unwrap();
        let ase = &device.dir(Direction::Source).streams()[1];
        assert_eq!(ase.ase_id(), Some(2));
        assert_eq!(ase.connection(), Some(conn(1)));
    }

    #[test]
    fn test_stream_budget_follows_locations() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        for ase_id in 1..=2 {
            registry
                .add_endpoint(conn(1), Direction::Sink, EndpointDescriptor { ase_id })
                .unwrap();
        }
        registry
            .set_location(conn(1), Direction::Sink, AudioLocation::FRONT_LEFT)
            .unwrap();
        assert_eq!(
            registry.peer(&addr(1)).unwrap().dir(Direction::Sink).stream_budget(),
            1
        );

        registry
            .set_location(
                conn(1),
                Direction::Sink,
                AudioLocation(AudioLocation::FRONT_LEFT.0 | AudioLocation::FRONT_RIGHT.0),
            )
            .unwrap();
        assert_eq!(
            registry.peer(&addr(1)).unwrap().dir(Direction::Sink).stream_budget(),
            2
        );
    }

    #[test]
    fn test_select_presets() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        registry
            .add_codec_capability(
                conn(1),
                Direction::Sink,
                capability(SupportedFrequencies::HZ_16000),
            )
            .unwrap();
        registry
            .add_codec_capability(
                conn(1),
                Direction::Sink,
                capability(SupportedFrequencies::HZ_8000),
            )
            .unwrap();
        registry
            .add_codec_capability(
                conn(1),
                Direction::Sink,
                capability(SupportedFrequencies::HZ_48000),
            )
            .unwrap();

        let valid = registry.select_presets(conn(1), Direction::Sink, 48_000).unwrap();
        assert_eq!(valid, 0b101);
        let preset = registry
            .peer(&addr(1))
            .unwrap()
            .dir(Direction::Sink)
            .preset()
            .unwrap();
        assert_eq!(preset.codec.sample_rate_hz(), Ok(48_000));
    }

    #[test]
    fn test_codec_capabilities_full() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        for _ in 0..MAX_CODEC_CAPS {
            registry
                .add_codec_capability(
                    conn(1),
                    Direction::Sink,
                    capability(SupportedFrequencies::HZ_16000),
                )
                .unwrap();
        }
        assert_eq!(
            registry.add_codec_capability(
                conn(1),
                Direction::Sink,
                capability(SupportedFrequencies::HZ_16000)
            ),
            Err(AudioError::NoSpace)
        );
    }

    #[test]
    fn test_state_count() {
        let mut registry = PeerRegistry::new();
        registry.add_by_connection(conn(1)).unwrap();
        registry.add_by_address(addr(2)).unwrap();
        assert_eq!(registry.state_count(EndpointState::Idle, Direction::Sink), MAX_ASE_PER_DIR);

        let stream = registry.peer(&addr(1)).unwrap().sink.streams[0].stream();
        registry
            .endpoint_mut(stream)
            .unwrap()
            .apply(Trigger::Configure)
            .unwrap();
        assert_eq!(
            registry.state_count(EndpointState::CodecConfigured, Direction::Sink),
            1
        );
    }

    #[test]
    fn test_shared_registry_lock() {
        let shared = SharedRegistry::new();

        let mut guard = block_on(shared.lock(Duration::from_ticks(0))).unwrap();
        guard.add_by_address(addr(1)).unwrap();
        assert!(shared.holder().is_some() || !cfg!(debug_assertions));

        assert_eq!(shared.try_lock().err(), Some(AudioError::Busy));
        assert_eq!(
            block_on(shared.lock(Duration::from_ticks(0))).err(),
            Some(AudioError::Busy)
        );
        assert_eq!(
            block_on(shared.lock(Duration::from_millis(5))).err(),
            Some(AudioError::Timeout)
        );

        drop(guard);
        assert!(shared.holder().is_none());
        let guard = shared.try_lock().unwrap();
        assert_eq!(guard.count(), 1);
    }
}
