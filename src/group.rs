//! Unicast Group Orchestration
//!
//! One isochronous group carries every stream of every connected peer. The
//! orchestrator assembles it from the registry, pairing each peer's sink stream with a
//! source stream of the same peer so both share a CIS, and drives the multi-stream
//! procedures through the [`ProcedureSerializer`].
//!
//! Membership changes are all-or-nothing: when a peer brings streams that are not in
//! the created group, the whole group is released, deleted and created again.

use crate::ase::{AudioStreamEndpoint, CisBinding, EndpointState, StreamRef};
use crate::constants::{MAX_GROUP_PAIRS, MAX_GROUP_STREAMS};
use crate::procedure::{Dispatch, ProcedureKind, ProcedureSerializer};
use crate::registry::{PeerDevice, PeerRegistry};
use crate::transport::{AudioTransport, StartParam, StreamParam};
use crate::{AudioError, Direction};
use heapless::Vec;

const MAX_START_ATTEMPTS: usize = 3;

/// CIS packing inside the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PackingMode {
    /// CISes scheduled one after the other
    #[default]
    Sequential,
    /// CIS subevents interleaved
    Interleaved,
}

/// Streams sharing one CIS: `tx` is the client-to-peer (sink) stream, `rx` the
/// peer-to-client (source) one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamPair {
    /// Sink stream
    pub tx: Option<StreamParam>,
    /// Source stream
    pub rx: Option<StreamParam>,
}

impl StreamPair {
    /// The streams of the pair, sink first
    pub fn streams(&self) -> impl Iterator<Item = &StreamParam> {
        self.tx.iter().chain(self.rx.iter())
    }
}

/// Group creation request handed to the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupParams<'a> {
    /// Group identifier
    pub group_id: u8,
    /// CIS packing
    pub packing: PackingMode,
    /// One entry per CIS
    pub pairs: &'a [StreamPair],
}

/// The unicast group and what has been committed to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastGroup {
    id: u8,
    packing: PackingMode,
    pairs: Vec<StreamPair, MAX_GROUP_PAIRS>,
    presentation_delay_us: [Option<u32>; 2],
    max_transport_latency_ms: [Option<u16>; 2],
    pub(crate) created: bool,
    recreate_pending: bool,
}

impl UnicastGroup {
    /// Create an empty, not yet created group
    #[must_use]
    pub const fn new(id: u8, packing: PackingMode) -> Self {
        Self {
            id,
            packing,
            pairs: Vec::new(),
            presentation_delay_us: [None; 2],
            max_transport_latency_ms: [None; 2],
            created: false,
            recreate_pending: false,
        }
    }

    /// Group identifier
    #[must_use]
    pub const fn id(&self) -> u8 {
        self.id
    }

    /// CIS packing
    #[must_use]
    pub const fn packing(&self) -> PackingMode {
        self.packing
    }

    /// Pairs of the last assembly, one per CIS
    #[must_use]
    pub fn pairs(&self) -> &[StreamPair] {
        &self.pairs
    }

    /// Whether the host stack has created the group
    #[must_use]
    pub const fn is_created(&self) -> bool {
        self.created
    }

    /// Whether the group waits for its streams to go idle before being recreated
    #[must_use]
    pub const fn is_recreate_pending(&self) -> bool {
        self.recreate_pending
    }

    /// Whether `stream` is part of the group
    #[must_use]
    pub fn is_member(&self, stream: StreamRef) -> bool {
        self.members().any(|member| member == stream)
    }

    /// Every member stream, in CIS order
    pub fn members(&self) -> impl Iterator<Item = StreamRef> + '_ {
        self.pairs
            .iter()
            .flat_map(StreamPair::streams)
            .map(|param| param.stream)
    }

    /// Number of member streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.members().count()
    }

    /// Presentation delay the group runs `dir` with
    #[must_use]
    pub const fn committed_presentation_delay(&self, dir: Direction) -> Option<u32> {
        self.presentation_delay_us[dir.index()]
    }

    /// Max transport latency negotiated for `dir`
    #[must_use]
    pub const fn committed_max_transport_latency(&self, dir: Direction) -> Option<u16> {
        self.max_transport_latency_ms[dir.index()]
    }

    pub(crate) fn commit_presentation_delay(&mut self, dir: Direction, value_us: u32) {
        self.presentation_delay_us[dir.index()] = Some(value_us);
    }

    pub(crate) fn commit_max_transport_latency(&mut self, dir: Direction, value_ms: u16) {
        self.max_transport_latency_ms[dir.index()] = Some(value_ms);
    }
}

/// Endpoints of `device` in `dir` that can stream: the peer is connected, a preset was
/// selected and the endpoint is bound to a discovered remote endpoint.
fn eligible(device: &PeerDevice, dir: Direction) -> impl Iterator<Item = &AudioStreamEndpoint> {
    let info = device.dir(dir);
    let budget = if device.is_connected() && info.preset().is_some() {
        info.stream_budget()
    } else {
        0
    };
    info.streams()[..budget]
        .iter()
        .filter(|ase| ase.ase_id().is_some())
}

/// Builds, starts and stops the unicast group
#[derive(Debug)]
pub struct GroupOrchestrator {
    group: UnicastGroup,
}

impl GroupOrchestrator {
    /// Create an orchestrator for group `id`
    #[must_use]
    pub const fn new(id: u8, packing: PackingMode) -> Self {
        Self {
            group: UnicastGroup::new(id, packing),
        }
    }

    /// The group
    #[must_use]
    pub const fn group(&self) -> &UnicastGroup {
        &self.group
    }

    pub(crate) fn group_mut(&mut self) -> &mut UnicastGroup {
        &mut self.group
    }

    fn stream_param(&self, device: &PeerDevice, ase: &AudioStreamEndpoint) -> Option<StreamParam> {
        let dir = ase.direction();
        let qos = match ase.qos() {
            Some(qos) => *qos,
            None => {
                let mut qos = device.dir(dir).preset()?.qos;
                if let Some(pd) = self.group.committed_presentation_delay(dir) {
                    qos.presentation_delay_us = pd;
                }
                if let Some(latency) = self.group.committed_max_transport_latency(dir) {
                    qos.max_transport_latency_ms = latency;
                }
                qos
            }
        };
        Some(StreamParam {
            stream: ase.stream(),
            qos,
        })
    }

    /// Build the group's pairs from the registry.
    ///
    /// Peers are walked in registry order. Each sink stream is paired with the first
    /// source stream of the same peer not yet taken; leftover sources get a CIS of
    /// their own.
    ///
    /// # Errors
    /// `AudioError::NoValidStreams` if no peer has a stream to offer.
    pub fn assemble(&mut self, registry: &PeerRegistry) -> Result<(), AudioError> {
        self.group.pairs = self.plan(registry)?;
        Ok(())
    }

    /// The pairs an assembly from the registry's current contents would produce
    fn plan(&self, registry: &PeerRegistry) -> Result<Vec<StreamPair, MAX_GROUP_PAIRS>, AudioError> {
        let mut sinks: Vec<StreamParam, MAX_GROUP_PAIRS> = Vec::new();
        let mut sources: Vec<StreamParam, MAX_GROUP_PAIRS> = Vec::new();

        for device in registry.peers() {
            for dir in Direction::ALL {
                let list = match dir {
                    Direction::Sink => &mut sinks,
                    Direction::Source => &mut sources,
                };
                for ase in eligible(device, dir) {
                    let Some(param) = self.stream_param(device, ase) else {
                        continue;
                    };
                    if list.push(param).is_err() {
                        warn!("[GROUP] No room for {} in the group", ase.stream());
                    }
                }
            }
        }

        let mut consumed = [false; MAX_GROUP_PAIRS];
        let mut pairs: Vec<StreamPair, MAX_GROUP_PAIRS> = Vec::new();

        for sink in &sinks {
            let mut rx = None;
            for (j, source) in sources.iter().enumerate() {
                if !consumed[j] && source.stream.same_peer(&sink.stream) {
                    consumed[j] = true;
                    rx = Some(*source);
                    break;
                }
            }
            if pairs.push(StreamPair { tx: Some(*sink), rx }).is_err() {
                warn!("[GROUP] Group full, {} left out", sink.stream);
            }
        }

        for (j, source) in sources.iter().enumerate() {
            if consumed[j] {
                continue;
            }
            if pairs
                .push(StreamPair {
                    tx: None,
                    rx: Some(*source),
                })
                .is_err()
            {
                warn!("[GROUP] Group full, {} left out", source.stream);
            }
        }

        if pairs.is_empty() {
            warn!("[GROUP] No valid streams to build a group from");
            return Err(AudioError::NoValidStreams);
        }

        Ok(pairs)
    }

    /// Assemble the group and ask the host stack to create it.
    ///
    /// Every member is bound to the CIS of its pair.
    ///
    /// # Errors
    /// `AudioError::NoValidStreams` from assembly, or whatever the host stack reports.
    pub fn create<T: AudioTransport>(
        &mut self,
        registry: &mut PeerRegistry,
        transport: &mut T,
    ) -> Result<(), AudioError> {
        self.assemble(registry)?;

        let params = GroupParams {
            group_id: self.group.id,
            packing: self.group.packing,
            pairs: &self.group.pairs,
        };
        transport.create_group(&params).inspect_err(|e| {
            error!("[GROUP] Failed to create group: {}", e);
        })?;
        self.group.created = true;

        for (cis_id, pair) in self.group.pairs.iter().enumerate() {
            for param in pair.streams() {
                if let Ok(ase) = registry.endpoint_mut(param.stream) {
                    ase.bind_cis(CisBinding {
                        group_id: self.group.id,
                        cis_id: cis_id as u8,
                    });
                }
            }
        }

        info!(
            "[GROUP] Created group {} with {} streams",
            self.group.id,
            self.group.stream_count()
        );
        Ok(())
    }

    /// Ask the host stack to delete the group and forget its composition
    ///
    /// # Errors
    /// Whatever the host stack reports, except `AudioError::Unsupported`.
    pub fn delete<T: AudioTransport>(
        &mut self,
        registry: &mut PeerRegistry,
        transport: &mut T,
    ) -> Result<(), AudioError> {
        if self.group.created {
            match transport.delete_group(self.group.id) {
                Ok(()) | Err(AudioError::Unsupported) => {}
                Err(e) => {
                    error!("[GROUP] Failed to delete group: {}", e);
                    return Err(e);
                }
            }
        }
        for stream in self.group.members() {
            if let Ok(ase) = registry.endpoint_mut(stream) {
                ase.unbind_cis();
            }
        }
        self.group.pairs.clear();
        self.group.created = false;
        self.group.recreate_pending = false;
        debug!("[GROUP] Deleted group {}", self.group.id);
        Ok(())
    }

    /// Whether assembling now would take in streams the created group lacks.
    ///
    /// Streams that would not fit a rebuilt group either do not count.
    fn needs_rebuild(&self, registry: &PeerRegistry) -> bool {
        let Ok(pairs) = self.plan(registry) else {
            return false;
        };
        pairs
            .iter()
            .flat_map(StreamPair::streams)
            .any(|param| !self.group.is_member(param.stream))
    }

    fn all_members_idle(&self, registry: &PeerRegistry) -> bool {
        self.group.members().all(|stream| {
            registry
                .endpoint(stream)
                .map_or(true, |ase| ase.state() == EndpointState::Idle)
        })
    }

    /// Start every group stream that is not streaming yet.
    ///
    /// The group is created first if needed. When peers bring streams the created group
    /// lacks, the group is released and recreated instead; streaming then resumes once
    /// every member is idle.
    ///
    /// # Errors
    /// Creation errors, or whatever the host stack reports for the start request.
    pub fn start<T: AudioTransport>(
        &mut self,
        registry: &mut PeerRegistry,
        serializer: &mut ProcedureSerializer,
        transport: &mut T,
    ) -> Result<Dispatch, AudioError> {
        for _ in 0..MAX_START_ATTEMPTS {
            if !self.group.created {
                self.create(registry, transport)?;
            }

            if self.needs_rebuild(registry) {
                info!("[GROUP] New streams outside group {}, recreating", self.group.id);
                match self.restart(registry, serializer, transport)? {
                    Some(dispatch) => return Ok(dispatch),
                    None => continue,
                }
            }

            return self.start_streams(registry, serializer, transport);
        }

        error!("[GROUP] Group {} did not settle", self.group.id);
        Err(AudioError::InvalidState)
    }

    /// Begin recreating the group.
    ///
    /// Returns `None` when the group was deleted on the spot and can be created again
    /// right away, otherwise how the release of its streams was dispatched.
    ///
    /// # Errors
    /// Whatever the host stack reports for the release or deletion.
    pub fn restart<T: AudioTransport>(
        &mut self,
        registry: &mut PeerRegistry,
        serializer: &mut ProcedureSerializer,
        transport: &mut T,
    ) -> Result<Option<Dispatch>, AudioError> {
        if !self.group.created {
            return Ok(None);
        }
        self.group.recreate_pending = true;
        match self.stop(registry, serializer, transport)? {
            Dispatch::Nothing if self.all_members_idle(registry) => {
                self.delete(registry, transport)?;
                Ok(None)
            }
            // Members are still releasing; `on_stream_idle` finishes the job
            Dispatch::Nothing => Ok(Some(Dispatch::Queued)),
            dispatch => Ok(Some(dispatch)),
        }
    }

    fn start_streams<T: AudioTransport>(
        &mut self,
        registry: &PeerRegistry,
        serializer: &mut ProcedureSerializer,
        transport: &mut T,
    ) -> Result<Dispatch, AudioError> {
        let mut params: Vec<StartParam, MAX_GROUP_STREAMS> = Vec::new();

        for param in self.group.pairs.iter().flat_map(StreamPair::streams) {
            let Ok(ase) = registry.endpoint(param.stream) else {
                continue;
            };
            if !matches!(
                ase.state(),
                EndpointState::Idle | EndpointState::CodecConfigured | EndpointState::QosConfigured
            ) {
                continue;
            }
            let (Some(conn), Some(ase_id)) = (ase.connection(), ase.ase_id()) else {
                continue;
            };
            let Ok(device) = registry.peer_of(param.stream) else {
                continue;
            };
            if device.connection() != Some(conn) {
                continue;
            }
            let info = device.dir(ase.direction());
            let Some(preset) = info.preset() else {
                continue;
            };

            let allocation = info.locations().nth_channel(usize::from(param.stream.index()));
            let start = StartParam {
                stream: param.stream,
                conn,
                ase_id,
                codec: preset.codec.clone().with_allocation(allocation),
                qos: ase.qos().copied().unwrap_or(param.qos),
            };
            if params.push(start).is_err() {
                break;
            }
        }

        if params.is_empty() {
            debug!("[GROUP] Nothing to start");
            return Ok(Dispatch::Nothing);
        }

        if serializer.try_begin(ProcedureKind::Start).is_err() {
            return Ok(Dispatch::Queued);
        }

        if let Err(e) = transport.start_streams(&params) {
            error!("[GROUP] Failed to start streams: {}", e);
            serializer.abort();
            return Err(e);
        }

        info!("[GROUP] Starting {} streams", params.len());
        Ok(Dispatch::InFlight)
    }

    /// Release every group stream that is not idle yet.
    ///
    /// # Errors
    /// Whatever the host stack reports for the release request.
    pub fn stop<T: AudioTransport>(
        &mut self,
        registry: &PeerRegistry,
        serializer: &mut ProcedureSerializer,
        transport: &mut T,
    ) -> Result<Dispatch, AudioError> {
        let streams: Vec<StreamRef, MAX_GROUP_STREAMS> = self
            .group
            .members()
            .filter(|stream| {
                registry.endpoint(*stream).is_ok_and(|ase| {
                    !matches!(ase.state(), EndpointState::Idle | EndpointState::Releasing)
                })
            })
            .collect();

        if streams.is_empty() {
            debug!("[GROUP] Nothing to stop");
            return Ok(Dispatch::Nothing);
        }

        if serializer.try_begin(ProcedureKind::Stop).is_err() {
            return Ok(Dispatch::Queued);
        }

        if let Err(e) = transport.release_streams(&streams) {
            error!("[GROUP] Failed to release streams: {}", e);
            serializer.abort();
            return Err(e);
        }

        info!("[GROUP] Releasing {} streams", streams.len());
        Ok(Dispatch::InFlight)
    }

    /// Push pending QoS changes to the group's configured streams.
    ///
    /// # Errors
    /// Whatever the host stack reports for the update request.
    pub fn update<T: AudioTransport>(
        &mut self,
        registry: &mut PeerRegistry,
        serializer: &mut ProcedureSerializer,
        transport: &mut T,
    ) -> Result<Dispatch, AudioError> {
        let mut params: Vec<StreamParam, MAX_GROUP_STREAMS> = Vec::new();
        let pending = registry
            .streams()
            .filter(|ase| ase.in_group(self.group.id) && ase.pending_qos_update());
        for ase in pending {
            if let Some(qos) = ase.qos() {
                let param = StreamParam {
                    stream: ase.stream(),
                    qos: *qos,
                };
                if params.push(param).is_err() {
                    break;
                }
            }
        }

        if params.is_empty() {
            return Ok(Dispatch::Nothing);
        }

        if serializer.try_begin(ProcedureKind::Update).is_err() {
            return Ok(Dispatch::Queued);
        }

        if let Err(e) = transport.update_streams(&params) {
            warn!("[GROUP] Failed to update streams: {}", e);
            serializer.abort();
            return Err(e);
        }

        for param in &params {
            if let Ok(ase) = registry.endpoint_mut(param.stream) {
                ase.pending_qos_update = false;
            }
        }
        Ok(Dispatch::InFlight)
    }

    /// A member reached `Idle`. Returns whether a pending recreation deleted the group,
    /// in which case the caller starts it again.
    ///
    /// # Errors
    /// Whatever the host stack reports for the deletion.
    pub fn on_stream_idle<T: AudioTransport>(
        &mut self,
        registry: &mut PeerRegistry,
        transport: &mut T,
    ) -> Result<bool, AudioError> {
        if !self.group.recreate_pending || !self.all_members_idle(registry) {
            return Ok(false);
        }
        self.delete(registry, transport)?;
        Ok(true)
    }
}
