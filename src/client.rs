//! Unicast Client
//!
//! [`UnicastClient`] ties the pieces together. The host stack feeds it connection,
//! discovery, endpoint and transport events; the client keeps the registry current,
//! negotiates QoS as streams get configured, and drives the group through the
//! procedure serializer. Every request and notification leaves through the
//! [`AudioTransport`] it owns.
//!
//! Every entry point takes the already locked [`PeerRegistry`]: the registry lock is
//! always taken before the serializer gate.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use unibird::client::UnicastClient;
//! # use unibird::transport::AudioTransport;
//! # use unibird::{Connection, UnicastClientOptions};
//! # use embassy_time::Duration;
//! # async fn example<T: AudioTransport>(transport: T, conn: Connection) -> Result<(), unibird::AudioError> {
//! let mut client = UnicastClient::new(transport, UnicastClientOptions::default());
//!
//! let mut registry = unibird::api::registry(Duration::from_millis(100)).await?;
//! client.on_connection_established(&mut registry, conn)?;
//! # Ok(())
//! # }
//! ```

use crate::address::Connection;
use crate::ase::state::transition;
use crate::ase::{EndpointDescriptor, EndpointState, Lifecycle, StreamRef, Transition, Trigger};
use crate::codec::{CodecCapability, CodecConfig};
use crate::group::GroupOrchestrator;
use crate::procedure::{Dispatch, ProcedureKind, ProcedureSerializer};
use crate::qos::{
    ActionRequired, Candidate, QosPreference, apply_max_transport_latency,
    apply_presentation_delay, compute_max_transport_latency, compute_presentation_delay,
};
use crate::registry::PeerRegistry;
use crate::transport::{AudioEvent, AudioTransport, discovery_order};
use crate::{
    AudioContext, AudioError, AudioLocation, Direction, DiscoverDirection, UnicastClientOptions,
};

/// Codec parameters of a configured stream, for the audio pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamConfig {
    /// Bitrate in bits per second
    pub bitrate: u32,
    /// Sampling rate in Hz
    pub sample_rate_hz: u32,
    /// Presentation delay in microseconds
    pub presentation_delay_us: u32,
}

fn per_direction<T>(dir: Direction, value: T) -> (Option<T>, Option<T>) {
    match dir {
        Direction::Sink => (Some(value), None),
        Direction::Source => (None, Some(value)),
    }
}

fn nothing_streaming(registry: &PeerRegistry) -> bool {
    Direction::ALL
        .into_iter()
        .all(|dir| registry.state_count(EndpointState::Streaming, dir) == 0)
}

/// LE Audio unicast client
pub struct UnicastClient<T: AudioTransport> {
    transport: T,
    options: UnicastClientOptions,
    orchestrator: GroupOrchestrator,
    serializer: ProcedureSerializer,
    playing: bool,
}

impl<T: AudioTransport> UnicastClient<T> {
    /// Create a client talking to the host stack through `transport`
    #[must_use]
    pub fn new(transport: T, options: UnicastClientOptions) -> Self {
        Self {
            transport,
            orchestrator: GroupOrchestrator::new(crate::constants::GROUP_ID, options.packing),
            serializer: ProcedureSerializer::new(),
            options,
            playing: false,
        }
    }

    /// Runtime options
    pub fn options(&self) -> &UnicastClientOptions {
        &self.options
    }

    /// The host stack handle
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The host stack handle, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The group orchestrator
    pub fn orchestrator(&self) -> &GroupOrchestrator {
        &self.orchestrator
    }

    /// Procedure holding the serializer gate
    pub fn in_flight(&self) -> Option<ProcedureKind> {
        self.serializer.in_flight()
    }

    /// Whether the application asked for the group to play
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    fn notify(&mut self, stream: StreamRef, transition: &Transition) {
        self.transport.ase_state_changed(stream, transition.to);
    }

    /// A peer connected. Creates or re-attaches its entry and discovers it when its
    /// endpoints are unknown.
    ///
    /// # Errors
    /// `AudioError::NoSpace` if the registry is full, or discovery errors.
    pub fn on_connection_established(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
    ) -> Result<(), AudioError> {
        match registry.add_by_connection(conn) {
            Ok(()) => info!("[CLIENT] {} connected", conn.peer),
            Err(e) if e.is_already() => debug!("[CLIENT] {} reconnected", conn.peer),
            Err(e) => {
                warn!("[CLIENT] Cannot track {}: {}", conn.peer, e);
                return Err(e);
            }
        }

        if !self.options.discover_on_connect {
            return Ok(());
        }

        let device = registry.lookup_by_connection(conn)?;
        let known = Direction::ALL
            .into_iter()
            .any(|dir| !device.dir(dir).endpoints().is_empty());
        if known {
            return Ok(());
        }

        self.discover(registry, conn, self.options.discover_direction)
    }

    /// A peer disconnected; its session state is dropped
    ///
    /// # Errors
    /// Currently infallible.
    pub fn on_connection_lost(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
        reason: u8,
    ) -> Result<(), AudioError> {
        info!("[CLIENT] {} disconnected, reason {}", conn.peer, reason);
        registry.clear_on_disconnect(conn)
    }

    /// Start discovering the endpoints of `conn` in `direction`.
    ///
    /// Directions are walked one after the other, sink first.
    ///
    /// # Errors
    /// - `AudioError::Busy` if a discovery of this peer is already running
    /// - lookup errors, or whatever the host stack reports
    pub fn discover(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
        direction: DiscoverDirection,
    ) -> Result<(), AudioError> {
        let device = registry.lookup_by_connection(conn)?;
        if Direction::ALL
            .into_iter()
            .any(|dir| device.dir(dir).waiting_for_discovery())
        {
            warn!("[CLIENT] Discovery of {} already running", conn.peer);
            return Err(AudioError::Busy);
        }

        let order = discovery_order(direction);
        let Some(&first) = order.first() else {
            return Ok(());
        };
        for dir in order {
            device.dir_mut(*dir).begin_discovery();
        }

        if let Err(e) = self.transport.discover(conn, first) {
            error!("[CLIENT] Failed to discover {}: {}", conn.peer, e);
            for dir in order {
                device.dir_mut(*dir).waiting_for_disc = false;
            }
            return Err(e);
        }
        debug!("[CLIENT] Discovering {} of {}", first, conn.peer);
        Ok(())
    }

    /// A remote endpoint was found
    ///
    /// # Errors
    /// Errors of [`PeerRegistry::add_endpoint`].
    pub fn on_ase_discovered(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
        dir: Direction,
        endpoint: EndpointDescriptor,
    ) -> Result<(), AudioError> {
        trace!("[CLIENT] {} ASE {} found", dir, endpoint.ase_id);
        registry.add_endpoint(conn, dir, endpoint)
    }

    /// A codec capability record was read
    ///
    /// # Errors
    /// Errors of [`PeerRegistry::add_codec_capability`].
    pub fn on_codec_capability(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
        dir: Direction,
        capability: CodecCapability,
    ) -> Result<(), AudioError> {
        registry.add_codec_capability(conn, dir, capability)
    }

    /// The audio locations of a direction were read
    ///
    /// # Errors
    /// Lookup errors.
    pub fn on_location(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
        dir: Direction,
        locations: AudioLocation,
    ) -> Result<(), AudioError> {
        debug!("[CLIENT] {} {} locations {}", conn.peer, dir, locations.0);
        registry.set_location(conn, dir, locations)
    }

    /// The available audio contexts changed
    ///
    /// # Errors
    /// Lookup errors.
    pub fn on_available_contexts(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
        snk: AudioContext,
        src: AudioContext,
    ) -> Result<(), AudioError> {
        registry.set_available_contexts(conn, snk, src)
    }

    /// Discovery of one direction finished.
    ///
    /// `Err(AudioError::NotFound)` means the peer has no endpoints in `dir`, which is not
    /// a failure. On success the best preset is selected. Then the next waiting direction
    /// is discovered, or `DiscoveryComplete` is published and, while playing, the group
    /// is started again to take the peer in.
    ///
    /// # Errors
    /// The discovery error, lookup errors, or whatever the host stack reports.
    pub fn on_discovery_complete(
        &mut self,
        registry: &mut PeerRegistry,
        conn: Connection,
        dir: Direction,
        result: Result<(), AudioError>,
    ) -> Result<(), AudioError> {
        let device = registry.lookup_by_connection(conn)?;
        let peer = device.address();
        device.dir_mut(dir).waiting_for_disc = false;

        match result {
            Ok(()) => {
                let preferred = self.options.preferred_sample_rate(dir);
                let valid = registry.select_presets(conn, dir, preferred)?;
                if valid == 0 {
                    warn!("[CLIENT] No valid codec capability for {} {}", peer, dir);
                    self.transport.publish(AudioEvent::NoValidConfig { peer, dir });
                }
            }
            Err(AudioError::NotFound) => warn!("[CLIENT] No {} endpoints on {}", dir, peer),
            Err(e) => {
                error!("[CLIENT] {} discovery of {} failed: {}", dir, peer, e);
                let device = registry.lookup_by_connection(conn)?;
                for dir in Direction::ALL {
                    device.dir_mut(dir).waiting_for_disc = false;
                }
                return Err(e);
            }
        }

        let device = registry.lookup_by_connection(conn)?;
        let next = Direction::ALL
            .into_iter()
            .find(|dir| device.dir(*dir).waiting_for_discovery());
        if let Some(next) = next {
            if let Err(e) = self.transport.discover(conn, next) {
                warn!("[CLIENT] Failed to discover {} of {}: {}", next, peer, e);
                device.dir_mut(next).waiting_for_disc = false;
                return Err(e);
            }
            return Ok(());
        }

        info!("[CLIENT] Discovery of {} complete", peer);
        self.transport.publish(AudioEvent::DiscoveryComplete { peer });

        if self.playing {
            self.start_group(registry)?;
        }
        Ok(())
    }

    /// A remote endpoint accepted a codec configuration and reported its QoS preference.
    ///
    /// The endpoint joins its direction's presentation delay and transport latency
    /// negotiation; members that have to move are updated or the group is recreated.
    ///
    /// # Errors
    /// - `AudioError::InvalidState` if the endpoint cannot be configured now
    /// - negotiation errors such as `AudioError::NoCommonGround`
    pub fn on_stream_configured(
        &mut self,
        registry: &mut PeerRegistry,
        stream: StreamRef,
        codec: CodecConfig,
        preference: QosPreference,
    ) -> Result<(), AudioError> {
        let dir = stream.direction();
        let group_id = self.orchestrator.group().id();
        let preset_qos = registry.peer_of(stream)?.dir(dir).preset().map(|p| p.qos);

        let ase = registry.endpoint(stream)?;
        let trigger = if ase.state() == EndpointState::Idle {
            Trigger::Configure
        } else {
            Trigger::Reconfigure
        };
        if transition(ase.state(), trigger, dir).is_none() {
            warn!("[CLIENT] {} cannot be configured in state {}", stream, ase.state());
            return Err(AudioError::InvalidState);
        }
        let candidate = Candidate {
            stream: Some(stream),
            group: ase.group_id(),
            preference,
        };

        // Nothing is written to the endpoint until it has a delay to join with
        let pd = compute_presentation_delay(&candidate, registry.streams(), group_id, dir)
            .inspect_err(|e| warn!("[CLIENT] No presentation delay for {}: {}", stream, e))?;

        let ase = registry.endpoint_mut(stream)?;
        let transition = ase.apply(trigger)?;
        ase.codec_config = Some(codec);
        ase.qos_preference = preference;
        if ase.qos.is_none() {
            ase.qos = preset_qos;
        }
        self.notify(stream, &transition);
        info!("[CLIENT] {} configured", stream);

        let before = self.orchestrator.group().committed_presentation_delay(dir);
        let (snk, src) = per_direction(dir, pd.value_us);
        let mut action =
            apply_presentation_delay(registry, self.orchestrator.group_mut(), snk, src);
        if before != Some(pd.value_us) {
            self.transport.publish(AudioEvent::PresentationDelayChanged {
                dir,
                presentation_delay_us: pd.value_us,
            });
        }

        if let Some(latency) = compute_max_transport_latency(registry.streams(), group_id, dir) {
            let (snk, src) = per_direction(dir, latency);
            action = action.escalate(apply_max_transport_latency(
                registry,
                self.orchestrator.group_mut(),
                snk,
                src,
            ));
        }

        self.transport
            .publish(AudioEvent::ConfigReceived { stream });

        match action {
            ActionRequired::None => {}
            ActionRequired::StreamReconfigureQos => {
                debug!("[CLIENT] QoS update needed after configuring {}", stream);
                self.dispatch(registry, ProcedureKind::Update)?;
            }
            ActionRequired::GroupRestart => {
                info!("[CLIENT] Group restart needed after configuring {}", stream);
                self.restart_group(registry)?;
            }
        }
        Ok(())
    }

    /// The remote reported an endpoint state change.
    ///
    /// # Errors
    /// `AudioError::InvalidState` if the change is not legal, or errors restarting the
    /// group once a pending recreation can go ahead.
    pub fn on_ase_event(
        &mut self,
        registry: &mut PeerRegistry,
        stream: StreamRef,
        trigger: Trigger,
    ) -> Result<Transition, AudioError> {
        let ase = registry.endpoint_mut(stream)?;
        let transition = ase.apply(trigger)?;
        if transition.lifecycle == Some(Lifecycle::QosSet) {
            ase.pending_qos_update = false;
        }
        self.notify(stream, &transition);

        match transition.lifecycle {
            Some(Lifecycle::Started) => {
                info!("[CLIENT] {} started", stream);
                self.transport.publish(AudioEvent::Streaming { stream });
            }
            Some(Lifecycle::Stopped | Lifecycle::Released) if nothing_streaming(registry) => {
                self.transport.publish(AudioEvent::NotStreaming);
            }
            _ => {}
        }

        if transition.to == EndpointState::Idle
            && self
                .orchestrator
                .on_stream_idle(registry, &mut self.transport)?
        {
            info!("[CLIENT] Group released, starting it again");
            self.start_group(registry)?;
        }

        Ok(transition)
    }

    /// The isochronous channel of `stream` is up. Only a sink moves on; a source waits
    /// for the remote to start.
    ///
    /// # Errors
    /// See [`UnicastClient::on_ase_event`].
    pub fn on_transport_connected(
        &mut self,
        registry: &mut PeerRegistry,
        stream: StreamRef,
    ) -> Result<Option<Transition>, AudioError> {
        match stream.direction() {
            Direction::Sink => self
                .on_ase_event(registry, stream, Trigger::TransportConnected)
                .map(Some),
            Direction::Source => Ok(None),
        }
    }

    /// The isochronous channel of `stream` went down.
    ///
    /// # Errors
    /// See [`UnicastClient::on_ase_event`].
    pub fn on_transport_disconnected(
        &mut self,
        registry: &mut PeerRegistry,
        stream: StreamRef,
        reason: u8,
    ) -> Result<Option<Transition>, AudioError> {
        let state = registry.endpoint(stream)?.state();
        debug!("[CLIENT] {} transport down in {}, reason {}", stream, state, reason);

        let trigger = match (state, stream.direction()) {
            (EndpointState::Releasing, _) => Trigger::TransportTornDown,
            (EndpointState::Enabling | EndpointState::Streaming, Direction::Sink) => {
                Trigger::TransportLost
            }
            _ => return Ok(None),
        };
        self.on_ase_event(registry, stream, trigger).map(Some)
    }

    /// The host stack finished a multi-stream procedure. Queued requests are replayed
    /// in order until one is handed over. A completion for anything but the procedure
    /// in flight is dropped and the gate stays closed.
    ///
    /// # Errors
    /// Currently infallible; replay failures are logged.
    pub fn on_procedure_complete(
        &mut self,
        registry: &mut PeerRegistry,
        kind: ProcedureKind,
        result: Result<(), AudioError>,
    ) -> Result<(), AudioError> {
        if let Err(e) = result {
            warn!("[CLIENT] {} procedure failed: {}", kind, e);
        }
        if self.serializer.in_flight() != Some(kind) {
            warn!(
                "[CLIENT] Ignoring {} completion, {} is in flight",
                kind,
                self.serializer.in_flight()
            );
            return Ok(());
        }

        let mut next = self.serializer.on_complete();
        while let Some(kind) = next {
            match self.dispatch(registry, kind) {
                Ok(Dispatch::InFlight | Dispatch::Queued) => return Ok(()),
                Ok(Dispatch::Nothing) => {}
                Err(e) => warn!("[CLIENT] Replaying {} failed: {}", kind, e),
            }
            next = self.serializer.on_complete();
        }
        Ok(())
    }

    /// Start every stream of every connected peer
    ///
    /// # Errors
    /// `AudioError::NoValidStreams` if no peer can stream, or host stack errors.
    pub fn start_group(&mut self, registry: &mut PeerRegistry) -> Result<Dispatch, AudioError> {
        self.playing = true;
        self.dispatch(registry, ProcedureKind::Start)
    }

    /// Release every stream of the group
    ///
    /// # Errors
    /// Host stack errors.
    pub fn stop_group(&mut self, registry: &mut PeerRegistry) -> Result<Dispatch, AudioError> {
        self.playing = false;
        self.dispatch(registry, ProcedureKind::Stop)
    }

    fn dispatch(
        &mut self,
        registry: &mut PeerRegistry,
        kind: ProcedureKind,
    ) -> Result<Dispatch, AudioError> {
        let dispatch = match kind {
            ProcedureKind::Start => {
                self.orchestrator
                    .start(registry, &mut self.serializer, &mut self.transport)
            }
            ProcedureKind::Update => {
                self.orchestrator
                    .update(registry, &mut self.serializer, &mut self.transport)
            }
            ProcedureKind::Stop => {
                self.orchestrator
                    .stop(registry, &mut self.serializer, &mut self.transport)
            }
        }?;
        trace!("[CLIENT] {} dispatched: {}", kind, dispatch);
        Ok(dispatch)
    }

    fn restart_group(&mut self, registry: &mut PeerRegistry) -> Result<(), AudioError> {
        if !self.orchestrator.group().is_created() {
            return Ok(());
        }
        let restarted =
            self.orchestrator
                .restart(registry, &mut self.serializer, &mut self.transport)?;
        if restarted.is_none() {
            self.start_group(registry)?;
        }
        Ok(())
    }
}

/// Sink streams of connected peers that are streaming and can take audio
pub fn send_ready_streams(registry: &PeerRegistry) -> impl Iterator<Item = StreamRef> + '_ {
    registry
        .peers()
        .filter(|device| device.is_connected())
        .flat_map(|device| device.dir(Direction::Sink).streams().iter())
        .filter(|ase| ase.state() == EndpointState::Streaming)
        .map(|ase| ase.stream())
}

/// Union of the audio locations of every known peer in `dir`
#[must_use]
pub fn get_locations(registry: &PeerRegistry, dir: Direction) -> AudioLocation {
    registry
        .peers()
        .map(|device| device.dir(dir).locations())
        .fold(AudioLocation::MONO_AUDIO, AudioLocation::union)
}

/// Codec parameters of a configured stream.
///
/// # Errors
/// - `AudioError::NotFound` if the handle is stale or the stream is not configured
/// - `AudioError::InvalidArgument` if the codec configuration is malformed
pub fn config_get(registry: &PeerRegistry, stream: StreamRef) -> Result<StreamConfig, AudioError> {
    let ase = registry.endpoint(stream)?;
    let Some(codec) = ase.codec_config() else {
        warn!("[CLIENT] No codec configured on {}", stream);
        return Err(AudioError::NotFound);
    };
    Ok(StreamConfig {
        bitrate: codec.bitrate()?,
        sample_rate_hz: codec.sample_rate_hz()?,
        presentation_delay_us: ase.presentation_delay_us(),
    })
}
