//! Audio Stream Endpoints
//!
//! Every peer embeds a fixed array of endpoints per direction. Endpoints are named by
//! a [`StreamRef`]: the peer slot, the slot's generation, the direction and the index
//! within that direction. A handle that outlives its peer simply stops resolving.

pub mod state;

use crate::address::Connection;
use crate::codec::CodecConfig;
use crate::qos::{QosConfig, QosPreference};
use crate::{AudioError, Direction};

pub use state::{EndpointState, Lifecycle, Transition, Trigger};

/// Generational handle to one embedded audio stream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamRef {
    pub(crate) slot: u8,
    pub(crate) generation: u8,
    pub(crate) dir: Direction,
    pub(crate) index: u8,
}

impl StreamRef {
    pub(crate) const fn new(slot: u8, generation: u8, dir: Direction, index: u8) -> Self {
        Self {
            slot,
            generation,
            dir,
            index,
        }
    }

    /// Direction of the endpoint
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.dir
    }

    /// Index of the endpoint within its direction
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// Whether both handles name endpoints of the same peer
    #[must_use]
    pub const fn same_peer(&self, other: &StreamRef) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

/// Binding of an endpoint to a CIS inside a unicast group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CisBinding {
    /// Group identifier
    pub group_id: u8,
    /// CIS identifier inside the group
    pub cis_id: u8,
}

/// A remote endpoint found during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// Remote ASE identifier
    pub ase_id: u8,
}

/// One audio stream endpoint and the session state attached to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStreamEndpoint {
    pub(crate) stream: StreamRef,
    pub(crate) ase_id: Option<u8>,
    pub(crate) conn: Option<Connection>,
    pub(crate) state: EndpointState,
    pub(crate) codec_config: Option<CodecConfig>,
    pub(crate) qos: Option<QosConfig>,
    pub(crate) qos_preference: QosPreference,
    pub(crate) cis: Option<CisBinding>,
    pub(crate) pending_qos_update: bool,
}

impl AudioStreamEndpoint {
    pub(crate) const fn new(stream: StreamRef) -> Self {
        Self {
            stream,
            ase_id: None,
            conn: None,
            state: EndpointState::Idle,
            codec_config: None,
            qos: None,
            qos_preference: QosPreference::NONE,
            cis: None,
            pending_qos_update: false,
        }
    }

    /// Handle naming this endpoint
    #[must_use]
    pub const fn stream(&self) -> StreamRef {
        self.stream
    }

    /// Direction
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.stream.dir
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> EndpointState {
        self.state
    }

    /// Remote ASE identifier, once discovered
    #[must_use]
    pub const fn ase_id(&self) -> Option<u8> {
        self.ase_id
    }

    /// Owning connection, while bound
    #[must_use]
    pub const fn connection(&self) -> Option<Connection> {
        self.conn
    }

    /// Codec configuration, once configured
    #[must_use]
    pub const fn codec_config(&self) -> Option<&CodecConfig> {
        self.codec_config.as_ref()
    }

    /// QoS configuration, once configured
    #[must_use]
    pub const fn qos(&self) -> Option<&QosConfig> {
        self.qos.as_ref()
    }

    /// QoS preference reported by the remote
    #[must_use]
    pub const fn qos_preference(&self) -> &QosPreference {
        &self.qos_preference
    }

    /// CIS binding, while in a created group
    #[must_use]
    pub const fn cis(&self) -> Option<CisBinding> {
        self.cis
    }

    /// Whether a QoS change is waiting for the next update procedure
    #[must_use]
    pub const fn pending_qos_update(&self) -> bool {
        self.pending_qos_update
    }

    /// Whether the endpoint takes part in negotiation
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Group the endpoint belongs to, if bound to a CIS
    #[must_use]
    pub fn group_id(&self) -> Option<u8> {
        self.cis.map(|cis| cis.group_id)
    }

    /// Whether the endpoint counts as a member of `group`.
    ///
    /// Endpoints not yet bound to any CIS are taken to join the single group.
    #[must_use]
    pub fn in_group(&self, group: u8) -> bool {
        self.group_id().is_none_or(|id| id == group)
    }

    /// Committed presentation delay in microseconds, zero if unset
    #[must_use]
    pub fn presentation_delay_us(&self) -> u32 {
        self.qos.map_or(0, |qos| qos.presentation_delay_us)
    }

    pub(crate) fn bind_cis(&mut self, binding: CisBinding) {
        self.cis = Some(binding);
    }

    /// Idempotent
    pub(crate) fn unbind_cis(&mut self) {
        if let Some(cis) = self.cis.take() {
            trace!("[ASE] {} unbound from CIS {}", self.stream, cis.cis_id);
        }
    }

    pub(crate) fn bind_remote(&mut self, conn: Connection, ase_id: u8) {
        self.conn = Some(conn);
        self.ase_id = Some(ase_id);
    }

    /// Drive the endpoint with `trigger`.
    ///
    /// On an illegal trigger the endpoint is left untouched. Re-entering
    /// `CodecConfigured` from any state but `Idle` drops the CIS binding, and
    /// reaching `Idle` clears the configuration.
    ///
    /// # Errors
    /// Returns `AudioError::InvalidState` if the trigger is not legal in the current state.
    pub fn apply(&mut self, trigger: Trigger) -> Result<Transition, AudioError> {
        let from = self.state;
        let Some(to) = state::transition(from, trigger, self.stream.dir) else {
            warn!(
                "[ASE] {} rejected {} in state {}",
                self.stream,
                trigger,
                from
            );
            return Err(AudioError::InvalidState);
        };

        if to == EndpointState::CodecConfigured && from != EndpointState::Idle {
            self.unbind_cis();
        }

        if to == EndpointState::Idle {
            self.unbind_cis();
            self.codec_config = None;
            self.qos = None;
            self.qos_preference = QosPreference::NONE;
            self.pending_qos_update = false;
        }

        self.state = to;
        debug!("[ASE] {} {} -> {}", self.stream, from, to);

        Ok(Transition {
            from,
            to,
            lifecycle: state::lifecycle(from, to),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerAddress;

    fn sink() -> AudioStreamEndpoint {
        AudioStreamEndpoint::new(StreamRef::new(0, 0, Direction::Sink, 0))
    }

    #[test]
    fn test_apply_legal_transition() {
        let mut ase = sink();
        let t = ase.apply(Trigger::Configure).unwrap();
        assert_eq!(t.from, EndpointState::Idle);
        assert_eq!(t.to, EndpointState::CodecConfigured);
        assert_eq!(t.lifecycle, Some(Lifecycle::Configured));
        assert_eq!(ase.state(), EndpointState::CodecConfigured);
    }

    #[test]
    fn test_apply_illegal_transition_leaves_endpoint_untouched() {
        let mut ase = sink();
        ase.apply(Trigger::Configure).unwrap();
        ase.bind_cis(CisBinding {
            group_id: 0,
            cis_id: 1,
        });
        let before = ase.clone();

        assert_eq!(ase.apply(Trigger::Start), Err(AudioError::InvalidState));
        assert_eq!(ase, before);
    }

    #[test]
    fn test_reconfigure_unbinds_cis() {
        let mut ase = sink();
        ase.apply(Trigger::Configure).unwrap();
        ase.bind_cis(CisBinding {
            group_id: 0,
            cis_id: 0,
        });
        ase.apply(Trigger::Reconfigure).unwrap();
        assert_eq!(ase.cis(), None);

        // Unbinding again is harmless
        ase.unbind_cis();
        assert_eq!(ase.cis(), None);
    }

    #[test]
    fn test_reaching_idle_clears_configuration() {
        let mut ase = sink();
        ase.bind_remote(Connection::new(1, PeerAddress::new([1; 6])), 3);
        ase.apply(Trigger::Configure).unwrap();
        ase.codec_config = Some(CodecConfig::default());
        ase.qos = Some(QosConfig::default());
        ase.pending_qos_update = true;
        ase.bind_cis(CisBinding {
            group_id: 0,
            cis_id: 0,
        });

        ase.apply(Trigger::Release).unwrap();
        let t = ase.apply(Trigger::TransportTornDown).unwrap();
        assert_eq!(t.lifecycle, Some(Lifecycle::Released));
        assert_eq!(ase.codec_config(), None);
        assert_eq!(ase.qos(), None);
        assert_eq!(ase.cis(), None);
        assert!(!ase.pending_qos_update());
        // The remote endpoint is still there
        assert_eq!(ase.ase_id(), Some(3));
    }

    #[test]
    fn test_group_membership() {
        let mut ase = sink();
        assert!(ase.in_group(0));
        ase.bind_cis(CisBinding {
            group_id: 1,
            cis_id: 0,
        });
        assert!(!ase.in_group(0));
        assert!(ase.in_group(1));
    }

    #[test]
    fn test_stream_ref_same_peer() {
        let a = StreamRef::new(2, 1, Direction::Sink, 0);
        let b = StreamRef::new(2, 1, Direction::Source, 1);
        let stale = StreamRef::new(2, 0, Direction::Sink, 0);
        assert!(a.same_peer(&b));
        assert!(!a.same_peer(&stale));
    }
}
