//! Audio Stream Endpoint States
//!
//! The ASE lifecycle as a pure table. `transition` never touches an endpoint; it only
//! answers whether a trigger is legal from a state for a given direction and where it
//! leads. Sink and source endpoints differ once enabled: a sink starts streaming when
//! its isochronous channel connects, a source when the remote answers with a start,
//! and only a source passes through `Disabling`.

use crate::Direction;

/// ASE state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointState {
    /// No configuration
    #[default]
    Idle,
    /// Codec configured, QoS not yet set
    CodecConfigured,
    /// QoS configured, ready to enable
    QosConfigured,
    /// Enable requested, waiting for the transport
    Enabling,
    /// Audio is flowing
    Streaming,
    /// Source is winding down before stop
    Disabling,
    /// Release requested, waiting for transport tear-down
    Releasing,
}

impl EndpointState {
    /// Whether the endpoint holds a configuration that takes part in negotiation
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::CodecConfigured | Self::QosConfigured | Self::Enabling | Self::Streaming
        )
    }
}

/// Events that drive an endpoint between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Trigger {
    /// First codec configuration
    Configure,
    /// Codec configuration replaced while configured
    Reconfigure,
    /// QoS configuration written
    SetQos,
    /// Enable accepted
    Enable,
    /// Isochronous channel connected
    TransportConnected,
    /// Remote reports receiver start ready
    Start,
    /// Disable accepted
    Disable,
    /// Isochronous channel lost while enabled
    TransportLost,
    /// Remote reports receiver stop ready
    Stop,
    /// Release accepted
    Release,
    /// Isochronous channel gone after release
    TransportTornDown,
}

/// Lifecycle notification produced by an accepted transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Lifecycle {
    /// Back to idle, configuration cleared
    Released,
    /// Codec configuration accepted
    Configured,
    /// QoS configuration accepted
    QosSet,
    /// Enable accepted
    Enabled,
    /// Audio started
    Started,
    /// Disable accepted
    Disabled,
    /// Audio stopped
    Stopped,
}

/// An accepted state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transition {
    /// State before the trigger
    pub from: EndpointState,
    /// State after the trigger
    pub to: EndpointState,
    /// What to tell observers, if anything
    pub lifecycle: Option<Lifecycle>,
}

/// Legality table: the state `trigger` leads to from `from`, or `None` if illegal.
#[must_use]
pub fn transition(from: EndpointState, trigger: Trigger, dir: Direction) -> Option<EndpointState> {
    use EndpointState::{
        CodecConfigured, Disabling, Enabling, Idle, QosConfigured, Releasing, Streaming,
    };

    let sink = dir == Direction::Sink;
    let source = dir == Direction::Source;

    match (from, trigger) {
        (Idle, Trigger::Configure) => Some(CodecConfigured),
        (CodecConfigured, Trigger::Reconfigure) => Some(CodecConfigured),
        (CodecConfigured | QosConfigured, Trigger::SetQos) => Some(QosConfigured),
        (QosConfigured, Trigger::Enable) => Some(Enabling),
        (Enabling, Trigger::Enable) if source => Some(Enabling),
        (Enabling, Trigger::TransportConnected) if sink => Some(Streaming),
        (Enabling, Trigger::Start) if source => Some(Streaming),
        (Enabling | Streaming, Trigger::Disable) if source => Some(Disabling),
        (Enabling | Streaming, Trigger::TransportLost) if sink => Some(QosConfigured),
        (Disabling, Trigger::Stop) if source => Some(QosConfigured),
        (CodecConfigured | QosConfigured | Enabling | Streaming, Trigger::Release) => {
            Some(Releasing)
        }
        (Disabling, Trigger::Release) if source => Some(Releasing),
        (Releasing, Trigger::TransportTornDown) => Some(Idle),
        _ => None,
    }
}

/// Lifecycle notification for an accepted `from -> to` change
#[must_use]
pub const fn lifecycle(from: EndpointState, to: EndpointState) -> Option<Lifecycle> {
    use EndpointState::{
        CodecConfigured, Disabling, Enabling, Idle, QosConfigured, Releasing, Streaming,
    };

    match (from, to) {
        (_, Idle) => Some(Lifecycle::Released),
        (_, CodecConfigured) => Some(Lifecycle::Configured),
        (Enabling | Streaming | Disabling, QosConfigured) => Some(Lifecycle::Stopped),
        (_, QosConfigured) => Some(Lifecycle::QosSet),
        (Enabling, Enabling) => None,
        (_, Enabling) => Some(Lifecycle::Enabled),
        (_, Streaming) => Some(Lifecycle::Started),
        (_, Disabling) => Some(Lifecycle::Disabled),
        (Enabling | Streaming | Disabling, Releasing) => Some(Lifecycle::Stopped),
        (_, Releasing) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EndpointState::*;

    const ALL_STATES: [EndpointState; 7] = [
        Idle,
        CodecConfigured,
        QosConfigured,
        Enabling,
        Streaming,
        Disabling,
        Releasing,
    ];

    const ALL_TRIGGERS: [Trigger; 11] = [
        Trigger::Configure,
        Trigger::Reconfigure,
        Trigger::SetQos,
        Trigger::Enable,
        Trigger::TransportConnected,
        Trigger::Start,
        Trigger::Disable,
        Trigger::TransportLost,
        Trigger::Stop,
        Trigger::Release,
        Trigger::TransportTornDown,
    ];

    #[test]
    fn test_sink_happy_path() {
        let dir = Direction::Sink;
        assert_eq!(transition(Idle, Trigger::Configure, dir), Some(CodecConfigured));
        assert_eq!(transition(CodecConfigured, Trigger::SetQos, dir), Some(QosConfigured));
        assert_eq!(transition(QosConfigured, Trigger::Enable, dir), Some(Enabling));
        assert_eq!(transition(Enabling, Trigger::TransportConnected, dir), Some(Streaming));
        assert_eq!(transition(Streaming, Trigger::Release, dir), Some(Releasing));
        assert_eq!(transition(Releasing, Trigger::TransportTornDown, dir), Some(Idle));
    }

    #[test]
    fn test_source_happy_path() {
        let dir = Direction::Source;
        assert_eq!(transition(QosConfigured, Trigger::Enable, dir), Some(Enabling));
        assert_eq!(transition(Enabling, Trigger::Enable, dir), Some(Enabling));
        assert_eq!(transition(Enabling, Trigger::Start, dir), Some(Streaming));
        assert_eq!(transition(Streaming, Trigger::Disable, dir), Some(Disabling));
        assert_eq!(transition(Disabling, Trigger::Stop, dir), Some(QosConfigured));
        assert_eq!(transition(Disabling, Trigger::Release, dir), Some(Releasing));
    }

    #[test]
    fn test_direction_specific_rows() {
        // Sink streams on transport, source on start
        assert_eq!(transition(Enabling, Trigger::Start, Direction::Sink), None);
        assert_eq!(
            transition(Enabling, Trigger::TransportConnected, Direction::Source),
            None
        );
        // Only a source disables or stops
        assert_eq!(transition(Streaming, Trigger::Disable, Direction::Sink), None);
        assert_eq!(transition(Disabling, Trigger::Stop, Direction::Sink), None);
        // Only a sink falls back on transport loss
        assert_eq!(
            transition(Streaming, Trigger::TransportLost, Direction::Sink),
            Some(QosConfigured)
        );
        assert_eq!(
            transition(Streaming, Trigger::TransportLost, Direction::Source),
            None
        );
        // Re-enable is a source-only self loop
        assert_eq!(transition(Enabling, Trigger::Enable, Direction::Sink), None);
    }

    #[test]
    fn test_idle_only_accepts_configure() {
        for dir in Direction::ALL {
            for trigger in ALL_TRIGGERS {
                let expected = (trigger == Trigger::Configure).then_some(CodecConfigured);
                assert_eq!(transition(Idle, trigger, dir), expected);
            }
        }
    }

    #[test]
    fn test_reconfigure_only_from_codec_configured() {
        for dir in Direction::ALL {
            for state in ALL_STATES {
                let expected = (state == CodecConfigured).then_some(CodecConfigured);
                assert_eq!(transition(state, Trigger::Reconfigure, dir), expected);
            }
        }
    }

    #[test]
    fn test_releasing_only_leaves_on_teardown() {
        for dir in Direction::ALL {
            for trigger in ALL_TRIGGERS {
                let expected = (trigger == Trigger::TransportTornDown).then_some(Idle);
                assert_eq!(transition(Releasing, trigger, dir), expected);
            }
        }
    }

    #[test]
    fn test_lifecycle_mapping() {
        assert_eq!(lifecycle(Releasing, Idle), Some(Lifecycle::Released));
        assert_eq!(lifecycle(Idle, CodecConfigured), Some(Lifecycle::Configured));
        assert_eq!(lifecycle(CodecConfigured, QosConfigured), Some(Lifecycle::QosSet));
        assert_eq!(lifecycle(Streaming, QosConfigured), Some(Lifecycle::Stopped));
        assert_eq!(lifecycle(Disabling, QosConfigured), Some(Lifecycle::Stopped));
        assert_eq!(lifecycle(QosConfigured, Enabling), Some(Lifecycle::Enabled));
        assert_eq!(lifecycle(Enabling, Enabling), None);
        assert_eq!(lifecycle(Enabling, Streaming), Some(Lifecycle::Started));
        assert_eq!(lifecycle(Streaming, Disabling), Some(Lifecycle::Disabled));
        assert_eq!(lifecycle(Streaming, Releasing), Some(Lifecycle::Stopped));
        assert_eq!(lifecycle(QosConfigured, Releasing), None);
    }

    #[test]
    fn test_active_states() {
        let active: heapless::Vec<EndpointState, 7> =
            ALL_STATES.into_iter().filter(|s| s.is_active()).collect();
        assert_eq!(
            active.as_slice(),
            &[CodecConfigured, QosConfigured, Enabling, Streaming]
        );
    }
}
