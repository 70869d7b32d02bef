//! Collaborator Interface
//!
//! The orchestration core never talks to the air itself. Every outgoing request and
//! every notification goes through an [`AudioTransport`] implemented by the host stack
//! (GATT/ASCS client, isochronous channel management, application event bus).

use crate::address::{Connection, PeerAddress};
use crate::ase::{EndpointState, StreamRef};
use crate::codec::CodecConfig;
use crate::group::GroupParams;
use crate::qos::QosConfig;
use crate::{AudioError, Direction, DiscoverDirection};

/// A stream and the QoS it should run with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamParam {
    /// Stream
    pub stream: StreamRef,
    /// QoS configuration
    pub qos: QosConfig,
}

/// Everything needed to configure and start one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartParam {
    /// Stream
    pub stream: StreamRef,
    /// Connection the remote endpoint lives on
    pub conn: Connection,
    /// Remote ASE identifier
    pub ase_id: u8,
    /// Codec configuration, including the channel allocation
    pub codec: CodecConfig,
    /// QoS configuration
    pub qos: QosConfig,
}

/// Events published to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AudioEvent {
    /// All requested directions of a peer have been discovered
    DiscoveryComplete {
        /// Peer
        peer: PeerAddress,
    },
    /// None of a peer's capability records can be served
    NoValidConfig {
        /// Peer
        peer: PeerAddress,
        /// Direction without a usable preset
        dir: Direction,
    },
    /// A stream accepted a codec configuration
    ConfigReceived {
        /// Stream
        stream: StreamRef,
    },
    /// A stream started
    Streaming {
        /// Stream
        stream: StreamRef,
    },
    /// No stream is streaming any more
    NotStreaming,
    /// The group's presentation delay for a direction changed
    PresentationDelayChanged {
        /// Direction
        dir: Direction,
        /// New delay in microseconds
        presentation_delay_us: u32,
    },
}

/// Requests and notifications towards the host stack.
///
/// Requests return once queued; their results come back through the
/// [`UnicastClient`](crate::client::UnicastClient) event handlers.
pub trait AudioTransport {
    /// An endpoint changed state
    fn ase_state_changed(&mut self, stream: StreamRef, state: EndpointState);

    /// Publish an application event
    fn publish(&mut self, event: AudioEvent);

    /// Start discovery of `dir` on `conn`
    ///
    /// # Errors
    /// `AudioError::Unsupported` unless implemented.
    fn discover(&mut self, conn: Connection, dir: Direction) -> Result<(), AudioError> {
        let _ = (conn, dir);
        Err(AudioError::Unsupported)
    }

    /// Create the isochronous group
    ///
    /// # Errors
    /// Whatever the host stack reports.
    fn create_group(&mut self, params: &GroupParams<'_>) -> Result<(), AudioError>;

    /// Delete the isochronous group
    ///
    /// # Errors
    /// `AudioError::Unsupported` unless implemented.
    fn delete_group(&mut self, group_id: u8) -> Result<(), AudioError> {
        let _ = group_id;
        Err(AudioError::Unsupported)
    }

    /// Configure, enable and start streams
    ///
    /// # Errors
    /// Whatever the host stack reports.
    fn start_streams(&mut self, params: &[StartParam]) -> Result<(), AudioError>;

    /// Push new QoS to running streams
    ///
    /// # Errors
    /// `AudioError::Unsupported` unless implemented.
    fn update_streams(&mut self, params: &[StreamParam]) -> Result<(), AudioError> {
        let _ = params;
        Err(AudioError::Unsupported)
    }

    /// Release streams
    ///
    /// # Errors
    /// Whatever the host stack reports.
    fn release_streams(&mut self, streams: &[StreamRef]) -> Result<(), AudioError>;
}

/// Which directions a discovery request covers, in the order they are walked
pub(crate) const fn discovery_order(direction: DiscoverDirection) -> &'static [Direction] {
    match direction {
        DiscoverDirection::Sink => &[Direction::Sink],
        DiscoverDirection::Source => &[Direction::Source],
        DiscoverDirection::Bidirectional => &[Direction::Sink, Direction::Source],
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::constants::{MAX_GROUP_PAIRS, MAX_GROUP_STREAMS};
    use crate::group::StreamPair;
    use heapless::Vec;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Discover(Connection, Direction),
        CreateGroup(Vec<StreamPair, MAX_GROUP_PAIRS>),
        DeleteGroup(u8),
        Start(Vec<StreamRef, MAX_GROUP_STREAMS>),
        Update(Vec<StreamRef, MAX_GROUP_STREAMS>),
        Release(Vec<StreamRef, MAX_GROUP_STREAMS>),
    }

    /// Records every request; results can be forced per request kind
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub calls: Vec<Call, 32>,
        pub events: Vec<AudioEvent, 32>,
        pub states: Vec<(StreamRef, EndpointState), 64>,
        pub start_result: Option<AudioError>,
        pub create_result: Option<AudioError>,
    }

    impl RecordingTransport {
        pub(crate) fn take_calls(&mut self) -> Vec<Call, 32> {
            core::mem::take(&mut self.calls)
        }
    }

    impl AudioTransport for RecordingTransport {
        fn ase_state_changed(&mut self, stream: StreamRef, state: EndpointState) {
            self.states.push((stream, state)).unwrap();
        }

        fn publish(&mut self, event: AudioEvent) {
            self.events.push(event).unwrap();
        }

        fn discover(&mut self, conn: Connection, dir: Direction) -> Result<(), AudioError> {
            self.calls.push(Call::Discover(conn, dir)).unwrap();
            Ok(())
        }

        fn create_group(&mut self, params: &GroupParams<'_>) -> Result<(), AudioError> {
            if let Some(e) = self.create_result {
                return Err(e);
            }
            self.calls
                .push(Call::CreateGroup(Vec::from_slice(params.pairs).unwrap()))
                .unwrap();
            Ok(())
        }

        fn delete_group(&mut self, group_id: u8) -> Result<(), AudioError> {
            self.calls.push(Call::DeleteGroup(group_id)).unwrap();
            Ok(())
        }

        fn start_streams(&mut self, params: &[StartParam]) -> Result<(), AudioError> {
            if let Some(e) = self.start_result {
                return Err(e);
            }
            let streams = params.iter().map(|p| p.stream).collect();
            self.calls.push(Call::Start(streams)).unwrap();
            Ok(())
        }

        fn update_streams(&mut self, params: &[StreamParam]) -> Result<(), AudioError> {
            let streams = params.iter().map(|p| p.stream).collect();
            self.calls.push(Call::Update(streams)).unwrap();
            Ok(())
        }

        fn release_streams(&mut self, streams: &[StreamRef]) -> Result<(), AudioError> {
            self.calls
                .push(Call::Release(Vec::from_slice(streams).unwrap()))
                .unwrap();
            Ok(())
        }
    }
}
