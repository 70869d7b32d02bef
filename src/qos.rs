//! QoS Negotiation
//!
//! All endpoints of one direction inside the unicast group must render with the same
//! presentation delay, and the group's max transport latency is the tightest any of
//! them asks for. This module computes those values from the endpoints' QoS
//! preferences and writes them back, reporting how disruptive the change is.
//!
//! Presentation delays are in microseconds, transport latencies in milliseconds.

use crate::ase::{AudioStreamEndpoint, EndpointState, StreamRef};
use crate::group::UnicastGroup;
use crate::registry::PeerRegistry;
use crate::{AudioError, Direction};

/// SDU framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Framing {
    /// Unframed SDUs
    #[default]
    Unframed,
    /// Framed SDUs
    Framed,
}

/// LE PHY used by the isochronous stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phy {
    /// LE 1M
    Le1M,
    /// LE 2M
    #[default]
    Le2M,
    /// LE Coded
    LeCoded,
}

/// QoS configuration of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QosConfig {
    /// SDU interval in microseconds
    pub interval_us: u32,
    /// Framing
    pub framing: Framing,
    /// PHY
    pub phy: Phy,
    /// Maximum SDU size in octets
    pub sdu: u16,
    /// Retransmission number
    pub rtn: u8,
    /// Max transport latency in milliseconds
    pub max_transport_latency_ms: u16,
    /// Presentation delay in microseconds
    pub presentation_delay_us: u32,
}

/// QoS preference reported by a remote endpoint once codec configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QosPreference {
    /// Whether unframed SDUs are supported
    pub unframed_supported: bool,
    /// Preferred PHY
    pub phy: Phy,
    /// Preferred retransmission number
    pub rtn: u8,
    /// Max transport latency in milliseconds
    pub max_transport_latency_ms: u16,
    /// Minimum presentation delay in microseconds
    pub pd_min_us: u32,
    /// Maximum presentation delay in microseconds
    pub pd_max_us: u32,
    /// Preferred minimum presentation delay in microseconds, zero for no preference
    pub pref_pd_min_us: u32,
    /// Preferred maximum presentation delay in microseconds, zero for no preference
    pub pref_pd_max_us: u32,
}

impl QosPreference {
    /// No preference reported yet
    pub const NONE: QosPreference = QosPreference {
        unframed_supported: false,
        phy: Phy::Le2M,
        rtn: 0,
        max_transport_latency_ms: 0,
        pd_min_us: 0,
        pd_max_us: 0,
        pref_pd_min_us: 0,
        pref_pd_max_us: 0,
    };

    /// Preference with only the presentation delay window filled in
    #[must_use]
    pub const fn presentation_delay(
        pd_min_us: u32,
        pref_pd_min_us: u32,
        pref_pd_max_us: u32,
        pd_max_us: u32,
    ) -> Self {
        Self {
            pd_min_us,
            pd_max_us,
            pref_pd_min_us,
            pref_pd_max_us,
            ..Self::NONE
        }
    }

    /// Set the max transport latency
    #[must_use]
    pub const fn with_max_transport_latency(mut self, latency_ms: u16) -> Self {
        self.max_transport_latency_ms = latency_ms;
        self
    }
}

/// How disruptive applying a new value is, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActionRequired {
    /// Nothing to do
    #[default]
    None,
    /// Affected streams need a QoS update
    StreamReconfigureQos,
    /// The group must be torn down and recreated
    GroupRestart,
}

impl ActionRequired {
    /// The more severe of two actions
    #[must_use]
    pub fn escalate(self, other: ActionRequired) -> ActionRequired {
        self.max(other)
    }
}

/// Outcome of a presentation delay negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PresentationDelay {
    /// Delay to use, in microseconds
    pub value_us: u32,
    /// Whether members already committed to another value must change
    pub reconfig_needed: bool,
}

/// The endpoint asking to join a direction's negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// The candidate's own endpoint, skipped when walking members
    pub stream: Option<StreamRef>,
    /// Group the candidate is bound to, if any
    pub group: Option<u8>,
    /// The candidate's preference
    pub preference: QosPreference,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    pd_min: u32,
    pref_pd_min: u32,
    pref_pd_max: u32,
    pd_max: u32,
}

impl Window {
    const OPEN: Window = Window {
        pd_min: 0,
        pref_pd_min: 0,
        pref_pd_max: u32::MAX,
        pd_max: u32::MAX,
    };

    fn fold(&mut self, pref: &QosPreference) -> Result<(), AudioError> {
        if pref.pd_min_us == 0 || pref.pd_max_us == 0 {
            return Err(AudioError::InvalidArgument);
        }
        self.pd_min = self.pd_min.max(pref.pd_min_us);
        self.pref_pd_min = self.pref_pd_min.max(pref.pref_pd_min_us);
        self.pref_pd_max = self.pref_pd_max.min(pref.pref_pd_max_us);
        self.pd_max = self.pd_max.min(pref.pd_max_us);
        Ok(())
    }

    fn select(&self) -> u32 {
        if self.pref_pd_min == 0 || self.pref_pd_min < self.pd_min {
            self.pd_min
        } else if self.pref_pd_min <= self.pd_max {
            self.pref_pd_min
        } else {
            warn!(
                "[QOS] pref_pd_min > pd_max ({} > {}), using pd_min {}",
                self.pref_pd_min,
                self.pd_max,
                self.pd_min
            );
            self.pd_min
        }
    }
}

/// Compute the presentation delay a candidate can join `group` in `dir` with.
///
/// Members already committed to a delay inside the candidate's hard window keep it.
/// Otherwise the windows of every member are intersected and the tightest mutually
/// preferred minimum is picked, falling back to the hard minimum.
///
/// # Errors
/// - `AudioError::InvalidArgument` for zero bounds, a candidate bound to another group,
///   members committed to different delays, or a member with no committed delay
/// - `AudioError::NoCommonGround` when the windows do not overlap
pub fn compute_presentation_delay<'a>(
    candidate: &Candidate,
    members: impl IntoIterator<Item = &'a AudioStreamEndpoint>,
    group: u8,
    dir: Direction,
) -> Result<PresentationDelay, AudioError> {
    let pref = &candidate.preference;
    if pref.pd_min_us == 0 || pref.pd_max_us == 0 {
        return Err(AudioError::InvalidArgument);
    }
    if candidate.group.is_some_and(|g| g != group) {
        warn!("[QOS] Candidate group differs from group {}", group);
        return Err(AudioError::InvalidArgument);
    }

    let mut common = Window::OPEN;
    common.fold(pref)?;

    let mut existing: Option<u32> = None;
    let mut reconfig_needed = false;
    let mut found = false;

    for ase in members {
        if ase.direction() != dir
            || !ase.is_active()
            || !ase.in_group(group)
            || candidate.stream == Some(ase.stream())
        {
            continue;
        }
        found = true;

        let committed = ase.presentation_delay_us();
        if committed == 0 {
            error!("[QOS] {} is active without a presentation delay", ase.stream());
            return Err(AudioError::InvalidArgument);
        }
        match existing {
            Some(value) if value != committed => {
                error!(
                    "[QOS] Members disagree on presentation delay ({} != {})",
                    value,
                    committed
                );
                return Err(AudioError::InvalidArgument);
            }
            _ => existing = Some(committed),
        }

        if (pref.pd_min_us..=pref.pd_max_us).contains(&committed) {
            return Ok(PresentationDelay {
                value_us: committed,
                reconfig_needed: false,
            });
        }

        common.fold(ase.qos_preference())?;
        reconfig_needed = true;
    }

    if !found {
        let value_us = if common.pref_pd_min != 0 {
            common.pref_pd_min
        } else {
            common.pd_min
        };
        return Ok(PresentationDelay {
            value_us,
            reconfig_needed: false,
        });
    }

    if common.pd_min > common.pd_max {
        warn!(
            "[QOS] No common presentation delay: [{}, {}]",
            common.pd_min,
            common.pd_max
        );
        return Err(AudioError::NoCommonGround);
    }

    Ok(PresentationDelay {
        value_us: common.select(),
        reconfig_needed,
    })
}

/// Tightest max transport latency asked for by the active endpoints of `group` in `dir`
#[must_use]
pub fn compute_max_transport_latency<'a>(
    members: impl IntoIterator<Item = &'a AudioStreamEndpoint>,
    group: u8,
    dir: Direction,
) -> Option<u16> {
    members
        .into_iter()
        .filter(|ase| ase.direction() == dir && ase.is_active() && ase.in_group(group))
        .map(|ase| ase.qos_preference().max_transport_latency_ms)
        .filter(|latency| *latency != 0)
        .min()
}

fn action_for(state: EndpointState) -> ActionRequired {
    match state {
        EndpointState::CodecConfigured => ActionRequired::None,
        EndpointState::QosConfigured
        | EndpointState::Enabling
        | EndpointState::Streaming
        | EndpointState::Disabling => ActionRequired::StreamReconfigureQos,
        EndpointState::Idle | EndpointState::Releasing => ActionRequired::GroupRestart,
    }
}

fn value_for<T: Copy>(dir: Direction, snk: Option<T>, src: Option<T>) -> Option<T> {
    match dir {
        Direction::Sink => snk,
        Direction::Source => src,
    }
}

/// Write presentation delays into every configured endpoint of the group.
///
/// Endpoints already past QoS configuration are flagged for the next update procedure.
pub fn apply_presentation_delay(
    registry: &mut PeerRegistry,
    group: &mut UnicastGroup,
    snk_value: Option<u32>,
    src_value: Option<u32>,
) -> ActionRequired {
    let group_id = group.id();
    let mut action = ActionRequired::None;

    for ase in registry.streams_mut() {
        if !ase.in_group(group_id) {
            continue;
        }
        let Some(value) = value_for(ase.direction(), snk_value, src_value) else {
            continue;
        };
        let Some(qos) = ase.qos.as_mut() else {
            continue;
        };
        if qos.presentation_delay_us == value {
            continue;
        }

        debug!(
            "[QOS] {} presentation delay {} -> {}",
            ase.stream,
            qos.presentation_delay_us,
            value
        );
        qos.presentation_delay_us = value;

        let needed = action_for(ase.state);
        if needed == ActionRequired::StreamReconfigureQos {
            ase.pending_qos_update = true;
        }
        action = action.escalate(needed);
    }

    for dir in Direction::ALL {
        if let Some(value) = value_for(dir, snk_value, src_value) {
            group.commit_presentation_delay(dir, value);
        }
    }

    action
}

/// Write max transport latencies into the group's endpoints.
///
/// Once the group has negotiated a latency for a direction, moving to another value
/// needs the group recreated.
pub fn apply_max_transport_latency(
    registry: &mut PeerRegistry,
    group: &mut UnicastGroup,
    snk_value: Option<u16>,
    src_value: Option<u16>,
) -> ActionRequired {
    let group_id = group.id();
    let mut action = ActionRequired::None;

    for ase in registry.streams_mut() {
        if !ase.in_group(group_id) {
            continue;
        }
        let Some(value) = value_for(ase.direction(), snk_value, src_value) else {
            continue;
        };
        if let Some(qos) = ase.qos.as_mut() {
            if qos.max_transport_latency_ms != value {
                qos.max_transport_latency_ms = value;
            }
        }
    }

    for dir in Direction::ALL {
        let Some(value) = value_for(dir, snk_value, src_value) else {
            continue;
        };
        match group.committed_max_transport_latency(dir) {
            Some(committed) if committed != value => {
                info!(
                    "[QOS] {} max transport latency {} -> {} ms",
                    dir,
                    committed,
                    value
                );
                if group.is_created() {
                    action = action.escalate(ActionRequired::GroupRestart);
                }
            }
            _ => {}
        }
        group.commit_max_transport_latency(dir, value);
    }

    action
}
