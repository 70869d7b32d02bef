//! Procedure Serializer
//!
//! The host stack runs at most one multi-stream procedure (start, update, stop) at a
//! time. A request made while another is in flight is queued and replayed, in order,
//! once the running one completes.

use crate::AudioError;
use crate::constants::MAX_PENDING_PROCEDURES;
use heapless::Deque;

/// Multi-stream procedure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProcedureKind {
    /// Configure, enable and start streams
    Start,
    /// Push new QoS to streams
    Update,
    /// Release streams
    Stop,
}

/// Result of asking for a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Dispatch {
    /// The procedure was handed to the host stack
    InFlight,
    /// Another procedure runs; this one waits its turn
    Queued,
    /// There was nothing to do
    Nothing,
}

/// Binary gate plus a FIFO of waiting requests
#[derive(Debug)]
pub struct ProcedureSerializer {
    in_flight: Option<ProcedureKind>,
    pending: Deque<ProcedureKind, MAX_PENDING_PROCEDURES>,
}

impl Default for ProcedureSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcedureSerializer {
    /// Create an idle serializer
    #[must_use]
    pub const fn new() -> Self {
        Self {
            in_flight: None,
            pending: Deque::new(),
        }
    }

    /// Take the gate for `kind` without waiting.
    ///
    /// When the gate is taken `kind` is queued for replay; a full queue drops it with a
    /// warning.
    ///
    /// # Errors
    /// `AudioError::Busy` if another procedure is in flight.
    pub fn try_begin(&mut self, kind: ProcedureKind) -> Result<(), AudioError> {
        if let Some(current) = self.in_flight {
            if self.pending.push_back(kind).is_err() {
                warn!("[PROCEDURE] Queue full, dropping {}", kind);
            } else {
                debug!("[PROCEDURE] {} queued behind {}", kind, current);
            }
            return Err(AudioError::Busy);
        }
        trace!("[PROCEDURE] {} begins", kind);
        self.in_flight = Some(kind);
        Ok(())
    }

    /// Release the gate and hand back the next request to replay, if any
    pub fn on_complete(&mut self) -> Option<ProcedureKind> {
        if let Some(kind) = self.in_flight.take() {
            trace!("[PROCEDURE] {} complete", kind);
        }
        self.pending.pop_front()
    }

    /// Release the gate after the host stack refused the request just begun
    pub fn abort(&mut self) {
        if let Some(kind) = self.in_flight.take() {
            debug!("[PROCEDURE] {} aborted", kind);
        }
    }

    /// Procedure holding the gate
    #[must_use]
    pub fn in_flight(&self) -> Option<ProcedureKind> {
        self.in_flight
    }

    /// Number of queued requests
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
