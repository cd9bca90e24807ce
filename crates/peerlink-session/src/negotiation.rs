//! Offer/answer state machine.
//!
//! [`Negotiator`] owns the peer link for one call attempt and decides, based
//! on [`NegotiationState`], whether an offer or answer may be produced or
//! applied. Operations that arrive in the wrong state are logged and
//! reported as [`Step::Rejected`]; they never send and never touch the link.
//!
//! Every link call is raced against the attempt's cancellation token. Once
//! the attempt is cancelled (hangup, teardown), a completion that lands late
//! is discarded instead of mutating state or emitting envelopes.

use crate::candidates::CandidateBuffer;
use crate::channel::SignalingChannel;
use crate::error::{LinkError, SessionError};
use crate::link::PeerLink;
use peerlink_common::{IceCandidate, SessionDescription, SignalingEnvelope};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl NegotiationState {
    /// Idle is the pre-negotiation form of Stable.
    fn is_stable(self) -> bool {
        matches!(self, Self::Idle | Self::Stable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateOffer,
    ReceiveOffer,
    ReceiveAnswer,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateOffer => "create offer",
            Self::ReceiveOffer => "apply remote offer",
            Self::ReceiveAnswer => "apply remote answer",
        })
    }
}

/// An operation attempted in a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {operation} in state {state:?}")]
pub struct StateViolation {
    pub operation: Operation,
    pub state: NegotiationState,
}

/// Outcome of one negotiation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advanced(NegotiationState),
    Rejected(StateViolation),
    /// The attempt was cancelled while the operation was in flight.
    Discarded,
}

pub struct Negotiator {
    link: Arc<dyn PeerLink>,
    candidates: CandidateBuffer,
    state: NegotiationState,
    cancel: CancellationToken,
}

impl Negotiator {
    pub fn new(link: Arc<dyn PeerLink>) -> Self {
        Self {
            candidates: CandidateBuffer::new(link.clone()),
            link,
            state: NegotiationState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Token that aborts whatever this attempt has in flight.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.pending_len()
    }

    /// Produce a local offer, apply it, and send it.
    pub async fn create_offer(&mut self, channel: &dyn SignalingChannel) -> Result<Step, SessionError> {
        if !self.state.is_stable() {
            return Ok(self.reject(Operation::CreateOffer));
        }

        let Some(offer) = self.guarded(self.link.create_offer()).await? else {
            return Ok(Step::Discarded);
        };
        if self.guarded(self.link.set_local_description(offer.clone())).await?.is_none() {
            return Ok(Step::Discarded);
        }
        self.transition(NegotiationState::HaveLocalOffer);

        channel.send(&SignalingEnvelope::offer(&offer)).await?;
        Ok(Step::Advanced(self.state))
    }

    /// Apply a remote offer, answer it, send the answer, then release buffered candidates.
    pub async fn receive_offer(
        &mut self,
        offer: SessionDescription,
        channel: &dyn SignalingChannel,
    ) -> Result<Step, SessionError> {
        // No rollback: an offer that collides with our own is dropped.
        if !self.state.is_stable() {
            return Ok(self.reject(Operation::ReceiveOffer));
        }

        if self.guarded(self.link.set_remote_description(offer)).await?.is_none() {
            return Ok(Step::Discarded);
        }
        self.transition(NegotiationState::HaveRemoteOffer);

        let Some(answer) = self.guarded(self.link.create_answer()).await? else {
            return Ok(Step::Discarded);
        };
        if self.guarded(self.link.set_local_description(answer.clone())).await?.is_none() {
            return Ok(Step::Discarded);
        }
        self.transition(NegotiationState::Stable);

        channel.send(&SignalingEnvelope::answer(&answer)).await?;
        self.candidates.flush().await;
        Ok(Step::Advanced(self.state))
    }

    /// Apply the answer to our outstanding offer, then release buffered candidates.
    pub async fn receive_answer(&mut self, answer: SessionDescription) -> Result<Step, SessionError> {
        if self.state != NegotiationState::HaveLocalOffer {
            return Ok(self.reject(Operation::ReceiveAnswer));
        }

        if self.guarded(self.link.set_remote_description(answer)).await?.is_none() {
            return Ok(Step::Discarded);
        }
        self.transition(NegotiationState::Stable);

        self.candidates.flush().await;
        Ok(Step::Advanced(self.state))
    }

    pub async fn receive_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            tracing::debug!("Ignoring candidate for closed negotiation");
            return;
        }
        self.candidates.push(candidate).await;
    }

    /// Cancel in-flight work and release the link. Idempotent.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.transition(NegotiationState::Closed);
        self.cancel.cancel();
        self.link.close().await;
    }

    fn reject(&self, operation: Operation) -> Step {
        let violation = StateViolation {
            operation,
            state: self.state,
        };
        tracing::warn!(%violation, "Ignoring negotiation step");
        Step::Rejected(violation)
    }

    fn transition(&mut self, next: NegotiationState) {
        tracing::debug!(from = ?self.state, to = ?next, "Negotiation state change");
        self.state = next;
    }

    /// Run a link operation unless the attempt is cancelled first. `None` means cancelled.
    async fn guarded<T>(
        &self,
        op: impl Future<Output = Result<T, LinkError>>,
    ) -> Result<Option<T>, LinkError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            result = op => {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                result.map(Some)
            }
        }
    }
}
