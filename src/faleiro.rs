//! The module that contains the proposer and acceptor of the single-shot
//! Faleiro lattice agreement protocol, and the router that dispatches
//! transport messages to them.
//!
//! Every process plays both roles. A proposer broadcasts its value, counts
//! Acks and Nacks for the active proposal number, folds Nack values into the
//! proposal, and decides once a majority Acks. An acceptor keeps a single
//! `accepted_value` that only ever moves up the lattice.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};

use log::Level;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::lattice::Lattice;
use crate::message::FaleiroMessage;
use crate::transport::{MessageHandler, ProcessDescriptor, Transport};

/// The reply an acceptor produces for one proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptorResponse<L> {
    Ack {
        proposal_number: u64,
        value: L,
        proposer_id: u64,
    },
    Nack {
        proposal_number: u64,
        value: L,
        proposer_id: u64,
    },
}

/// Applies one proposal to an accepted value and produces the reply. The
/// accepted value never decreases: an acceptable proposal replaces it with a
/// dominating value, a rejected one is joined into it and the join is
/// reported back so the proposer can refine.
pub(crate) fn respond<L: Lattice>(
    accepted_value: &mut L,
    proposal_number: u64,
    proposed_value: L,
    proposer_id: u64,
) -> AcceptorResponse<L> {
    if accepted_value.leq(&proposed_value) {
        *accepted_value = proposed_value.clone();
        AcceptorResponse::Ack {
            proposal_number,
            value: proposed_value,
            proposer_id,
        }
    } else {
        *accepted_value = L::join(accepted_value, &proposed_value);
        AcceptorResponse::Nack {
            proposal_number,
            value: accepted_value.clone(),
            proposer_id,
        }
    }
}

/// The sending half of the protocol: the transport plus the descriptor table
/// of every participant (this process included; its own messages are
/// delivered over loopback).
pub struct FaleiroProtocol<L> {
    transport: Transport,
    descriptors: Mutex<HashMap<u64, ProcessDescriptor>>,

    value: PhantomData<L>,
}

impl<L> FaleiroProtocol<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(transport: Transport) -> Arc<Self> {
        Arc::new(FaleiroProtocol {
            transport,
            descriptors: Mutex::new(HashMap::new()),
            value: PhantomData,
        })
    }

    pub fn add_process(&self, descriptor: ProcessDescriptor) {
        self.descriptors.lock().unwrap().insert(descriptor.id, descriptor);
    }

    pub fn local_port(&self) -> u64 {
        self.transport.local_port()
    }

    /// Registers the two roles with the transport and starts receiving.
    pub fn start(&self, proposer: Arc<Proposer<L>>, acceptor: Arc<Acceptor<L>>) {
        self.transport.start(Arc::new(FaleiroRouter { proposer, acceptor }));
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    /// Broadcasts a proposal to every participant.
    pub fn send_proposal(&self, proposed_value: &L, proposal_number: u64, proposer_id: u64) {
        let payload = FaleiroMessage::Proposal {
            proposal_number,
            proposed_value: proposed_value.clone(),
            proposer_id,
        }
        .encode();
        let descriptors = self.descriptors.lock().unwrap();
        for peer in descriptors.values() {
            if log_enabled!(Level::Info) {
                info!(
                    ">> sending proposal {} of proposer {} to {}",
                    proposal_number, proposer_id, peer.id
                );
            }
            self.transport.send(peer, payload.clone());
        }
    }

    /// Sends an acceptor reply back to the proposer it belongs to.
    pub fn send_response(&self, to: u64, response: AcceptorResponse<L>) {
        let payload = match response {
            AcceptorResponse::Ack {
                proposal_number,
                value,
                proposer_id,
            } => {
                if log_enabled!(Level::Info) {
                    info!(">> sending ack for proposal {} to {}", proposal_number, to);
                }
                FaleiroMessage::Ack {
                    proposal_number,
                    proposer_id,
                    value,
                }
            }
            AcceptorResponse::Nack {
                proposal_number,
                value,
                proposer_id,
            } => {
                if log_enabled!(Level::Info) {
                    info!(">> sending nack for proposal {} to {}", proposal_number, to);
                }
                FaleiroMessage::Nack {
                    proposal_number,
                    proposer_id,
                    value,
                }
            }
        }
        .encode();
        let descriptors = self.descriptors.lock().unwrap();
        match descriptors.get(&to) {
            Some(peer) => self.transport.send(peer, payload),
            None => warn!("no descriptor for proposer {}, dropping response", to),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Status {
    Passive,
    Active,
}

struct ProposerState<L> {
    status: Status,

    // Replies counted for the active proposal number only.
    ack_count: u64,
    nack_count: u64,

    // Strictly increasing; replies carrying an older number are ignored.
    active_proposal_number: u64,

    // Only ever moves up: refinement joins every Nack value into it.
    proposed_value: L,
}

/// The proposing role. `start` runs the agreement loop on the calling thread
/// while replies are counted by the transport dispatchers.
pub struct Proposer<L> {
    uid: u64,

    // The number of participants; the decision quorum is a majority of it.
    n: u64,

    state: Mutex<ProposerState<L>>,
    replies: Condvar,

    protocol: Arc<FaleiroProtocol<L>>,
}

impl<L> Proposer<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(protocol: Arc<FaleiroProtocol<L>>, uid: u64, n: u64) -> Arc<Self> {
        Arc::new(Proposer {
            uid,
            n,
            state: Mutex::new(ProposerState {
                status: Status::Passive,
                ack_count: 0,
                nack_count: 0,
                active_proposal_number: 0,
                proposed_value: L::default(),
            }),
            replies: Condvar::new(),
            protocol,
        })
    }

    /// Proposes `initial_value` and blocks until this process has learned a
    /// decision, which is returned. Single-shot: later calls return the
    /// already decided value.
    pub fn start(&self, initial_value: L) -> L {
        let mut state = self.state.lock().unwrap();
        if state.active_proposal_number == 0 {
            state.proposed_value = initial_value;
            state.status = Status::Active;
            state.active_proposal_number = 1;
            self.protocol
                .send_proposal(&state.proposed_value, state.active_proposal_number, self.uid);
        }
        loop {
            if let Some(decision) = Self::decide(&mut state, self.n) {
                return decision;
            }
            if state.status == Status::Passive {
                // Already decided, possibly by an earlier call.
                return state.proposed_value.clone();
            }
            if Self::should_refine(&state, self.n) {
                state.active_proposal_number += 1;
                state.ack_count = 0;
                state.nack_count = 0;
                self.protocol.send_proposal(
                    &state.proposed_value,
                    state.active_proposal_number,
                    self.uid,
                );
            }
            state = self.replies.wait(state).unwrap();
        }
    }

    pub fn process_ack(&self, proposal_number: u64) {
        let mut state = self.state.lock().unwrap();
        if proposal_number == state.active_proposal_number {
            if log_enabled!(Level::Info) {
                info!("[P={}] ack received for proposal {}", self.uid, proposal_number);
            }
            state.ack_count += 1;
            self.replies.notify_one();
        }
    }

    pub fn process_nack(&self, proposal_number: u64, value: &L) {
        let mut state = self.state.lock().unwrap();
        if proposal_number == state.active_proposal_number {
            if log_enabled!(Level::Info) {
                info!("[P={}] nack received for proposal {}", self.uid, proposal_number);
            }
            state.proposed_value = L::join(&state.proposed_value, value);
            state.nack_count += 1;
            self.replies.notify_one();
        }
    }

    fn decide(state: &mut ProposerState<L>, n: u64) -> Option<L> {
        if state.status == Status::Active && state.ack_count >= (n + 2) / 2 {
            state.status = Status::Passive;
            Some(state.proposed_value.clone())
        } else {
            None
        }
    }

    fn should_refine(state: &ProposerState<L>, n: u64) -> bool {
        state.status == Status::Active
            && state.nack_count > 0
            && state.ack_count + state.nack_count >= (n + 2) / 2
    }
}

/// The accepting role: a single monotonically growing accepted value.
pub struct Acceptor<L> {
    accepted_value: Mutex<L>,

    protocol: Arc<FaleiroProtocol<L>>,
}

impl<L> Acceptor<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(protocol: Arc<FaleiroProtocol<L>>) -> Arc<Self> {
        Arc::new(Acceptor {
            accepted_value: Mutex::new(L::default()),
            protocol,
        })
    }

    pub fn process_proposal(&self, proposal_number: u64, proposed_value: L, proposer_id: u64) {
        let response = {
            let mut accepted_value = self.accepted_value.lock().unwrap();
            respond(&mut *accepted_value, proposal_number, proposed_value, proposer_id)
        };
        self.protocol.send_response(proposer_id, response);
    }

    /// A snapshot of the accepted value.
    pub fn accepted_value(&self) -> L {
        self.accepted_value.lock().unwrap().clone()
    }
}

struct FaleiroRouter<L> {
    proposer: Arc<Proposer<L>>,
    acceptor: Arc<Acceptor<L>>,
}

impl<L> MessageHandler for FaleiroRouter<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    fn on_message_received(&self, message: Vec<u8>) {
        match FaleiroMessage::decode(&message) {
            Ok(FaleiroMessage::Proposal {
                proposal_number,
                proposed_value,
                proposer_id,
            }) => {
                if log_enabled!(Level::Info) {
                    info!(
                        "<< proposal {} received from proposer {}",
                        proposal_number, proposer_id
                    );
                }
                self.acceptor
                    .process_proposal(proposal_number, proposed_value, proposer_id);
            }
            Ok(FaleiroMessage::Ack { proposal_number, .. }) => {
                self.proposer.process_ack(proposal_number);
            }
            Ok(FaleiroMessage::Nack {
                proposal_number,
                value,
                ..
            }) => {
                self.proposer.process_nack(proposal_number, &value);
            }
            Err(e) => error!("dropping undecodable message: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{set_of, LatticeSet};

    fn ack_value(response: &AcceptorResponse<LatticeSet>) -> Option<&LatticeSet> {
        match response {
            AcceptorResponse::Ack { value, .. } => Some(value),
            AcceptorResponse::Nack { .. } => None,
        }
    }

    fn nack_value(response: &AcceptorResponse<LatticeSet>) -> Option<&LatticeSet> {
        match response {
            AcceptorResponse::Nack { value, .. } => Some(value),
            AcceptorResponse::Ack { .. } => None,
        }
    }

    #[test]
    fn test_acceptor_accepts_dominating_proposals() {
        let mut accepted = LatticeSet::new();
        let response = respond(&mut accepted, 1, set_of(&[1]), 0);
        assert_eq!(ack_value(&response), Some(&set_of(&[1])));
        assert_eq!(accepted, set_of(&[1]));
    }

    #[test]
    fn test_acceptor_rejects_with_join() {
        let mut accepted = set_of(&[1]);
        let response = respond(&mut accepted, 1, set_of(&[2]), 0);
        assert_eq!(nack_value(&response), Some(&set_of(&[1, 2])));
        assert_eq!(accepted, set_of(&[1, 2]));
    }

    #[test]
    fn test_accepted_value_never_decreases() {
        // Proposals {1}, {2}, {1,3}, {2,4}: after each step the accepted
        // value must dominate everything seen so far.
        let mut accepted = LatticeSet::new();
        let proposals = vec![
            set_of(&[1]),
            set_of(&[2]),
            set_of(&[1, 3]),
            set_of(&[2, 4]),
        ];
        let mut seen = LatticeSet::new();
        let mut previous = LatticeSet::new();
        for (step, proposal) in proposals.into_iter().enumerate() {
            seen = LatticeSet::join(&seen, &proposal);
            respond(&mut accepted, step as u64 + 1, proposal, 0);
            assert!(previous.leq(&accepted), "accepted value decreased");
            assert!(seen.leq(&accepted), "accepted value lost a proposal");
            previous = accepted.clone();
        }
        assert_eq!(accepted, set_of(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_decide_requires_majority_of_acks() {
        let mut state = ProposerState {
            status: Status::Active,
            ack_count: 1,
            nack_count: 0,
            active_proposal_number: 1,
            proposed_value: set_of(&[1]),
        };
        // Majority of 3 is 2.
        assert!(Proposer::decide(&mut state, 3).is_none());
        state.ack_count = 2;
        assert_eq!(Proposer::decide(&mut state, 3), Some(set_of(&[1])));
        assert_eq!(state.status, Status::Passive);
        // A passive proposer never decides again.
        assert!(Proposer::decide(&mut state, 3).is_none());
    }

    #[test]
    fn test_refine_needs_a_nack_and_a_quorum_of_replies() {
        let state = ProposerState::<LatticeSet> {
            status: Status::Active,
            ack_count: 1,
            nack_count: 0,
            active_proposal_number: 1,
            proposed_value: set_of(&[1]),
        };
        assert!(!Proposer::should_refine(&state, 5));

        let state = ProposerState::<LatticeSet> {
            nack_count: 2,
            ..state
        };
        assert!(Proposer::should_refine(&state, 5));

        let passive = ProposerState::<LatticeSet> {
            status: Status::Passive,
            ..state
        };
        assert!(!Proposer::should_refine(&passive, 5));
    }
}
