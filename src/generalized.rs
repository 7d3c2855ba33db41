//! The module that contains the generalized Faleiro protocol: a proposer
//! that buffers incoming values and runs a sequence of agreement instances,
//! an acceptor whose Acks are fanned out to every learner, and a learner
//! that tallies Acks per `(proposer, proposal number)` and exposes a
//! monotonically growing learnt value.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};

use log::Level;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::faleiro::{respond, AcceptorResponse};
use crate::lattice::Lattice;
use crate::message::GlaMessage;
use crate::transport::{MessageHandler, ProcessDescriptor, Transport};

/// The sending half of the generalized protocol.
pub struct GlaProtocol<L> {
    transport: Transport,
    descriptors: Mutex<HashMap<u64, ProcessDescriptor>>,

    value: PhantomData<L>,
}

impl<L> GlaProtocol<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(transport: Transport) -> Arc<Self> {
        Arc::new(GlaProtocol {
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

    pub fn start(
        &self,
        proposer: Arc<Proposer<L>>,
        acceptor: Arc<Acceptor<L>>,
        learner: Arc<Learner<L>>,
    ) {
        self.transport.start(Arc::new(GlaRouter {
            proposer,
            acceptor,
            learner,
        }));
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    pub fn send_proposal(&self, proposed_value: &L, proposal_number: u64, proposer_id: u64) {
        let payload = GlaMessage::Proposal {
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

    /// Routes an acceptor reply: a Nack goes to the proposer alone, an Ack
    /// goes to the proposer and, as a learner Ack, to every participant.
    pub fn send_response(&self, to: u64, response: AcceptorResponse<L>) {
        let descriptors = self.descriptors.lock().unwrap();
        match response {
            AcceptorResponse::Ack {
                proposal_number,
                value,
                proposer_id,
            } => {
                if log_enabled!(Level::Info) {
                    info!(">> sending ack for proposal {} to {}", proposal_number, to);
                }
                let ack = GlaMessage::Ack {
                    proposal_number,
                    proposer_id,
                    value: value.clone(),
                }
                .encode();
                match descriptors.get(&to) {
                    Some(peer) => self.transport.send(peer, ack),
                    None => warn!("no descriptor for proposer {}, dropping ack", to),
                }

                let learner_ack = GlaMessage::LearnerAck {
                    proposal_number,
                    value,
                    proposer_id,
                }
                .encode();
                for peer in descriptors.values() {
                    self.transport.send(peer, learner_ack.clone());
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
                let nack = GlaMessage::Nack {
                    proposal_number,
                    proposer_id,
                    value,
                }
                .encode();
                match descriptors.get(&to) {
                    Some(peer) => self.transport.send(peer, nack),
                    None => warn!("no descriptor for proposer {}, dropping nack", to),
                }
            }
        }
    }

    /// Forwards an externally received value to every other proposer; the
    /// origin buffers it locally instead.
    pub fn send_internal_receive(&self, value: &L, except: u64) {
        let payload = GlaMessage::InternalReceive {
            value: value.clone(),
        }
        .encode();
        let descriptors = self.descriptors.lock().unwrap();
        for peer in descriptors.values() {
            if peer.id == except {
                continue;
            }
            if log_enabled!(Level::Info) {
                info!(">> sending internal receive to {}", peer.id);
            }
            self.transport.send(peer, payload.clone());
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
    ack_count: u64,
    nack_count: u64,
    active_proposal_number: u64,
    proposed_value: L,

    // Values received but not yet proposed.
    buffered_values: L,
}

/// The proposing role of the generalized protocol. Values arrive over time
/// through `receive_value`; each `start` call runs one agreement instance
/// over everything buffered since the last decision.
pub struct Proposer<L> {
    uid: u64,
    n: u64,

    state: Mutex<ProposerState<L>>,
    replies: Condvar,

    protocol: Arc<GlaProtocol<L>>,
}

impl<L> Proposer<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(protocol: Arc<GlaProtocol<L>>, uid: u64, n: u64) -> Arc<Self> {
        Arc::new(Proposer {
            uid,
            n,
            state: Mutex::new(ProposerState {
                status: Status::Passive,
                ack_count: 0,
                nack_count: 0,
                active_proposal_number: 0,
                proposed_value: L::default(),
                buffered_values: L::default(),
            }),
            replies: Condvar::new(),
            protocol,
        })
    }

    /// Hands a value to this process: it is forwarded to every other
    /// proposer and buffered locally until the next proposal.
    pub fn receive_value(&self, value: L) {
        let mut state = self.state.lock().unwrap();
        self.protocol.send_internal_receive(&value, self.uid);
        state.buffered_values = L::join(&state.buffered_values, &value);
        if log_enabled!(Level::Info) {
            info!("[P={}] buffered values now {:?}", self.uid, state.buffered_values);
        }
    }

    /// Proposes the buffered values and blocks until the instance decides,
    /// returning the decided value. When the buffer holds nothing beyond the
    /// already proposed value there is nothing to agree on and the current
    /// value is returned immediately.
    pub fn start(&self) -> L {
        let mut state = self.state.lock().unwrap();
        match Self::arm_proposal(&mut state) {
            Some((proposal_number, proposed_value)) => {
                self.protocol
                    .send_proposal(&proposed_value, proposal_number, self.uid);
            }
            None => return state.proposed_value.clone(),
        }
        loop {
            if let Some(decision) = Self::decide(&mut state, self.n) {
                return decision;
            }
            if state.status == Status::Passive {
                // Another caller consumed the decision of this instance.
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
            state.ack_count += 1;
            self.replies.notify_one();
        }
    }

    pub fn process_nack(&self, proposal_number: u64, value: &L) {
        let mut state = self.state.lock().unwrap();
        if proposal_number == state.active_proposal_number {
            state.proposed_value = L::join(&state.proposed_value, value);
            state.nack_count += 1;
            self.replies.notify_one();
        }
    }

    /// Buffers a value another process received.
    pub fn process_internal_receive(&self, value: &L) {
        let mut state = self.state.lock().unwrap();
        state.buffered_values = L::join(&state.buffered_values, value);
    }

    /// Moves a passive proposer to the next proposal if the buffer strictly
    /// extends the proposed value; the strictness guard prevents re-proposing
    /// the same value forever on idempotent joins.
    fn arm_proposal(state: &mut ProposerState<L>) -> Option<(u64, L)> {
        let candidate = L::join(&state.proposed_value, &state.buffered_values);
        if state.status == Status::Passive && state.proposed_value.lt(&candidate) {
            state.proposed_value = candidate.clone();
            state.status = Status::Active;
            state.active_proposal_number += 1;
            state.ack_count = 0;
            state.nack_count = 0;
            state.buffered_values = L::default();
            Some((state.active_proposal_number, candidate))
        } else {
            None
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

/// The accepting role; identical to the single-shot acceptor except that
/// replies are routed through the generalized protocol, which fans Acks out
/// to the learners.
pub struct Acceptor<L> {
    accepted_value: Mutex<L>,

    protocol: Arc<GlaProtocol<L>>,
}

impl<L> Acceptor<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(protocol: Arc<GlaProtocol<L>>) -> Arc<Self> {
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

    pub fn accepted_value(&self) -> L {
        self.accepted_value.lock().unwrap().clone()
    }
}

struct LearnerState<L> {
    // Acks seen per (proposer id, proposal number).
    ack_count: HashMap<(u64, u64), u64>,

    // Only ever moves up, and only when a proposal reaches a majority.
    learnt_value: L,
}

/// The learning role: counts acceptor Acks and exposes the largest
/// majority-confirmed value.
pub struct Learner<L> {
    n: u64,

    state: Mutex<LearnerState<L>>,
    learnt: Condvar,
}

impl<L> Learner<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(n: u64) -> Arc<Self> {
        Arc::new(Learner {
            n,
            state: Mutex::new(LearnerState {
                ack_count: HashMap::new(),
                learnt_value: L::default(),
            }),
            learnt: Condvar::new(),
        })
    }

    pub fn process_ack(&self, proposal_number: u64, value: L, proposer_id: u64) {
        let mut state = self.state.lock().unwrap();
        let count = state
            .ack_count
            .entry((proposer_id, proposal_number))
            .or_insert(0);
        *count += 1;
        let count = *count;
        if log_enabled!(Level::Info) {
            info!(
                "[L] ack {} for proposal {} of proposer {}",
                count, proposal_number, proposer_id
            );
        }
        if count >= (self.n + 2) / 2 && state.learnt_value.lt(&value) {
            state.learnt_value = value;
            self.learnt.notify_all();
        }
    }

    /// Blocks until the learnt value dominates `proposal` and returns it.
    pub fn learn_value(&self, proposal: &L) -> L {
        let mut state = self.state.lock().unwrap();
        while !proposal.leq(&state.learnt_value) {
            state = self.learnt.wait(state).unwrap();
        }
        state.learnt_value.clone()
    }

    /// A snapshot of the learnt value.
    pub fn learnt_value(&self) -> L {
        self.state.lock().unwrap().learnt_value.clone()
    }
}

struct GlaRouter<L> {
    proposer: Arc<Proposer<L>>,
    acceptor: Arc<Acceptor<L>>,
    learner: Arc<Learner<L>>,
}

impl<L> MessageHandler for GlaRouter<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    fn on_message_received(&self, message: Vec<u8>) {
        match GlaMessage::decode(&message) {
            Ok(GlaMessage::Proposal {
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
            Ok(GlaMessage::Ack { proposal_number, .. }) => {
                self.proposer.process_ack(proposal_number);
            }
            Ok(GlaMessage::Nack {
                proposal_number,
                value,
                ..
            }) => {
                self.proposer.process_nack(proposal_number, &value);
            }
            Ok(GlaMessage::InternalReceive { value }) => {
                self.proposer.process_internal_receive(&value);
            }
            Ok(GlaMessage::LearnerAck {
                proposal_number,
                value,
                proposer_id,
            }) => {
                self.learner.process_ack(proposal_number, value, proposer_id);
            }
            Err(e) => error!("dropping undecodable message: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{set_of, LatticeSet};

    fn empty_state() -> ProposerState<LatticeSet> {
        ProposerState {
            status: Status::Passive,
            ack_count: 0,
            nack_count: 0,
            active_proposal_number: 0,
            proposed_value: LatticeSet::new(),
            buffered_values: LatticeSet::new(),
        }
    }

    #[test]
    fn test_arm_proposal_consumes_the_buffer() {
        let mut state = empty_state();
        state.buffered_values = set_of(&[10]);

        let (number, value) = Proposer::arm_proposal(&mut state).unwrap();
        assert_eq!(number, 1);
        assert_eq!(value, set_of(&[10]));
        assert_eq!(state.status, Status::Active);
        assert!(state.buffered_values.is_bottom());
    }

    #[test]
    fn test_arm_proposal_requires_strict_growth() {
        let mut state = empty_state();
        state.proposed_value = set_of(&[10]);

        // Nothing buffered: nothing to propose.
        assert!(Proposer::arm_proposal(&mut state).is_none());

        // A buffer dominated by the proposed value adds nothing either.
        state.buffered_values = set_of(&[10]);
        assert!(Proposer::arm_proposal(&mut state).is_none());

        state.buffered_values = set_of(&[20]);
        let (number, value) = Proposer::arm_proposal(&mut state).unwrap();
        assert_eq!(number, 1);
        assert_eq!(value, set_of(&[10, 20]));
    }

    #[test]
    fn test_arm_proposal_refuses_while_active() {
        let mut state = empty_state();
        state.status = Status::Active;
        state.buffered_values = set_of(&[10]);
        assert!(Proposer::arm_proposal(&mut state).is_none());
    }

    #[test]
    fn test_learner_needs_majority_and_strict_growth() {
        let learner = Learner::<LatticeSet>::new(3);

        learner.process_ack(1, set_of(&[10]), 0);
        assert!(learner.learnt_value().is_bottom());

        // Second ack of three processes is a majority.
        learner.process_ack(1, set_of(&[10]), 0);
        assert_eq!(learner.learnt_value(), set_of(&[10]));

        // Further acks for the same proposal change nothing.
        learner.process_ack(1, set_of(&[10]), 0);
        assert_eq!(learner.learnt_value(), set_of(&[10]));
    }

    #[test]
    fn test_learner_counts_proposals_separately() {
        let learner = Learner::<LatticeSet>::new(3);

        learner.process_ack(1, set_of(&[10]), 0);
        learner.process_ack(1, set_of(&[30]), 1);
        // One ack each: no majority anywhere.
        assert!(learner.learnt_value().is_bottom());

        learner.process_ack(1, set_of(&[30]), 1);
        assert_eq!(learner.learnt_value(), set_of(&[30]));

        // Proposer 0's value is now incomparable to the learnt value and
        // must not replace it even with a majority.
        learner.process_ack(1, set_of(&[10]), 0);
        assert_eq!(learner.learnt_value(), set_of(&[30]));
    }

    #[test]
    fn test_learn_value_returns_once_dominated() {
        let learner = Learner::<LatticeSet>::new(3);
        learner.process_ack(1, set_of(&[10, 20]), 0);
        learner.process_ack(1, set_of(&[10, 20]), 0);

        let learnt = learner.learn_value(&set_of(&[10]));
        assert_eq!(learnt, set_of(&[10, 20]));
    }
}
