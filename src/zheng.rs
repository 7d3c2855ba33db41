//! The module that contains the Zheng lattice agreement protocol: one round
//! of value exchange followed by `ceil(log2(f))` classifier rounds over
//! read/write ACCEPT-VAL registers, converging every non-faulty process onto
//! comparable upper bounds in logarithmically many rounds.
//!
//! The classifier threshold `l` is real-valued: after the first round the
//! bisection step `delta` becomes `f/4`, which is not an integer for odd
//! `f`. All thresholds are sums of halved powers of two, so comparing them
//! for exact equality is deterministic.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::Level;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::lattice::Lattice;
use crate::message::{AcceptEntry, ZhengMessage};
use crate::transport::{MessageHandler, ProcessDescriptor, Transport};

/// The sending half of the protocol. Message ids are monotone per process
/// (seeded with `id * 1000`) and informational only.
pub struct ZhengProtocol<L> {
    transport: Transport,
    processes: Mutex<HashMap<u64, ProcessDescriptor>>,
    message_id: AtomicU64,

    value: PhantomData<L>,
}

impl<L> ZhengProtocol<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(transport: Transport, uid: u64) -> Arc<Self> {
        Arc::new(ZhengProtocol {
            transport,
            processes: Mutex::new(HashMap::new()),
            message_id: AtomicU64::new(uid * 1000),
            value: PhantomData,
        })
    }

    pub fn add_process(&self, descriptor: ProcessDescriptor) {
        self.processes.lock().unwrap().insert(descriptor.id, descriptor);
    }

    pub fn local_port(&self) -> u64 {
        self.transport.local_port()
    }

    pub fn start(&self, la: Arc<ZhengLa<L>>) {
        self.transport.start(Arc::new(ZhengRouter { la }));
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    fn next_message_id(&self) -> u64 {
        self.message_id.fetch_add(1, Ordering::SeqCst)
    }

    fn broadcast(&self, payload: Vec<u8>) {
        let processes = self.processes.lock().unwrap();
        for peer in processes.values() {
            self.transport.send(peer, payload.clone());
        }
    }

    fn send_to(&self, to: u64, payload: Vec<u8>) {
        let processes = self.processes.lock().unwrap();
        match processes.get(&to) {
            Some(peer) => self.transport.send(peer, payload),
            None => warn!("no descriptor for process {}, dropping reply", to),
        }
    }

    pub fn send_value(&self, v: &[L], from: u64) {
        let message_id = self.next_message_id();
        if log_enabled!(Level::Info) {
            info!(">> broadcasting values, message id {}", message_id);
        }
        self.broadcast(
            ZhengMessage::Value {
                from,
                message_id,
                value: v.to_vec(),
            }
            .encode(),
        );
    }

    pub fn send_write(&self, v: &[L], k: f64, r: u64, from: u64) {
        let message_id = self.next_message_id();
        if log_enabled!(Level::Info) {
            info!(
                ">> broadcasting write for round {} (k = {}), message id {}",
                r, k, message_id
            );
        }
        self.broadcast(
            ZhengMessage::Write {
                from,
                message_id,
                value: v.to_vec(),
                k,
                r,
            }
            .encode(),
        );
    }

    pub fn send_read(&self, r: u64, from: u64) {
        let message_id = self.next_message_id();
        if log_enabled!(Level::Info) {
            info!(">> broadcasting read for round {}, message id {}", r, message_id);
        }
        self.broadcast(
            ZhengMessage::<L>::Read {
                from,
                message_id,
                r,
            }
            .encode(),
        );
    }

    /// Replies to a Write; `message_id` echoes the id of the Write.
    pub fn send_write_ack(
        &self,
        to: u64,
        rec_val: &[AcceptEntry<L>],
        r: u64,
        from: u64,
        message_id: u64,
    ) {
        self.send_to(
            to,
            ZhengMessage::WriteAck {
                from,
                message_id,
                rec_val: rec_val.to_vec(),
                r,
            }
            .encode(),
        );
    }

    /// Replies to a Read; `message_id` echoes the id of the Read.
    pub fn send_read_ack(
        &self,
        to: u64,
        rec_val: &[AcceptEntry<L>],
        r: u64,
        from: u64,
        message_id: u64,
    ) {
        self.send_to(
            to,
            ZhengMessage::ReadAck {
                from,
                message_id,
                rec_val: rec_val.to_vec(),
                r,
            }
            .encode(),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Class {
    Master,
    Slave,
}

struct ZhengState<L> {
    // v[j] grows monotonically; the decision is the join over it.
    v: Vec<L>,
    // Scratch vector rebuilt by every classifier call.
    w: Vec<L>,

    // accept_val[r] entries are append-only and unique by (vector, k).
    accept_val: Vec<Vec<AcceptEntry<L>>>,

    // Current classifier threshold and round. Handlers ignore acks whose
    // round does not match `r`.
    l: f64,
    r: u64,

    value_received: u64,
    read_ack_received: u64,
    write_ack_received: u64,

    // Whether read acks (build_w) or write acks (build_wp) currently merge
    // matching register entries into w.
    build_w: bool,
    build_wp: bool,
}

/// One instance of the Zheng protocol. Created once per test; `start` runs
/// the agreement on the calling thread while the handlers feed the counters.
pub struct ZhengLa<L> {
    f: u64,
    n: u64,
    uid: u64,
    log_f: u64,

    state: Mutex<ZhengState<L>>,
    progress: Condvar,

    protocol: Arc<ZhengProtocol<L>>,
}

impl<L> ZhengLa<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    pub fn new(f: u64, n: u64, uid: u64, protocol: Arc<ZhengProtocol<L>>) -> Arc<Self> {
        let log_f = if f == 0 {
            0
        } else {
            (f as f64).log2().ceil() as u64
        };
        Arc::new(ZhengLa {
            f,
            n,
            uid,
            log_f,
            state: Mutex::new(ZhengState {
                v: vec![L::default(); n as usize],
                w: vec![L::default(); n as usize],
                accept_val: vec![Vec::new(); log_f as usize + 1],
                l: n as f64 - f as f64 / 2.0,
                r: 0,
                value_received: 0,
                read_ack_received: 0,
                write_ack_received: 0,
                build_w: false,
                build_wp: false,
            }),
            progress: Condvar::new(),
            protocol,
        })
    }

    /// Proposes `initial_value` and blocks until the classifier rounds have
    /// run, returning the decision.
    pub fn start(&self, initial_value: L) -> L {
        let mut state = self.state.lock().unwrap();
        state.v[self.uid as usize] = initial_value;
        self.protocol.send_value(&state.v, self.uid);

        if log_enabled!(Level::Info) {
            info!("[Z={}] waiting for values", self.uid);
        }
        while state.value_received < self.n - self.f {
            state = self.progress.wait(state).unwrap();
        }

        let mut delta = self.f as f64 / 2.0;
        for round in 1..=self.log_f {
            if log_enabled!(Level::Info) {
                info!("[Z={}] classifier round {} of {}", self.uid, round, self.log_f);
            }
            state.r = round;
            let threshold = state.l;
            let (returned, class) = self.classifier(state, threshold);
            state = returned;
            delta /= 2.0;
            match class {
                Class::Master => {
                    state.v = state.w.clone();
                    state.l += delta;
                }
                Class::Slave => {
                    state.l -= delta;
                }
            }
        }

        let mut decision = L::default();
        for slot in &state.v {
            decision = L::join(&decision, slot);
        }
        decision
    }

    /// One classifier call with threshold `k`: write v, read the registers
    /// into w, and classify by how many w slots are non-bottom. A Master
    /// additionally writes w back so slaves of later rounds observe it.
    fn classifier<'a>(
        &'a self,
        mut state: MutexGuard<'a, ZhengState<L>>,
        k: f64,
    ) -> (MutexGuard<'a, ZhengState<L>>, Class) {
        for slot in state.w.iter_mut() {
            *slot = L::default();
        }

        let snapshot = state.v.clone();
        self.protocol.send_write(&snapshot, k, state.r, self.uid);
        while state.write_ack_received < self.n - self.f {
            state = self.progress.wait(state).unwrap();
        }
        state.write_ack_received = 0;

        state.build_w = true;
        self.protocol.send_read(state.r, self.uid);
        while state.read_ack_received < self.n - self.f {
            state = self.progress.wait(state).unwrap();
        }
        state.read_ack_received = 0;
        state.build_w = false;

        let h = state.w.iter().filter(|slot| !slot.is_bottom()).count();
        if log_enabled!(Level::Info) {
            info!("[Z={}] classifier saw {} non-empty slots, k = {}", self.uid, h, k);
        }

        if h as f64 > k {
            state.build_wp = true;
            let snapshot = state.w.clone();
            self.protocol.send_write(&snapshot, k, state.r, self.uid);
            while state.write_ack_received < self.n - self.f {
                state = self.progress.wait(state).unwrap();
            }
            state.write_ack_received = 0;
            state.build_wp = false;
            (state, Class::Master)
        } else {
            (state, Class::Slave)
        }
    }

    /// Phase-1 value exchange; merges at most `n - f` vectors.
    pub fn receive_value(&self, value: &[L], _message_id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.value_received < self.n - self.f {
            for (slot, incoming) in state.v.iter_mut().zip(value.iter()) {
                *slot = L::join(slot, incoming);
            }
            state.value_received += 1;
            self.progress.notify_one();
        }
    }

    /// Register write: records the entry (deduplicated by pair equality) and
    /// acknowledges with the register contents.
    pub fn receive_write(&self, value: Vec<L>, k: f64, rec_r: u64, from: u64, message_id: u64) {
        let mut state = self.state.lock().unwrap();
        let round = rec_r as usize;
        if round >= state.accept_val.len() {
            warn!("dropping write for out-of-range round {}", rec_r);
            return;
        }
        let entry = (value, k);
        if !state.accept_val[round].contains(&entry) {
            state.accept_val[round].push(entry);
        }
        let snapshot = state.accept_val[round].clone();
        self.protocol
            .send_write_ack(from, &snapshot, rec_r, self.uid, message_id);
    }

    /// Register read: replies with the register contents for that round.
    pub fn receive_read(&self, rec_r: u64, from: u64, message_id: u64) {
        let state = self.state.lock().unwrap();
        let round = rec_r as usize;
        if round >= state.accept_val.len() {
            warn!("dropping read for out-of-range round {}", rec_r);
            return;
        }
        let snapshot = state.accept_val[round].clone();
        self.protocol
            .send_read_ack(from, &snapshot, rec_r, self.uid, message_id);
    }

    pub fn receive_write_ack(&self, rec_val: &[AcceptEntry<L>], rec_r: u64, _message_id: u64) {
        let mut state = self.state.lock().unwrap();
        // A stale ack never touches w or the counters.
        if rec_r != state.r {
            return;
        }
        state.write_ack_received += 1;
        if state.build_wp {
            Self::merge_matching(&mut state, rec_val);
        }
        self.progress.notify_one();
    }

    pub fn receive_read_ack(&self, rec_val: &[AcceptEntry<L>], rec_r: u64, _message_id: u64) {
        let mut state = self.state.lock().unwrap();
        if rec_r != state.r {
            return;
        }
        if state.build_w {
            Self::merge_matching(&mut state, rec_val);
        }
        state.read_ack_received += 1;
        self.progress.notify_one();
    }

    /// Joins into w every register entry written under the current
    /// threshold. Thresholds are exact sums of halved powers of two, so the
    /// equality comparison is deterministic.
    fn merge_matching(state: &mut ZhengState<L>, rec_val: &[AcceptEntry<L>]) {
        let threshold = state.l;
        for (vector, k_value) in rec_val {
            if *k_value == threshold {
                for (slot, incoming) in state.w.iter_mut().zip(vector.iter()) {
                    *slot = L::join(slot, incoming);
                }
            }
        }
    }

    #[cfg(test)]
    fn accept_val_len(&self, r: u64) -> usize {
        self.state.lock().unwrap().accept_val[r as usize].len()
    }

    #[cfg(test)]
    fn counters(&self) -> (u64, u64, u64) {
        let state = self.state.lock().unwrap();
        (
            state.value_received,
            state.write_ack_received,
            state.read_ack_received,
        )
    }

    #[cfg(test)]
    fn merged_values(&self) -> Vec<L> {
        self.state.lock().unwrap().v.clone()
    }
}

struct ZhengRouter<L> {
    la: Arc<ZhengLa<L>>,
}

impl<L> MessageHandler for ZhengRouter<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    fn on_message_received(&self, message: Vec<u8>) {
        match ZhengMessage::decode(&message) {
            Ok(ZhengMessage::Value {
                from,
                message_id,
                value,
            }) => {
                if log_enabled!(Level::Info) {
                    info!("<< values received from {}, message id {}", from, message_id);
                }
                self.la.receive_value(&value, message_id);
            }
            Ok(ZhengMessage::Write {
                from,
                message_id,
                value,
                k,
                r,
            }) => {
                if log_enabled!(Level::Info) {
                    info!("<< write received from {}, message id {}", from, message_id);
                }
                self.la.receive_write(value, k, r, from, message_id);
            }
            Ok(ZhengMessage::Read {
                from,
                message_id,
                r,
            }) => {
                if log_enabled!(Level::Info) {
                    info!("<< read received from {}, message id {}", from, message_id);
                }
                self.la.receive_read(r, from, message_id);
            }
            Ok(ZhengMessage::WriteAck {
                message_id,
                rec_val,
                r,
                ..
            }) => {
                self.la.receive_write_ack(&rec_val, r, message_id);
            }
            Ok(ZhengMessage::ReadAck {
                message_id,
                rec_val,
                r,
                ..
            }) => {
                self.la.receive_read_ack(&rec_val, r, message_id);
            }
            Err(e) => error!("dropping undecodable message: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{set_of, LatticeSet};
    use crate::transport::SendDelay;

    fn isolated_instance(f: u64, n: u64, uid: u64) -> Arc<ZhengLa<LatticeSet>> {
        let transport = Transport::bind(0, SendDelay::Disabled).unwrap();
        let protocol = ZhengProtocol::new(transport, uid);
        ZhengLa::new(f, n, uid, protocol)
    }

    #[test]
    fn test_round_count() {
        assert_eq!(isolated_instance(1, 3, 0).log_f, 0);
        assert_eq!(isolated_instance(2, 5, 0).log_f, 1);
        assert_eq!(isolated_instance(3, 8, 0).log_f, 2);
        assert_eq!(isolated_instance(4, 9, 0).log_f, 2);
        assert_eq!(isolated_instance(5, 11, 0).log_f, 3);
        assert_eq!(isolated_instance(0, 3, 0).log_f, 0);
    }

    #[test]
    fn test_initial_threshold_is_real_valued() {
        let la = isolated_instance(3, 8, 0);
        assert_eq!(la.state.lock().unwrap().l, 6.5);
    }

    #[test]
    fn test_value_merge_is_gated() {
        let la = isolated_instance(1, 3, 0);
        la.receive_value(&[set_of(&[1]), LatticeSet::new(), LatticeSet::new()], 0);
        la.receive_value(&[LatticeSet::new(), set_of(&[2]), LatticeSet::new()], 1);
        // n - f = 2 vectors already merged; this one must be ignored.
        la.receive_value(&[LatticeSet::new(), LatticeSet::new(), set_of(&[3])], 2);

        assert_eq!(la.counters().0, 2);
        let v = la.merged_values();
        assert_eq!(v[0], set_of(&[1]));
        assert_eq!(v[1], set_of(&[2]));
        assert!(v[2].is_bottom());
    }

    #[test]
    fn test_accept_val_deduplicates_by_pair() {
        let la = isolated_instance(2, 5, 0);
        let vector = vec![set_of(&[1]); 5];

        la.receive_write(vector.clone(), 4.0, 1, 3, 100);
        la.receive_write(vector.clone(), 4.0, 1, 3, 101);
        assert_eq!(la.accept_val_len(1), 1);

        // The same vector under a different threshold is a distinct entry.
        la.receive_write(vector, 3.0, 1, 3, 102);
        assert_eq!(la.accept_val_len(1), 2);
    }

    #[test]
    fn test_out_of_range_round_is_dropped() {
        let la = isolated_instance(2, 5, 0);
        la.receive_write(vec![set_of(&[1]); 5], 4.0, 99, 3, 100);
        la.receive_read(99, 3, 101);
        // log_f = 1, so only rounds 0 and 1 have registers.
        assert_eq!(la.accept_val_len(0), 0);
        assert_eq!(la.accept_val_len(1), 0);
    }

    #[test]
    fn test_stale_acks_are_ignored() {
        let la = isolated_instance(2, 5, 0);
        // The process is still in round 0; acks for round 1 are stale.
        la.receive_write_ack(&[], 1, 100);
        la.receive_read_ack(&[], 1, 101);
        let (_, write_acks, read_acks) = la.counters();
        assert_eq!(write_acks, 0);
        assert_eq!(read_acks, 0);

        la.receive_write_ack(&[], 0, 102);
        assert_eq!(la.counters().1, 1);
    }
}
