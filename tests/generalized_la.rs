//! End-to-end runs of the generalized Faleiro protocol on loopback, with
//! values arriving over time at different processes.

extern crate lattice_agreement;

use std::sync::Arc;
use std::thread;

use lattice_agreement::generalized::{Acceptor, GlaProtocol, Learner, Proposer};
use lattice_agreement::lattice::{set_of, Lattice, LatticeSet};
use lattice_agreement::transport::{ProcessDescriptor, SendDelay, Transport};

struct Node {
    protocol: Arc<GlaProtocol<LatticeSet>>,
    proposer: Arc<Proposer<LatticeSet>>,
    learner: Arc<Learner<LatticeSet>>,
}

fn spin_up_cluster(n: usize) -> Vec<Node> {
    let transports: Vec<Transport> = (0..n)
        .map(|_| Transport::bind(0, SendDelay::Disabled).unwrap())
        .collect();
    let descriptors: Vec<ProcessDescriptor> = transports
        .iter()
        .enumerate()
        .map(|(id, transport)| ProcessDescriptor {
            ip: "127.0.0.1".to_string(),
            id: id as u64,
            port: transport.local_port(),
        })
        .collect();

    transports
        .into_iter()
        .enumerate()
        .map(|(id, transport)| {
            let protocol = GlaProtocol::new(transport);
            for descriptor in &descriptors {
                protocol.add_process(descriptor.clone());
            }
            let proposer = Proposer::new(protocol.clone(), id as u64, n as u64);
            let acceptor = Acceptor::new(protocol.clone());
            let learner = Learner::new(n as u64);
            protocol.start(proposer.clone(), acceptor, learner.clone());
            Node {
                protocol,
                proposer,
                learner,
            }
        })
        .collect()
}

#[test]
fn test_staggered_values_are_all_learnt() {
    // Process 0 receives {10} then {20}; process 1 receives {30}; process 2
    // receives {40}.
    let values: Vec<Vec<LatticeSet>> = vec![
        vec![set_of(&[10]), set_of(&[20])],
        vec![set_of(&[30])],
        vec![set_of(&[40])],
    ];
    let everything = set_of(&[10, 20, 30, 40]);

    let nodes = spin_up_cluster(values.len());

    let handles: Vec<_> = nodes
        .iter()
        .zip(values.iter().cloned())
        .map(|(node, my_values)| {
            let proposer = node.proposer.clone();
            let learner = node.learner.clone();
            let everything = everything.clone();
            thread::spawn(move || {
                let mut learnt_values = Vec::new();
                for value in my_values {
                    proposer.receive_value(value.clone());
                    proposer.start();
                    learnt_values.push(learner.learn_value(&value));
                }
                // Some decided proposal dominates every fed value, so every
                // learner eventually learns a value covering all of them.
                learnt_values.push(learner.learn_value(&everything));
                learnt_values
            })
        })
        .collect();
    let sequences: Vec<Vec<LatticeSet>> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for node in &nodes {
        node.protocol.stop();
    }

    for (id, (sequence, my_values)) in sequences.iter().zip(values.iter()).enumerate() {
        // The learnt sequence grows monotonically.
        for pair in sequence.windows(2) {
            assert!(
                pair[0].leq(&pair[1]),
                "learnt sequence of process {} decreased: {:?}",
                id,
                sequence
            );
        }
        // Every learnt value dominates the proposal it answered.
        for (learnt, value) in sequence.iter().zip(my_values.iter()) {
            assert!(value.leq(learnt));
        }
        // The final value covers everything fed into the system and nothing
        // else.
        let last = sequence.last().unwrap();
        assert!(everything.leq(last));
        assert!(last.leq(&everything));
    }

    // Learnt values are comparable across processes as well.
    let all_learnt: Vec<LatticeSet> = sequences.iter().flatten().cloned().collect();
    for (i, left) in all_learnt.iter().enumerate() {
        for right in all_learnt.iter().skip(i + 1) {
            assert!(
                left.leq(right) || right.leq(left),
                "learnt values {:?} and {:?} are not comparable",
                left,
                right
            );
        }
    }
}

#[test]
fn test_proposing_nothing_new_returns_immediately() {
    let nodes = spin_up_cluster(3);

    // An empty buffer means there is nothing to agree on.
    let decision = nodes[0].proposer.start();
    assert!(decision.is_bottom());

    for node in &nodes {
        node.protocol.stop();
    }
}
