//! End-to-end runs of the single-shot Faleiro protocol on loopback.

extern crate lattice_agreement;

use std::sync::Arc;
use std::thread;

use lattice_agreement::faleiro::{Acceptor, FaleiroProtocol, Proposer};
use lattice_agreement::lattice::{set_of, Lattice, LatticeSet};
use lattice_agreement::transport::{ProcessDescriptor, SendDelay, Transport};

struct Node {
    protocol: Arc<FaleiroProtocol<LatticeSet>>,
    proposer: Arc<Proposer<LatticeSet>>,
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
            let protocol = FaleiroProtocol::new(transport);
            for descriptor in &descriptors {
                protocol.add_process(descriptor.clone());
            }
            let proposer = Proposer::new(protocol.clone(), id as u64, n as u64);
            let acceptor = Acceptor::new(protocol.clone());
            protocol.start(proposer.clone(), acceptor);
            Node { protocol, proposer }
        })
        .collect()
}

fn run_agreement(proposals: Vec<LatticeSet>) -> Vec<LatticeSet> {
    let nodes = spin_up_cluster(proposals.len());

    let handles: Vec<_> = nodes
        .iter()
        .zip(proposals.into_iter())
        .map(|(node, proposal)| {
            let proposer = node.proposer.clone();
            thread::spawn(move || proposer.start(proposal))
        })
        .collect();
    let decisions: Vec<LatticeSet> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for node in &nodes {
        node.protocol.stop();
    }
    decisions
}

fn assert_pairwise_comparable(decisions: &[LatticeSet]) {
    for (i, left) in decisions.iter().enumerate() {
        for right in decisions.iter().skip(i + 1) {
            assert!(
                left.leq(right) || right.leq(left),
                "decisions {:?} and {:?} are not comparable",
                left,
                right
            );
        }
    }
}

#[test]
fn test_three_processes_decide_comparable_values() {
    let decisions = run_agreement(vec![set_of(&[1]), set_of(&[2]), set_of(&[3])]);

    assert_pairwise_comparable(&decisions);
    for (id, decision) in decisions.iter().enumerate() {
        assert!(
            LatticeSet::singleton(id as u64 + 1).leq(decision),
            "process {} lost its own proposal: {:?}",
            id,
            decision
        );
    }

    // Everyone decided, so the decisions jointly cover every input, and no
    // other elements exist in the system.
    let joined = decisions
        .iter()
        .fold(LatticeSet::new(), |acc, decision| LatticeSet::join(&acc, decision));
    assert_eq!(joined, set_of(&[1, 2, 3]));
}

#[test]
fn test_five_processes_refine_to_comparable_values() {
    let decisions = run_agreement(vec![
        set_of(&[1]),
        set_of(&[2]),
        set_of(&[3]),
        set_of(&[4]),
        set_of(&[5]),
    ]);

    assert_pairwise_comparable(&decisions);
    for (id, decision) in decisions.iter().enumerate() {
        assert!(LatticeSet::singleton(id as u64 + 1).leq(decision));
        // A decision needs a majority of acks, each of which carried the
        // full proposal; it can never exceed the join of all inputs.
        assert!(decision.leq(&set_of(&[1, 2, 3, 4, 5])));
    }

    let joined = decisions
        .iter()
        .fold(LatticeSet::new(), |acc, decision| LatticeSet::join(&acc, decision));
    assert_eq!(joined, set_of(&[1, 2, 3, 4, 5]));
}
