//! End-to-end run of the Zheng classifier protocol on loopback.

extern crate lattice_agreement;

use std::sync::Arc;
use std::thread;

use lattice_agreement::lattice::{set_of, Lattice, LatticeSet};
use lattice_agreement::transport::{ProcessDescriptor, SendDelay, Transport};
use lattice_agreement::zheng::{ZhengLa, ZhengProtocol};

struct Node {
    protocol: Arc<ZhengProtocol<LatticeSet>>,
    la: Arc<ZhengLa<LatticeSet>>,
}

fn spin_up_cluster(n: u64, f: u64) -> Vec<Node> {
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
            let protocol = ZhengProtocol::new(transport, id as u64);
            for descriptor in &descriptors {
                protocol.add_process(descriptor.clone());
            }
            let la = ZhengLa::new(f, n, id as u64, protocol.clone());
            protocol.start(la.clone());
            Node { protocol, la }
        })
        .collect()
}

#[test]
fn test_eight_processes_two_classifier_rounds() {
    // f = 3 means ceil(log2(3)) = 2 classifier rounds.
    let n = 8u64;
    let f = 3u64;
    let nodes = spin_up_cluster(n, f);
    let everything = set_of(&(0..n).collect::<Vec<_>>());

    let handles: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(id, node)| {
            let la = node.la.clone();
            let proposal = LatticeSet::singleton(id as u64);
            thread::spawn(move || la.start(proposal))
        })
        .collect();
    let decisions: Vec<LatticeSet> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for node in &nodes {
        node.protocol.stop();
    }

    for (id, decision) in decisions.iter().enumerate() {
        // Own input survives; nothing outside the inputs can appear.
        assert!(
            LatticeSet::singleton(id as u64).leq(decision),
            "process {} lost its own input: {:?}",
            id,
            decision
        );
        assert!(decision.leq(&everything));
    }

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
fn test_three_processes_value_exchange_only() {
    // f = 1 means no classifier rounds at all: the value exchange already
    // merges n - f vectors at every process.
    let n = 3u64;
    let f = 1u64;
    let nodes = spin_up_cluster(n, f);

    let handles: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(id, node)| {
            let la = node.la.clone();
            let proposal = LatticeSet::singleton(id as u64 + 10);
            thread::spawn(move || la.start(proposal))
        })
        .collect();
    let decisions: Vec<LatticeSet> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for node in &nodes {
        node.protocol.stop();
    }

    let everything = set_of(&[10, 11, 12]);
    for (id, decision) in decisions.iter().enumerate() {
        assert!(LatticeSet::singleton(id as u64 + 10).leq(decision));
        assert!(decision.leq(&everything));
    }
}
