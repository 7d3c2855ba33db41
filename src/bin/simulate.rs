//! An example-style binary which simulates generalized lattice agreement
//! locally (on one machine): it spins up a handful of in-process nodes on
//! loopback ports, then feeds values to the first node and prints what its
//! learner ends up with.
//!
//! Run it interactively (one value per prompt)
//!     RUST_LOG=lattice_agreement=info cargo run --bin simulate
//! or with the values given up front
//!     cargo run --bin simulate -- 7 11 13

extern crate env_logger;
extern crate lattice_agreement;
#[macro_use]
extern crate log;
#[macro_use]
extern crate text_io;

use std::env;
use std::io;
use std::io::prelude::*;
use std::sync::Arc;

use lattice_agreement::generalized::{Acceptor, GlaProtocol, Learner, Proposer};
use lattice_agreement::lattice::LatticeSet;
use lattice_agreement::transport::{ProcessDescriptor, SendDelay, Transport};

const NODES: usize = 3;

struct Node {
    protocol: Arc<GlaProtocol<LatticeSet>>,
    proposer: Arc<Proposer<LatticeSet>>,
    learner: Arc<Learner<LatticeSet>>,
}

fn spin_up_cluster() -> Vec<Node> {
    let transports: Vec<Transport> = (0..NODES)
        .map(|_| Transport::bind(0, SendDelay::Disabled).expect("Could not bind a loopback port"))
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
            let proposer = Proposer::new(protocol.clone(), id as u64, NODES as u64);
            let acceptor = Acceptor::new(protocol.clone());
            let learner = Learner::new(NODES as u64);
            protocol.start(proposer.clone(), acceptor, learner.clone());
            Node {
                protocol,
                proposer,
                learner,
            }
        })
        .collect()
}

fn propose(node: &Node, element: u64) {
    let value = LatticeSet::singleton(element);
    node.proposer.receive_value(value.clone());
    node.proposer.start();
    let learnt = node.learner.learn_value(&value);
    info!("learnt {:?}", learnt);
    println!("Learnt: {:?}", learnt);
}

fn main() {
    env_logger::init();

    let nodes = spin_up_cluster();
    info!("{} nodes listening on loopback", nodes.len());

    let args: Vec<String> = env::args().collect();
    if args.len() > 1 {
        for arg in args.iter().skip(1) {
            let element: u64 = match arg.parse() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("Only u64 values are supported.");
                    return;
                }
            };
            propose(&nodes[0], element);
        }
    } else {
        loop {
            print!("Enter a value: ");
            io::stdout().flush().ok().expect("Could not flush stdout");
            let element: u64 = read!();
            propose(&nodes[0], element);
        }
    }

    for node in &nodes {
        node.protocol.stop();
    }
}
