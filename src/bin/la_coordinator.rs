//! The coordinator of a single-shot lattice agreement test (Faleiro or
//! Zheng nodes alike): registers `n` participants, hands each the initial
//! value `{id}`, starts the test, collects the decisions and checks that
//! they are pairwise comparable.
//!
//! You can run this binary as follows
//!     RUST_LOG=lattice_agreement=info cargo run --bin la_coordinator -- <n> <f> <port>

extern crate env_logger;
extern crate lattice_agreement;
#[macro_use]
extern crate log;

use std::env;

use lattice_agreement::coordinator::{verify_la_results, Coordinator};
use lattice_agreement::lattice::LatticeSet;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    if args.len() != 4 {
        eprintln!("usage: la_coordinator <n> <f> <port>");
        return;
    }
    let n: u64 = args[1].parse().expect("n is not a number");
    let f: u64 = args[2].parse().expect("f is not a number");
    let port: u64 = args[3].parse().expect("port is not a number");
    assert!(n > 2 * f, "correctness requires n > 2f");

    let coordinator = Coordinator::bind(n, f, port).expect("Could not bind the coordinator port");
    let results = coordinator
        .run(|id| vec![LatticeSet::singleton(id)])
        .expect("The test run failed");

    if verify_la_results(&results) {
        info!("all decisions are comparable");
    } else {
        error!("verification failed, see the log above");
    }
    println!("Done");
}
