//! The coordinator of a generalized lattice agreement test: registers `n`
//! participants, hands participant `id` the value sequence `{{j*n + id}}`
//! for `j` in `0..n`, starts the test, collects every learnt sequence and
//! checks monotonicity, proposal domination and cross-process
//! comparability.
//!
//! You can run this binary as follows
//!     RUST_LOG=lattice_agreement=info cargo run --bin gla_coordinator -- <n> <f> <port>

extern crate env_logger;
extern crate lattice_agreement;
#[macro_use]
extern crate log;

use std::env;

use lattice_agreement::coordinator::{verify_gla_results, Coordinator};
use lattice_agreement::lattice::LatticeSet;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    if args.len() != 4 {
        eprintln!("usage: gla_coordinator <n> <f> <port>");
        return;
    }
    let n: u64 = args[1].parse().expect("n is not a number");
    let f: u64 = args[2].parse().expect("f is not a number");
    let port: u64 = args[3].parse().expect("port is not a number");
    assert!(n > 2 * f, "correctness requires n > 2f");

    let values_for = move |id: u64| {
        (0..n)
            .map(|j| LatticeSet::singleton(j * n + id))
            .collect::<Vec<_>>()
    };

    let coordinator = Coordinator::bind(n, f, port).expect("Could not bind the coordinator port");
    let results = coordinator.run(values_for).expect("The test run failed");

    if verify_gla_results(&results, values_for) {
        info!("all learnt sequences are monotone and comparable");
    } else {
        error!("verification failed, see the log above");
    }
    println!("Done");
}
