//! A participant of a single-shot lattice agreement test: registers with the
//! coordinator, runs the Faleiro protocol over the value it is handed, and
//! reports the decision.
//!
//! You can run this binary as follows
//!     RUST_LOG=lattice_agreement=info cargo run --bin faleiro_node -- Config
//! or, overriding the ports from the configuration file (0 picks ephemeral
//! ports, useful when several nodes share one machine and one file),
//!     cargo run --bin faleiro_node -- Config <protocol_port> <client_port>

extern crate env_logger;
extern crate lattice_agreement;
#[macro_use]
extern crate log;

use std::env;
use std::time::Instant;

use lattice_agreement::configurations::get_config;
use lattice_agreement::coordinator::CoordinatorClient;
use lattice_agreement::faleiro::{Acceptor, FaleiroProtocol, Proposer};
use lattice_agreement::lattice::LatticeSet;
use lattice_agreement::transport::{ProcessDescriptor, Transport};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    let (config_name, port_overrides) = match args.len() {
        2 => (&args[1], None),
        4 => {
            let protocol_port: u64 = args[2].parse().expect("protocol port is not a number");
            let client_port: u64 = args[3].parse().expect("client port is not a number");
            (&args[1], Some((protocol_port, client_port)))
        }
        _ => {
            eprintln!("usage: faleiro_node <config> [<protocol_port> <client_port>]");
            return;
        }
    };

    let settings = get_config(config_name);
    let (protocol_port, client_port) = port_overrides
        .unwrap_or((settings.node.protocol_port, settings.node.client_port));

    let coordinator = ProcessDescriptor {
        ip: settings.coordinator.host.clone(),
        id: u64::max_value(),
        port: settings.coordinator.port,
    };
    let mut client: CoordinatorClient<LatticeSet> =
        CoordinatorClient::new(client_port, coordinator).expect("Could not bind the client port");

    let transport = Transport::bind(protocol_port, settings.latency.to_send_delay())
        .expect("Could not bind the protocol port");
    let protocol_port = transport.local_port();

    let id = client
        .register(protocol_port, &settings.node.host)
        .expect("Registration failed");
    let test_info = client
        .wait_for_test_info()
        .expect("Could not receive the test info");

    let protocol = FaleiroProtocol::new(transport);
    for peer in &test_info.peers {
        protocol.add_process(peer.clone());
    }
    let proposer = Proposer::new(protocol.clone(), id, test_info.n);
    let acceptor = Acceptor::new(protocol.clone());
    protocol.start(proposer.clone(), acceptor);

    client.wait_for_start().expect("Could not receive the start signal");

    let initial_value = test_info
        .values
        .first()
        .cloned()
        .expect("The test info carried no initial value");
    info!("running lattice agreement as process {}", id);

    let begin = Instant::now();
    let decision = proposer.start(initial_value);
    let elapsed_micros = begin.elapsed().as_micros() as u64;

    info!("decision {:?} after {} us", decision, elapsed_micros);
    client
        .send_test_complete(elapsed_micros, vec![decision])
        .expect("Could not report the result");

    client.wait_for_stop().expect("Could not receive the stop signal");
    protocol.stop();
}
