//! The module that contains the benchmark orchestration: the client embedded
//! in every participant (register, receive the test description, wait for
//! start/stop, report the result) and the coordinator that drives a test
//! across `n` participants and verifies the collected outputs.
//!
//! The coordinator exchange is synchronous: framed messages over plain
//! `TcpStream`s, one registration connection per participant plus one
//! control connection (TestInfo, Start, Stop) the coordinator opens to each
//! participant's client port. Results travel on fresh connections back to
//! the coordinator.

use std::io;
use std::marker::PhantomData;
use std::net::{TcpListener, TcpStream};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::lattice::Lattice;
use crate::message::{decode_assigned_id, encode_assigned_id, CoordinatorMessage, PeerInfo};
use crate::transport::ProcessDescriptor;

fn invalid_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn unexpected_message(context: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected message while waiting for {}", context),
    )
}

/// The description of one test as delivered to a participant.
#[derive(Debug, Clone)]
pub struct TestInfo<L> {
    pub n: u64,
    pub f: u64,

    // One value for the LA-family protocols, a sequence for GLA.
    pub values: Vec<L>,

    // Every participant, this process included.
    pub peers: Vec<ProcessDescriptor>,
}

/// The result one participant reports.
#[derive(Debug, Clone)]
pub struct TestResult<L> {
    pub id: u64,
    pub elapsed_micros: u64,

    // A single decision for the LA-family protocols, the learnt sequence
    // for GLA.
    pub values: Vec<L>,
}

/// The coordinator-facing side of a participant.
pub struct CoordinatorClient<L> {
    listener: TcpListener,
    coordinator: ProcessDescriptor,
    my_id: u64,

    // The control connection the coordinator opened; established by
    // `wait_for_test_info`, reused for Start and Stop.
    control: Option<TcpStream>,

    value: PhantomData<L>,
}

impl<L> CoordinatorClient<L>
where
    L: Lattice + Serialize + DeserializeOwned,
{
    /// Binds the client port the coordinator will connect back to. Port 0
    /// picks an ephemeral port.
    pub fn new(client_port: u64, coordinator: ProcessDescriptor) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", client_port as u16))?;
        Ok(CoordinatorClient {
            listener,
            coordinator,
            my_id: u64::max_value(),
            control: None,
            value: PhantomData,
        })
    }

    pub fn client_port(&self) -> io::Result<u64> {
        Ok(u64::from(self.listener.local_addr()?.port()))
    }

    /// Registers this participant and returns the assigned process id.
    pub fn register(&mut self, protocol_port: u64, ip: &str) -> io::Result<u64> {
        let mut stream = self.connect_to_coordinator()?;
        let message = CoordinatorMessage::<L>::Register {
            protocol_port,
            client_port: self.client_port()?,
            ip: ip.to_string(),
        };
        codec::write_frame(&mut stream, &message.encode())?;
        let reply = codec::read_frame(&mut stream)?;
        self.my_id = decode_assigned_id(&reply).map_err(invalid_data)?;
        info!("registered with the coordinator as process {}", self.my_id);
        Ok(self.my_id)
    }

    /// Accepts the coordinator's control connection and reads the test
    /// description.
    pub fn wait_for_test_info(&mut self) -> io::Result<TestInfo<L>> {
        let (mut stream, _) = self.listener.accept()?;
        let payload = codec::read_frame(&mut stream)?;
        match CoordinatorMessage::<L>::decode(&payload).map_err(invalid_data)? {
            CoordinatorMessage::TestInfo { n, f, values, peers } => {
                self.control = Some(stream);
                Ok(TestInfo {
                    n,
                    f,
                    values,
                    peers: peers
                        .into_iter()
                        .map(|peer| ProcessDescriptor {
                            ip: peer.ip,
                            id: peer.id,
                            port: peer.port,
                        })
                        .collect(),
                })
            }
            _ => Err(unexpected_message("test info")),
        }
    }

    pub fn wait_for_start(&mut self) -> io::Result<()> {
        self.wait_for_control("start")
    }

    pub fn wait_for_stop(&mut self) -> io::Result<()> {
        self.wait_for_control("stop")
    }

    fn wait_for_control(&mut self, expected: &str) -> io::Result<()> {
        let stream = self
            .control
            .as_mut()
            .ok_or_else(|| unexpected_message(expected))?;
        let payload = codec::read_frame(stream)?;
        match (
            CoordinatorMessage::<L>::decode(&payload).map_err(invalid_data)?,
            expected,
        ) {
            (CoordinatorMessage::Start, "start") | (CoordinatorMessage::Stop, "stop") => Ok(()),
            _ => Err(unexpected_message(expected)),
        }
    }

    /// Reports the result over a fresh connection to the coordinator.
    pub fn send_test_complete(&self, elapsed_micros: u64, values: Vec<L>) -> io::Result<()> {
        let mut stream = self.connect_to_coordinator()?;
        let message = CoordinatorMessage::TestComplete {
            elapsed_micros,
            id: self.my_id,
            values,
        };
        codec::write_frame(&mut stream, &message.encode())
    }

    fn connect_to_coordinator(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.coordinator.ip.as_str(), self.coordinator.port as u16))
    }
}

/// The test orchestrator. Registers `n` participants, hands out the test
/// description and the start signal, collects the results and releases the
/// participants with a stop.
pub struct Coordinator {
    n: u64,
    f: u64,
    listener: TcpListener,
}

impl Coordinator {
    pub fn bind(n: u64, f: u64, port: u64) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port as u16))?;
        Ok(Coordinator { n, f, listener })
    }

    pub fn local_port(&self) -> io::Result<u64> {
        Ok(u64::from(self.listener.local_addr()?.port()))
    }

    /// Runs one test. `values_for` produces the initial values handed to the
    /// participant with a given id (one value for the LA family, a sequence
    /// for GLA). Returns the collected results in arrival order.
    pub fn run<L, V>(&self, values_for: V) -> io::Result<Vec<TestResult<L>>>
    where
        L: Lattice + Serialize + DeserializeOwned,
        V: Fn(u64) -> Vec<L>,
    {
        // Registration: ids are assigned in arrival order.
        info!("waiting for {} registrations", self.n);
        let mut known_peers = Vec::new();
        let mut clients = Vec::new();
        for id in 0..self.n {
            let (mut stream, addr) = self.listener.accept()?;
            let payload = codec::read_frame(&mut stream)?;
            match CoordinatorMessage::<L>::decode(&payload).map_err(invalid_data)? {
                CoordinatorMessage::Register {
                    protocol_port,
                    client_port,
                    ip,
                } => {
                    codec::write_frame(&mut stream, &encode_assigned_id(id))?;
                    info!(
                        "registered process {} at {} (protocol port {}, client port {})",
                        id, addr, protocol_port, client_port
                    );
                    known_peers.push(PeerInfo {
                        port: protocol_port,
                        ip: ip.clone(),
                        id,
                    });
                    clients.push(ProcessDescriptor {
                        ip,
                        id,
                        port: client_port,
                    });
                }
                _ => return Err(unexpected_message("registration")),
            }
        }

        // Hand out the test description over one control connection per
        // participant, then the start signal.
        info!("sending test info");
        let mut controls = Vec::new();
        for client in &clients {
            let mut stream = TcpStream::connect((client.ip.as_str(), client.port as u16))?;
            let message = CoordinatorMessage::TestInfo {
                n: self.n,
                f: self.f,
                values: values_for(client.id),
                peers: known_peers.clone(),
            };
            codec::write_frame(&mut stream, &message.encode())?;
            controls.push(stream);
        }

        info!("sending start");
        for stream in &mut controls {
            codec::write_frame(stream, &CoordinatorMessage::<L>::Start.encode())?;
        }

        info!("waiting for results");
        let mut results = Vec::new();
        let mut total_micros = 0u64;
        for done in 0..self.n {
            let (mut stream, _) = self.listener.accept()?;
            let payload = codec::read_frame(&mut stream)?;
            match CoordinatorMessage::<L>::decode(&payload).map_err(invalid_data)? {
                CoordinatorMessage::TestComplete {
                    elapsed_micros,
                    id,
                    values,
                } => {
                    total_micros += elapsed_micros;
                    info!(
                        "result {}/{} from process {}: {} us, {:?}",
                        done + 1,
                        self.n,
                        id,
                        elapsed_micros,
                        values
                    );
                    results.push(TestResult {
                        id,
                        elapsed_micros,
                        values,
                    });
                }
                _ => return Err(unexpected_message("results")),
            }
        }
        info!(
            "average time: {} us",
            total_micros as f64 / self.n as f64
        );

        info!("sending stop");
        for stream in &mut controls {
            codec::write_frame(stream, &CoordinatorMessage::<L>::Stop.encode())?;
        }

        Ok(results)
    }
}

/// The pairs of process ids whose values are not comparable. Empty means the
/// agreement property held.
pub fn comparability_violations<L: Lattice>(values: &[(u64, L)]) -> Vec<(u64, u64)> {
    let mut violations = Vec::new();
    for (i, (left_id, left)) in values.iter().enumerate() {
        for (right_id, right) in values.iter().skip(i + 1) {
            if !left.leq(right) && !right.leq(left) {
                violations.push((*left_id, *right_id));
            }
        }
    }
    violations
}

/// Whether every element of `sequence` dominates its predecessor.
pub fn is_monotone<L: Lattice>(sequence: &[L]) -> bool {
    sequence
        .windows(2)
        .all(|pair| pair[0].leq(&pair[1]))
}

/// Checks the single-shot agreement property: every pair of decisions is
/// comparable. Violations are logged; the test itself is not failed.
pub fn verify_la_results<L: Lattice>(results: &[TestResult<L>]) -> bool {
    let decisions: Vec<(u64, L)> = results
        .iter()
        .filter_map(|result| {
            result
                .values
                .first()
                .map(|value| (result.id, value.clone()))
        })
        .collect();
    let violations = comparability_violations(&decisions);
    for (left, right) in &violations {
        error!("results of processes {} and {} are not comparable", left, right);
    }
    violations.is_empty()
}

/// Checks the generalized agreement properties: every learnt sequence is
/// monotone, every learnt value dominates the proposal that triggered it,
/// and learnt values are comparable across all processes.
pub fn verify_gla_results<L, V>(results: &[TestResult<L>], proposals_for: V) -> bool
where
    L: Lattice,
    V: Fn(u64) -> Vec<L>,
{
    let mut ok = true;
    let mut all_learnt = Vec::new();
    for result in results {
        if !is_monotone(&result.values) {
            error!("learnt sequence of process {} is not monotone", result.id);
            ok = false;
        }
        let proposals = proposals_for(result.id);
        for (learnt, proposal) in result.values.iter().zip(proposals.iter()) {
            if !proposal.leq(learnt) {
                error!(
                    "process {} learnt {:?} which ignores its proposal {:?}",
                    result.id, learnt, proposal
                );
                ok = false;
            }
        }
        for learnt in &result.values {
            all_learnt.push((result.id, learnt.clone()));
        }
    }
    let violations = comparability_violations(&all_learnt);
    for (left, right) in &violations {
        error!(
            "learnt values of processes {} and {} are not comparable",
            left, right
        );
    }
    ok && violations.is_empty()
}
