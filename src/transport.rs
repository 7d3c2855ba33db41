//! A module which contains the asynchronous TCP transport used by every
//! protocol: a listening socket whose framed messages are handed to a
//! protocol callback, and one FIFO writer per peer for outbound messages.
//!
//! Inbound: an accept thread spawns one reader thread per connection; frames
//! are pushed onto a bounded queue drained by a small pool of dispatcher
//! threads which invoke the registered [`MessageHandler`]. The handler may be
//! called concurrently and must synchronize internally. When the queue is
//! full the readers block, which turns into TCP back-pressure on the peers.
//!
//! Outbound: [`Transport::send`] enqueues onto the writer owned by the peer's
//! id. The writer connects lazily (with a bounded number of retries), keeps
//! per-peer FIFO order, and on a write failure drops the message and
//! re-establishes the connection on the next send; the protocols tolerate the
//! loss because every agreement round is driven by threshold counting and
//! proposers re-send on refinement. An optional artificial delay, sampled per
//! message, can be applied before each write for benchmark realism.

use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use log::Level;
use net2::TcpBuilder;
use rand::distributions::{Distribution, Normal};

use crate::codec;

/// How many threads decode inbound messages and run protocol callbacks.
const DISPATCH_THREADS: usize = 3;

/// Bound of the inbound dispatch queue.
const INBOUND_QUEUE: usize = 1024;

/// How often a writer retries a refused connection before dropping a message.
const CONNECT_ATTEMPTS: u32 = 10;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Identifies one process of the test. Identity is `id`; two descriptors with
/// equal ids refer to the same logical process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDescriptor {
    pub ip: String,
    pub id: u64,
    pub port: u64,
}

/// The callback invoked for every received payload. Implementations are
/// shared across dispatcher threads.
pub trait MessageHandler: Send + Sync {
    fn on_message_received(&self, message: Vec<u8>);
}

/// The artificial pre-send latency of a transport. `Disabled` is the
/// production setting; `Normal` draws a per-message delay from a normal
/// distribution (negative samples mean no delay).
#[derive(Debug, Clone)]
pub enum SendDelay {
    Disabled,
    Normal { mean_ms: f64, stddev_ms: f64 },
}

impl SendDelay {
    fn sample(&self) -> Option<Duration> {
        match self {
            SendDelay::Disabled => None,
            SendDelay::Normal { mean_ms, stddev_ms } => {
                let ms = Normal::new(*mean_ms, *stddev_ms).sample(&mut rand::thread_rng());
                if ms > 0.0 {
                    Some(Duration::from_micros((ms * 1000.0) as u64))
                } else {
                    None
                }
            }
        }
    }
}

struct PeerWriter {
    queue: Sender<Vec<u8>>,
}

/// The framed TCP endpoint of one process.
pub struct Transport {
    listener: TcpListener,
    local_port: u64,
    delay: SendDelay,
    writers: Mutex<HashMap<u64, PeerWriter>>,
    inbound_queue: SyncSender<Vec<u8>>,
    // Taken by the first start() call.
    inbound_messages: Mutex<Option<Receiver<Vec<u8>>>>,
    handler: Arc<RwLock<Option<Arc<dyn MessageHandler>>>>,
    should_stop: Arc<AtomicBool>,
}

impl Transport {
    /// Binds the listening socket. Port 0 picks an ephemeral port, reported
    /// by [`Transport::local_port`]. A port already in use is a fatal setup
    /// error surfaced to the caller.
    pub fn bind(port: u64, delay: SendDelay) -> io::Result<Transport> {
        let listener = TcpBuilder::new_v4()?
            .reuse_address(true)?
            .bind(("0.0.0.0", port as u16))?
            .listen(128)?;
        let local_port = u64::from(listener.local_addr()?.port());

        let (inbound_queue, inbound_messages) = sync_channel(INBOUND_QUEUE);

        Ok(Transport {
            listener,
            local_port,
            delay,
            writers: Mutex::new(HashMap::new()),
            inbound_queue,
            inbound_messages: Mutex::new(Some(inbound_messages)),
            handler: Arc::new(RwLock::new(None)),
            should_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The port the listener actually bound.
    pub fn local_port(&self) -> u64 {
        self.local_port
    }

    /// Registers the protocol callback and starts the accept thread and the
    /// dispatcher pool.
    pub fn start(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write().unwrap() = Some(handler);

        let inbound = self
            .inbound_messages
            .lock()
            .unwrap()
            .take()
            .expect("transport started twice");
        let inbound = Arc::new(Mutex::new(inbound));
        for _ in 0..DISPATCH_THREADS {
            let inbound = inbound.clone();
            let handler = self.handler.clone();
            thread::spawn(move || dispatch_loop(inbound, handler));
        }

        let listener = self.listener.try_clone().expect("cloning listener failed");
        let queue = self.inbound_queue.clone();
        let should_stop = self.should_stop.clone();
        thread::spawn(move || accept_loop(listener, queue, should_stop));
    }

    /// Enqueues one framed message to the peer. Never blocks on the network;
    /// delivery failures are logged by the writer and the message dropped.
    pub fn send(&self, peer: &ProcessDescriptor, payload: Vec<u8>) {
        let mut writers = self.writers.lock().unwrap();
        let dead = {
            let writer = writers.entry(peer.id).or_insert_with(|| {
                spawn_writer(peer.clone(), self.delay.clone(), self.should_stop.clone())
            });
            writer.queue.send(payload).is_err()
        };
        if dead {
            writers.remove(&peer.id);
        }
    }

    /// Halts the accept loop and tears down every writer. In-flight reads and
    /// writes complete or error out; queued outbound messages are abandoned.
    pub fn stop(&self) {
        if self.should_stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writers.lock().unwrap().clear();
        *self.handler.write().unwrap() = None;
        // Wake the accept loop so it observes the stop flag.
        let _ = TcpStream::connect(("127.0.0.1", self.local_port as u16));
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, queue: SyncSender<Vec<u8>>, should_stop: Arc<AtomicBool>) {
    for connection in listener.incoming() {
        if should_stop.load(Ordering::SeqCst) {
            break;
        }
        match connection {
            Ok(stream) => {
                let queue = queue.clone();
                thread::spawn(move || reader_loop(stream, queue));
            }
            Err(e) => {
                error!("error accepting connection: {}", e);
            }
        }
    }
}

fn reader_loop(mut stream: TcpStream, queue: SyncSender<Vec<u8>>) {
    loop {
        match codec::read_frame(&mut stream) {
            Ok(payload) => {
                if queue.send(payload).is_err() {
                    break;
                }
            }
            Err(e) => {
                // A clean shutdown surfaces as EOF at a frame boundary;
                // anything else is a framing error that kills the connection.
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!("closing connection after read error: {}", e);
                }
                break;
            }
        }
    }
}

fn dispatch_loop(
    inbound: Arc<Mutex<Receiver<Vec<u8>>>>,
    handler: Arc<RwLock<Option<Arc<dyn MessageHandler>>>>,
) {
    loop {
        let message = {
            let inbound = inbound.lock().unwrap();
            inbound.recv()
        };
        match message {
            Ok(payload) => {
                let handler = handler.read().unwrap().clone();
                if let Some(handler) = handler {
                    handler.on_message_received(payload);
                }
            }
            Err(_) => break,
        }
    }
}

fn spawn_writer(
    peer: ProcessDescriptor,
    delay: SendDelay,
    should_stop: Arc<AtomicBool>,
) -> PeerWriter {
    let (queue, messages) = channel();
    thread::spawn(move || writer_loop(peer, delay, messages, should_stop));
    PeerWriter { queue }
}

fn writer_loop(
    peer: ProcessDescriptor,
    delay: SendDelay,
    messages: Receiver<Vec<u8>>,
    should_stop: Arc<AtomicBool>,
) {
    let mut stream: Option<TcpStream> = None;
    while let Ok(payload) = messages.recv() {
        if should_stop.load(Ordering::SeqCst) {
            break;
        }
        if let Some(pause) = delay.sample() {
            thread::sleep(pause);
        }
        if stream.is_none() {
            stream = connect_with_retry(&peer, &should_stop);
        }
        if let Some(s) = stream.as_mut() {
            if let Err(e) = codec::write_frame(s, &payload) {
                warn!("dropping message to {} after write error: {}", peer.id, e);
                stream = None;
            }
        } else if log_enabled!(Level::Info) {
            info!("dropping message to unreachable peer {}", peer.id);
        }
    }
}

fn connect_with_retry(peer: &ProcessDescriptor, should_stop: &AtomicBool) -> Option<TcpStream> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        if should_stop.load(Ordering::SeqCst) {
            return None;
        }
        match TcpStream::connect((peer.ip.as_str(), peer.port as u16)) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                if log_enabled!(Level::Info) {
                    info!(
                        "connected to peer {} at {}:{}",
                        peer.id, peer.ip, peer.port
                    );
                }
                return Some(stream);
            }
            Err(e) => {
                if log_enabled!(Level::Info) {
                    info!(
                        "connect to peer {} failed (attempt {}/{}): {}",
                        peer.id, attempt, CONNECT_ATTEMPTS, e
                    );
                }
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
    error!(
        "giving up connecting to peer {} at {}:{}",
        peer.id, peer.ip, peer.port
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Collector {
        sink: Mutex<mpsc::Sender<Vec<u8>>>,
    }

    impl Collector {
        fn new() -> (Arc<Collector>, mpsc::Receiver<Vec<u8>>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Collector { sink: Mutex::new(tx) }), rx)
        }
    }

    impl MessageHandler for Collector {
        fn on_message_received(&self, message: Vec<u8>) {
            let _ = self.sink.lock().unwrap().send(message);
        }
    }

    fn loopback(port: u64) -> ProcessDescriptor {
        ProcessDescriptor {
            ip: "127.0.0.1".to_string(),
            id: port,
            port,
        }
    }

    #[test]
    fn test_send_and_receive() {
        let sender = Transport::bind(0, SendDelay::Disabled).unwrap();
        let receiver = Transport::bind(0, SendDelay::Disabled).unwrap();
        let (collector, messages) = Collector::new();
        receiver.start(collector);

        sender.send(&loopback(receiver.local_port()), b"payload".to_vec());

        let received = messages.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received, b"payload");

        sender.stop();
        receiver.stop();
    }

    #[test]
    fn test_fifo_per_peer() {
        let sender = Transport::bind(0, SendDelay::Disabled).unwrap();
        let receiver = Transport::bind(0, SendDelay::Disabled).unwrap();
        let (collector, messages) = Collector::new();
        receiver.start(collector);

        let peer = loopback(receiver.local_port());
        for i in 0..100u64 {
            sender.send(&peer, i.to_le_bytes().to_vec());
        }

        for i in 0..100u64 {
            let received = messages.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(received, i.to_le_bytes().to_vec());
        }

        sender.stop();
        receiver.stop();
    }

    #[test]
    fn test_reconnect_after_peer_restart() {
        let sender = Transport::bind(0, SendDelay::Disabled).unwrap();

        let first = Transport::bind(0, SendDelay::Disabled).unwrap();
        let port = first.local_port();
        let (collector, messages) = Collector::new();
        first.start(collector);

        let peer = loopback(port);
        sender.send(&peer, b"before".to_vec());
        assert_eq!(
            messages.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"before"
        );

        first.stop();
        drop(first);
        drop(messages);

        // Rebind the same port and expect delivery to resume. Messages sent
        // while the writer still believes the old connection is alive may be
        // lost, so keep sending until one arrives.
        let second = Transport::bind(port, SendDelay::Disabled).unwrap();
        let (collector, messages) = Collector::new();
        second.start(collector);

        let mut delivered = false;
        for _ in 0..50 {
            sender.send(&peer, b"after".to_vec());
            if let Ok(received) = messages.recv_timeout(Duration::from_millis(200)) {
                assert_eq!(received, b"after");
                delivered = true;
                break;
            }
        }
        assert!(delivered, "no message delivered after peer restart");

        sender.stop();
        second.stop();
    }

    #[test]
    fn test_delay_sampling() {
        assert!(SendDelay::Disabled.sample().is_none());

        let fixed = SendDelay::Normal {
            mean_ms: 5.0,
            stddev_ms: 0.0,
        };
        let sampled = fixed.sample().unwrap();
        assert_eq!(sampled, Duration::from_micros(5000));
    }
}
