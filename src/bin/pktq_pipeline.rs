//! pktq pipeline demo
//!
//! UDP ingest -> queue -> counting sink:
//! - Producer threads each own a non-blocking UDP socket polled with mio
//!   and push received datagrams into the queue in bursts
//! - The main thread is the cooperative worker running the queue task
//! - Stats are logged periodically and at exit
//!
//! Usage:
//!   cargo run --release --bin pktq_pipeline -- [OPTIONS]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use tracing_subscriber::EnvFilter;

use pktq::module::Command;
use pktq::{Ingress, PacketBatch, PacketBuf, Queue, QueueConfig, Worker};

const SOCKET: Token = Token(0);
const MAX_DATAGRAM: usize = 9216;
const RECV_BUFFER_BYTES: i32 = 4 * 1024 * 1024;

/// Pipeline configuration
#[derive(Parser, Debug)]
#[command(name = "pktq_pipeline", about = "UDP ingest through a pktq queue stage")]
struct Args {
    /// First UDP bind address; producer i listens on port + i
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    bind: SocketAddr,

    /// Number of producer threads
    #[arg(short, long, default_value_t = 2)]
    producers: u16,

    /// Queue size (power of two, 4..=16384)
    #[arg(long)]
    size: Option<u64>,

    /// Packets per scheduled run (1..=32)
    #[arg(long)]
    burst: Option<u64>,

    /// Warm packet heads before hand-off
    #[arg(long)]
    prefetch: bool,

    /// Resize the queue to this many slots after startup
    #[arg(long)]
    resize: Option<u64>,

    /// Run time in seconds, 0 runs until killed
    #[arg(short, long, default_value_t = 0)]
    duration: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Pipeline statistics
#[derive(Default)]
struct PipelineStats {
    received: AtomicU64,
    received_bytes: AtomicU64,
    delivered: AtomicU64,
    delivered_bytes: AtomicU64,
}

impl PipelineStats {
    fn log(&self, queue: &str, uptime: Duration) {
        let rx = self.received.load(Ordering::Relaxed);
        let tx = self.delivered.load(Ordering::Relaxed);
        let secs = uptime.as_secs_f64().max(f64::EPSILON);

        tracing::info!(
            uptime_s = secs,
            received = rx,
            received_kb = self.received_bytes.load(Ordering::Relaxed) / 1024,
            delivered = tx,
            delivered_kb = self.delivered_bytes.load(Ordering::Relaxed) / 1024,
            // Received but neither delivered nor queued
            dropped_or_queued = rx.saturating_sub(tx),
            rx_per_sec = rx as f64 / secs,
            tx_per_sec = tx as f64 / secs,
            queue,
            "pipeline stats"
        );
    }
}

/// Terminal stage: counts and releases everything it receives
struct CountingSink {
    stats: Arc<PipelineStats>,
}

impl Ingress<PacketBuf> for CountingSink {
    fn process_batch(&self, batch: &mut PacketBatch<PacketBuf>) {
        let mut bytes = 0u64;
        let mut pkts = 0u64;
        for pkt in batch.drain() {
            bytes += pkt.as_bytes().len() as u64;
            pkts += 1;
        }
        self.stats.delivered.fetch_add(pkts, Ordering::Relaxed);
        self.stats.delivered_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Grow the kernel receive buffer to absorb bursts.
/// Errors are ignored, not all platforms allow it.
#[cfg(unix)]
fn tune_socket(socket: &UdpSocket) {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    unsafe {
        let optval: libc::c_int = RECV_BUFFER_BYTES;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn tune_socket(_socket: &UdpSocket) {}

/// Producer loop: poll one UDP socket, batch datagrams, enqueue
fn run_producer(
    id: u16,
    addr: SocketAddr,
    queue: Arc<Queue<PacketBuf>>,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut socket = UdpSocket::bind(addr)?;
    tune_socket(&socket);
    poll.registry()
        .register(&mut socket, SOCKET, Interest::READABLE)?;

    tracing::info!(producer = id, %addr, "listening");

    let mut events = Events::with_capacity(64);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut batch = PacketBatch::new();
    let mut seq = (id as u64) << 48;

    while running.load(Ordering::Relaxed) {
        poll.poll(&mut events, Some(Duration::from_millis(10)))?;

        for event in events.iter() {
            if event.token() != SOCKET {
                continue;
            }

            // Drain the socket, flushing a burst at a time
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((n, _peer)) => {
                        stats.received.fetch_add(1, Ordering::Relaxed);
                        stats.received_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        // Batch is flushed before it fills, push cannot fail
                        let _ = batch.push(PacketBuf::new(seq, &buf[..n]));
                        seq += 1;
                        if batch.is_full() {
                            queue.process_batch(&mut batch);
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }

            if !batch.is_empty() {
                queue.process_batch(&mut batch);
            }
        }
    }

    tracing::debug!(producer = id, "stopped");
    Ok(())
}

/// Producer `i` binds `bind` with port + i
fn producer_addrs(bind: SocketAddr, producers: u16) -> io::Result<Vec<(u16, SocketAddr)>> {
    (0..producers)
        .map(|id| {
            let port = bind.port().checked_add(id).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("producer {} port overflows base port {}", id, bind.port()),
                )
            })?;
            let mut addr = bind;
            addr.set_port(port);
            Ok((id, addr))
        })
        .collect()
}

/// Wait for every producer, returns how many panicked
fn join_producers(handles: Vec<thread::JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for (id, handle) in handles.into_iter().enumerate() {
        if handle.join().is_err() {
            tracing::error!(producer = id, "producer panicked");
            panicked += 1;
        }
    }
    panicked
}

/// Main pipeline loop
fn run_pipeline(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = QueueConfig {
        burst: args.burst,
        size: args.size,
        prefetch: args.prefetch,
        ..QueueConfig::default()
    };

    let mut worker: Worker<PacketBuf> = Worker::new();
    let mut queue = Queue::init(&config, &mut worker)?;

    // Exclusive access: safe to resize before anything shares the queue
    if let Some(slots) = args.resize {
        queue.command_mut(Command::SetSize(slots))?;
    }

    let task_id = queue.task_id();
    let queue = Arc::new(queue);
    let stats = Arc::new(PipelineStats::default());
    let sink = Arc::new(CountingSink {
        stats: stats.clone(),
    });
    worker.attach(task_id, queue.clone(), sink)?;

    tracing::info!(
        queue = %queue.describe(),
        burst = queue.burst(),
        task = %task_id,
        producers = args.producers,
        "pipeline ready"
    );

    // Resolve every address before any producer starts
    let addrs = producer_addrs(args.bind, args.producers)?;

    let running = Arc::new(AtomicBool::new(true));
    let mut producers = Vec::with_capacity(addrs.len());
    for (id, addr) in addrs {
        let (queue, stats, running) = (queue.clone(), stats.clone(), running.clone());
        producers.push(thread::spawn(move || {
            if let Err(e) = run_producer(id, addr, queue, stats, running) {
                tracing::error!(producer = id, error = %e, "producer failed");
            }
        }));
    }

    let start = Instant::now();
    let deadline = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let mut last_stats = Instant::now();

    loop {
        let ret = worker.run_once();

        if last_stats.elapsed() > Duration::from_secs(5) {
            stats.log(&queue.describe().to_string(), start.elapsed());
            last_stats = Instant::now();
        }

        if deadline.is_some_and(|d| start.elapsed() >= d) {
            break;
        }

        // Busy poll while traffic flows, yield when idle
        if ret.packets == 0 {
            thread::yield_now();
        }
    }

    running.store(false, Ordering::Relaxed);
    join_producers(producers);

    // Deliver the backlog before shutdown
    while worker.run_once().packets > 0 {}

    stats.log(&queue.describe().to_string(), start.elapsed());
    if let Some(task) = worker.stats(task_id) {
        tracing::info!(
            runs = task.runs,
            idle_runs = task.idle_runs,
            packets = task.packets,
            bits = task.bits,
            "queue task"
        );
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .init();

    if let Err(e) = run_pipeline(args) {
        tracing::error!(error = %e, "pipeline error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_addrs() {
        let bind: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let addrs = producer_addrs(bind, 3).unwrap();
        let ports: Vec<u16> = addrs.iter().map(|(_, a)| a.port()).collect();
        assert_eq!(ports, vec![9999, 10000, 10001]);
    }

    #[test]
    fn test_producer_addrs_port_overflow() {
        let bind: SocketAddr = "127.0.0.1:65534".parse().unwrap();
        assert_eq!(producer_addrs(bind, 2).unwrap().len(), 2);

        let err = producer_addrs(bind, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_join_producers_reports_panics() {
        let handles = vec![
            thread::spawn(|| {}),
            thread::spawn(|| panic!("producer down")),
            thread::spawn(|| {}),
        ];
        assert_eq!(join_producers(handles), 1);
    }
}
