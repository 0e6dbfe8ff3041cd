//! The send path.
//!
//! A [`Sender`] owns an outbound queue and a dedicated task that drains
//! it: requests are materialized into frames, coalesced per encryption
//! level, admitted by the congestion controller, numbered, protected, and
//! handed to the [`DatagramSink`]; every emission is recorded in the
//! in-flight registry and, for CRYPTO-bearing packets, armed with a
//! retransmission timer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::congestion::{CongestionAlgorithm, CongestionController, NewRenoController};
use crate::core::config::TransportConfig;
use crate::core::constants::{AEAD_TAG_SIZE, PACKET_NUMBER_SIZE};
use crate::core::error::SendError;
use crate::crypto::{seal_packet, ConnectionSecrets};
use crate::frame::{AckFrame, ConnectionCloseFrame, Frame};
use crate::packet::header::{encode_header, header_overhead, ConnectionIds};
use crate::packet::{EncryptionLevel, PacketId, PacketNumberAllocator, QuicPacket};
use crate::recovery::{
    AckProcessor, HandshakeFlight, InFlightRegistry, LostFrameHandler, RecordView,
    RetransmitScheduler, RttEstimator,
};

/// Destination for finished datagrams.
///
/// Production sinks wrap a connected UDP socket; tests record the buffers.
pub trait DatagramSink: Send + Sync {
    /// Hand one datagram to the network. An error is fatal to the send
    /// task.
    fn send_datagram(&self, data: &[u8]) -> io::Result<()>;
}

/// [`DatagramSink`] over a connected [`tokio::net::UdpSocket`].
#[derive(Debug)]
pub struct UdpSink {
    socket: Arc<tokio::net::UdpSocket>,
}

impl UdpSink {
    /// Wrap a connected socket.
    pub fn new(socket: Arc<tokio::net::UdpSocket>) -> Self {
        Self { socket }
    }
}

impl DatagramSink for UdpSink {
    fn send_datagram(&self, data: &[u8]) -> io::Result<()> {
        // The send loop paces itself under the congestion window, so a
        // full OS buffer is exceptional rather than routine.
        self.socket.try_send(data).map(|_| ())
    }
}

/// Callback producing one frame sized to the offered budget, or `None` to
/// withdraw the request.
pub type FrameProducer = Box<dyn FnMut(usize) -> Option<Frame> + Send>;

/// An entry on the outbound queue.
pub enum SendRequest {
    /// A packet assembled by the caller (control packets, retransmits).
    Packet {
        /// The packet; numbered when it is emitted.
        packet: QuicPacket,
        /// Tag carried into the emission log line.
        log_message: String,
    },
    /// A deferred frame: the producer runs on the send task with the
    /// actual budget available at serialization time.
    Frame {
        /// Produces the frame, or withdraws.
        producer: FrameProducer,
        /// Smallest budget worth offering to the producer.
        min_size: usize,
        /// Level the frame is destined for.
        level: EncryptionLevel,
        /// Invoked if the frame is later declared lost.
        lost_handler: Option<Arc<dyn LostFrameHandler>>,
    },
}

/// The send half of a connection.
///
/// Shared behind an [`Arc`]; all methods take `&self`.
pub struct Sender {
    config: TransportConfig,
    cids: ConnectionIds,
    sink: Arc<dyn DatagramSink>,

    queue_tx: mpsc::UnboundedSender<SendRequest>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<SendRequest>>>,
    shutdown_tx: watch::Sender<bool>,

    allocator: PacketNumberAllocator,
    registry: Arc<InFlightRegistry>,
    rtt: Arc<Mutex<RttEstimator>>,
    congestion: Arc<CongestionController>,
    handshake: Arc<HandshakeFlight>,
    ack_processor: AckProcessor,
    scheduler: OnceLock<RetransmitScheduler>,
    closed: AtomicBool,
}

impl Sender {
    /// Create a sender with the default congestion algorithm.
    pub fn new(config: TransportConfig, cids: ConnectionIds, sink: Arc<dyn DatagramSink>) -> Self {
        let algorithm = NewRenoController::new(config.max_packet_size as u64);
        Self::with_algorithm(config, cids, sink, Box::new(algorithm))
    }

    /// Create a sender around a caller-provided congestion algorithm.
    pub fn with_algorithm(
        config: TransportConfig,
        cids: ConnectionIds,
        sink: Arc<dyn DatagramSink>,
        algorithm: Box<dyn CongestionAlgorithm>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let registry = Arc::new(InFlightRegistry::new());
        let rtt = Arc::new(Mutex::new(RttEstimator::new()));
        let congestion = Arc::new(CongestionController::new(algorithm));
        let handshake = Arc::new(HandshakeFlight::new());
        let ack_processor = AckProcessor::new(
            Arc::clone(&registry),
            Arc::clone(&rtt),
            Arc::clone(&congestion),
            Arc::clone(&handshake),
        );
        Self {
            config,
            cids,
            sink,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
            allocator: PacketNumberAllocator::new(),
            registry,
            rtt,
            congestion,
            handshake,
            ack_processor,
            scheduler: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Start the send task and the retransmission scheduler.
    ///
    /// `secrets` carries the write keys installed so far; levels keyed
    /// later must be installed before anything is queued for them.
    pub fn start(self: &Arc<Self>, secrets: ConnectionSecrets) {
        let rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .expect("sender started twice");

        let scheduler = {
            let registry = Arc::clone(&self.registry);
            let congestion = Arc::clone(&self.congestion);
            let handshake = Arc::clone(&self.handshake);
            let queue_tx = self.queue_tx.clone();
            RetransmitScheduler::spawn(self.shutdown_tx.subscribe(), move |id| {
                if !handshake.crypto_in_flight() {
                    return;
                }
                let Some(claim) = registry.take_for_retransmit(id) else {
                    // Acked, already resent, or not a crypto packet: the
                    // timer cancels itself here.
                    return;
                };
                let retries = handshake.bump_failed_retries();
                congestion.register_lost(claim.size, claim.time_sent);
                debug!(packet = %id, retries, "crypto packet not acknowledged; retransmitting");
                let _ = queue_tx.send(SendRequest::Packet {
                    packet: claim.packet,
                    log_message: format!("retransmit {id}"),
                });
            })
        };
        // start() runs once; the scheduler slot is necessarily empty.
        let _ = self.scheduler.set(scheduler);

        let this = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            this.run(rx, secrets, shutdown_rx).await;
        });
    }

    /// Queue a prebuilt packet.
    pub fn send_packet(
        &self,
        packet: QuicPacket,
        log_message: impl Into<String>,
    ) -> Result<(), SendError> {
        let log_message = log_message.into();
        debug!(packet = %packet, msg = %log_message, "queueing packet");
        self.enqueue(SendRequest::Packet {
            packet,
            log_message,
        })
    }

    /// Queue a frame request: `producer` runs on the send task with the
    /// budget available at serialization time.
    pub fn send_frame(
        &self,
        producer: FrameProducer,
        min_size: usize,
        level: EncryptionLevel,
        lost_handler: Option<Arc<dyn LostFrameHandler>>,
    ) -> Result<(), SendError> {
        self.enqueue(SendRequest::Frame {
            producer,
            min_size,
            level,
            lost_handler,
        })
    }

    /// Queue an already-built frame for (re)transmission.
    pub fn resend_frame(
        &self,
        frame: Frame,
        level: EncryptionLevel,
        lost_handler: Option<Arc<dyn LostFrameHandler>>,
    ) -> Result<(), SendError> {
        let min_size = frame.encoded_len();
        let mut slot = Some(frame);
        let producer = Box::new(move |_| slot.take());
        self.send_frame(producer, min_size, level, lost_handler)
    }

    fn enqueue(&self, request: SendRequest) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::ConnectionClosed);
        }
        self.queue_tx
            .send(request)
            .map_err(|_| SendError::ConnectionClosed)
    }

    /// Process an ACK frame received at `level`.
    pub fn process_ack(&self, ack: &AckFrame, level: EncryptionLevel, time_received: Instant) {
        self.ack_processor.process(ack, level, time_received);
    }

    /// Declare a packet lost: release its congestion accounting and run
    /// the lost-frame handlers attached to its frames.
    pub fn declare_lost(&self, id: PacketId) {
        let Some((size, time_sent, frames)) = self.registry.take_lost(id) else {
            return;
        };
        debug!(packet = %id, "packet declared lost");
        self.congestion.register_lost(size, time_sent);
        for (frame, handler) in frames {
            if let Some(handler) = handler {
                handler.on_frame_lost(frame);
            }
        }
    }

    /// Queue a CONNECTION_CLOSE for the peer, e.g. on a protocol
    /// violation. Call [`shutdown`](Self::shutdown) once it has drained;
    /// shutting down first would discard it.
    pub fn close_connection(&self, error_code: u16, reason: &str) -> Result<(), SendError> {
        let packet = QuicPacket::with_frames(
            EncryptionLevel::Application,
            vec![Frame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                frame_type: 0,
                reason: reason.to_string(),
            })],
        );
        self.send_packet(packet, "connection close")
    }

    /// Interrupt the send task and the scheduler. Pending queue entries
    /// are discarded; subsequent sends fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        info!("sender shutting down");
        for view in self.statistics() {
            debug!(packet = %view.id, status = %view.status, size = view.size, "sent-packet status");
        }
    }

    /// Sorted snapshot of every sent packet's fate.
    pub fn statistics(&self) -> Vec<RecordView> {
        self.registry.snapshot_sorted()
    }

    /// The congestion controller handle.
    pub fn congestion(&self) -> &Arc<CongestionController> {
        &self.congestion
    }

    /// The in-flight registry.
    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    /// Current smoothed RTT in milliseconds.
    pub fn smoothed_rtt_ms(&self) -> u64 {
        self.rtt.lock().unwrap().smoothed_rtt_ms()
    }

    /// Is a CRYPTO-bearing packet currently in flight?
    pub fn handshake_in_flight(&self) -> bool {
        self.handshake.crypto_in_flight()
    }

    /// Has the connection been closed (shutdown or fatal sink error)?
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frame budget for a packet at `level`: what remains of a maximum
    /// size datagram after the header and the AEAD tag.
    pub fn frame_budget(&self, level: EncryptionLevel) -> usize {
        self.config.max_packet_size - header_overhead(level, &self.cids) - AEAD_TAG_SIZE
    }

    /// Exact on-wire size of a packet at `level` carrying `payload_len`
    /// bytes of frames.
    fn projected_size(&self, level: EncryptionLevel, payload_len: usize) -> usize {
        let remainder = PACKET_NUMBER_SIZE + payload_len + AEAD_TAG_SIZE;
        let header = encode_header(level, 0, &self.cids, remainder)
            .expect("header for in-budget packet");
        header.bytes.len() + payload_len + AEAD_TAG_SIZE
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SendRequest>,
        secrets: ConnectionSecrets,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("send task started");
        // A same-level coalescing pass may pull one request too many off
        // the queue; it is carried into the next iteration to preserve
        // FIFO order.
        let mut carry: Option<SendRequest> = None;

        'main: loop {
            let request = match carry.take() {
                Some(request) => request,
                None => tokio::select! {
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                },
            };

            // Materialize the request and coalesce same-level frame
            // requests into one packet while budget remains.
            let (packet, handlers, log_message) = match request {
                SendRequest::Packet {
                    packet,
                    log_message,
                } => {
                    let handlers = vec![None; packet.frames().len()];
                    (packet, handlers, log_message)
                }
                SendRequest::Frame {
                    mut producer,
                    level,
                    lost_handler,
                    ..
                } => {
                    let budget = self.frame_budget(level);
                    let Some(frame) = producer(budget) else {
                        // Withdrawn.
                        continue;
                    };
                    let mut packet = QuicPacket::with_frames(level, vec![frame]);
                    let mut handlers = vec![lost_handler];
                    self.coalesce(&mut packet, &mut handlers, budget, &mut rx, &mut carry);
                    (packet, handlers, String::from("frames"))
                }
            };

            if packet.frames().is_empty() {
                continue;
            }
            let level = packet.level();
            if secrets.get(level).is_none() {
                warn!(%level, "dropping packet: no keys installed for level");
                continue;
            }

            let payload = match packet.payload() {
                Ok(payload) => payload,
                Err(err) => {
                    error!(%err, "failed to serialize frames; dropping packet");
                    continue;
                }
            };
            let size = self.projected_size(level, payload.len());
            if size > self.config.max_packet_size {
                error!(size, "packet exceeds maximum size; dropping");
                continue;
            }

            // Congestion admission; bounded waits keep this interruptible.
            let mut was_blocked = false;
            while !self.congestion.can_send(size as u64) {
                if *shutdown_rx.borrow() {
                    break 'main;
                }
                if !was_blocked {
                    debug!(
                        packet = %packet,
                        unacked = self.registry.unacked_count(),
                        "congestion controller refuses packet; waiting"
                    );
                    was_blocked = true;
                }
                self.congestion
                    .wait_for_update(self.config.admission_wait)
                    .await;
            }
            if was_blocked {
                debug!(packet = %packet, "admission granted");
            }

            // Number, protect, emit.
            let mut packet = packet;
            let packet_number = self.allocator.next(level);
            packet.set_packet_number(packet_number);
            let id = PacketId::new(level, packet_number);

            let datagram = match seal_packet(&secrets, &self.cids, level, packet_number, &payload)
            {
                Ok(datagram) => datagram,
                Err(err) => {
                    error!(%err, packet = %id, "packet protection failed; stopping send task");
                    break;
                }
            };

            let time_sent = Instant::now();
            if let Err(err) = self.sink.send_datagram(&datagram) {
                error!(%err, "datagram sink failed; stopping send task");
                break;
            }
            debug!(packet = %packet, size, msg = %log_message, "packet sent");

            // Record in flight and arm the crypto timer.
            let is_crypto = packet.is_crypto();
            self.registry
                .record(packet, time_sent, size as u64, handlers)
                .expect("freshly allocated packet number");
            self.congestion.register_in_flight(size as u64);

            if is_crypto {
                self.handshake.on_crypto_sent();
                let srtt = self.rtt.lock().unwrap().smoothed_rtt_ms();
                let backoff = 1u64 << self.handshake.failed_retries().min(16);
                let delay =
                    Duration::from_millis(u64::from(self.config.crypto_retry_base) * srtt * backoff);
                if let Some(scheduler) = self.scheduler.get() {
                    scheduler.schedule(delay, id);
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        debug!("send task stopped");
    }

    /// Pull further same-level frame requests off the queue while budget
    /// remains. A request for another level (or one whose minimum does not
    /// fit) goes into `carry` for the next iteration.
    fn coalesce(
        &self,
        packet: &mut QuicPacket,
        handlers: &mut Vec<Option<Arc<dyn LostFrameHandler>>>,
        budget: usize,
        rx: &mut mpsc::UnboundedReceiver<SendRequest>,
        carry: &mut Option<SendRequest>,
    ) {
        loop {
            let remaining = budget.saturating_sub(packet.payload_len());
            if remaining == 0 {
                return;
            }
            match rx.try_recv() {
                Ok(SendRequest::Frame {
                    mut producer,
                    min_size,
                    level,
                    lost_handler,
                }) if level == packet.level() && min_size <= remaining => {
                    if let Some(frame) = producer(remaining) {
                        packet.push_frame(frame);
                        handlers.push(lost_handler);
                    }
                }
                Ok(other) => {
                    *carry = Some(other);
                    return;
                }
                Err(_) => return,
            }
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .field("congestion", &self.congestion)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PacketKeys;
    use crate::frame::{CryptoFrame, StreamFrame};
    use crate::recovery::PacketStatus;

    /// Sink that records every emitted datagram.
    #[derive(Default)]
    struct MockSink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl MockSink {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn sizes(&self) -> Vec<usize> {
            self.sent.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    impl DatagramSink for MockSink {
        fn send_datagram(&self, data: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    /// Sink that always fails.
    struct BrokenSink;

    impl DatagramSink for BrokenSink {
        fn send_datagram(&self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "wire cut"))
        }
    }

    fn cids() -> ConnectionIds {
        ConnectionIds {
            destination: vec![1, 2, 3, 4],
            source: vec![9, 8],
        }
    }

    fn secrets() -> ConnectionSecrets {
        let mut secrets = ConnectionSecrets::new();
        for (i, level) in EncryptionLevel::ALL.into_iter().enumerate() {
            secrets.install(
                level,
                PacketKeys::from_bytes([i as u8 + 1; 32], [i as u8 + 2; 12], [i as u8 + 3; 32]),
            );
        }
        secrets
    }

    fn sender_with_window(window: u64) -> (Arc<Sender>, Arc<MockSink>) {
        let sink = Arc::new(MockSink::default());
        let sender = Arc::new(Sender::with_algorithm(
            TransportConfig::default(),
            cids(),
            Arc::clone(&sink) as Arc<dyn DatagramSink>,
            Box::new(NewRenoController::with_window(1200, window)),
        ));
        sender.start(secrets());
        (sender, sink)
    }

    /// An Application packet that seals to 1230 bytes: short header (9) +
    /// STREAM frame (5 + 1200) + tag (16).
    fn app_packet(data_len: usize) -> QuicPacket {
        QuicPacket::with_frames(
            EncryptionLevel::Application,
            vec![Frame::Stream(StreamFrame {
                stream_id: 0,
                offset: 0,
                data: vec![0xAB; data_len],
                fin: false,
            })],
        )
    }

    fn crypto_packet(level: EncryptionLevel) -> QuicPacket {
        QuicPacket::with_frames(
            level,
            vec![Frame::Crypto(CryptoFrame {
                offset: 0,
                data: vec![0x16; 120],
            })],
        )
    }

    async fn settle() {
        // Let the send task drain; paused-clock tests advance virtually.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_send_under_slack_window() {
        let (sender, sink) = sender_with_window(1250);
        sender.send_packet(app_packet(1200), "packet 1").unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.sizes()[0], 1230);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_blocks_second_packet_until_ack() {
        let (sender, sink) = sender_with_window(1250);
        sender.send_packet(app_packet(1200), "packet 1").unwrap();
        sender.send_packet(app_packet(1200), "packet 2").unwrap();
        settle().await;
        // Both packets are 1230 bytes; only the first fits the window.
        assert_eq!(sink.count(), 1);

        sender.process_ack(
            &AckFrame::for_packet(0),
            EncryptionLevel::Application,
            Instant::now(),
        );
        settle().await;
        assert_eq!(sink.count(), 2);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_at_other_level_does_not_admit() {
        let (sender, sink) = sender_with_window(1250);
        // Small Initial packet, then two large Application packets.
        sender
            .send_packet(
                QuicPacket::with_frames(EncryptionLevel::Initial, vec![Frame::Ping]),
                "initial",
            )
            .unwrap();
        sender.send_packet(app_packet(1150), "packet 1").unwrap();
        sender.send_packet(app_packet(1150), "packet 2").unwrap();
        settle().await;
        assert_eq!(sink.count(), 2);

        // The in-flight pool is unified: acknowledging the small Initial
        // packet frees too little to admit another 1180-byte packet.
        sender.process_ack(
            &AckFrame::for_packet(0),
            EncryptionLevel::Initial,
            Instant::now(),
        );
        settle().await;
        assert_eq!(sink.count(), 2);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_unknown_packet_changes_nothing() {
        let (sender, sink) = sender_with_window(1250);
        sender.send_packet(app_packet(1200), "packet 1").unwrap();
        sender.send_packet(app_packet(1200), "packet 2").unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);

        // Wrong level: no record exists there.
        sender.process_ack(
            &AckFrame::for_packet(0),
            EncryptionLevel::Handshake,
            Instant::now(),
        );
        settle().await;
        assert_eq!(sink.count(), 1);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crypto_packet_retransmitted_when_unacked() {
        let (sender, sink) = sender_with_window(100_000);
        sender
            .send_packet(crypto_packet(EncryptionLevel::Handshake), "crypto")
            .unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);
        assert!(sender.handshake_in_flight());

        // Timer arms at 2 * srtt (initial srtt 100 ms) = 200 ms.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.count(), 2);
        // Same frames, fresh packet number under the same level.
        assert_eq!(sink.sizes()[0], sink.sizes()[1]);

        let views = sender.statistics();
        let first = views
            .iter()
            .find(|v| v.id == PacketId::new(EncryptionLevel::Handshake, 0))
            .unwrap();
        let second = views
            .iter()
            .find(|v| v.id == PacketId::new(EncryptionLevel::Handshake, 1))
            .unwrap();
        assert_eq!(first.status, PacketStatus::Resent);
        assert_eq!(second.status, PacketStatus::InFlight);
        assert!(second.is_crypto);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_crypto_packet_not_retransmitted() {
        let (sender, sink) = sender_with_window(100_000);
        sender
            .send_packet(crypto_packet(EncryptionLevel::Handshake), "crypto")
            .unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);

        sender.process_ack(
            &AckFrame::for_packet(0),
            EncryptionLevel::Handshake,
            Instant::now(),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.count(), 1);
        assert!(!sender.handshake_in_flight());
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_only_packet_never_retransmitted() {
        let (sender, sink) = sender_with_window(100_000);
        sender
            .send_packet(
                QuicPacket::with_frames(
                    EncryptionLevel::Initial,
                    vec![Frame::Ack(AckFrame::for_packet(0))],
                ),
                "ack only",
            )
            .unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);

        // No acknowledgement arrives, and no timer was ever armed.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.count(), 1);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_numbers_allocated_in_emission_order() {
        let (sender, sink) = sender_with_window(1_000_000);
        for i in 0..5 {
            sender
                .send_packet(app_packet(100), format!("packet {i}"))
                .unwrap();
        }
        settle().await;
        assert_eq!(sink.count(), 5);

        let pns: Vec<u64> = sender
            .statistics()
            .iter()
            .filter(|v| v.id.level == EncryptionLevel::Application)
            .map(|v| v.id.packet_number)
            .collect();
        assert_eq!(pns, vec![0, 1, 2, 3, 4]);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_requests_coalesce_per_level() {
        let (sender, sink) = sender_with_window(1_000_000);
        for i in 0..3u64 {
            let mut slot = Some(Frame::MaxStreamData {
                stream_id: i,
                limit: 1000,
            });
            sender
                .send_frame(
                    Box::new(move |_| slot.take()),
                    16,
                    EncryptionLevel::Application,
                    None,
                )
                .unwrap();
        }
        settle().await;
        // All three control frames fit one packet budget.
        assert_eq!(sink.count(), 1);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawn_producer_skipped() {
        let (sender, sink) = sender_with_window(1_000_000);
        sender
            .send_frame(
                Box::new(|_| None),
                16,
                EncryptionLevel::Application,
                None,
            )
            .unwrap();
        sender.send_packet(app_packet(50), "after withdrawal").unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);
        sender.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_closes_connection() {
        let sender = Arc::new(Sender::new(
            TransportConfig::default(),
            cids(),
            Arc::new(BrokenSink),
        ));
        sender.start(secrets());
        sender.send_packet(app_packet(100), "doomed").unwrap();
        settle().await;

        assert!(sender.is_closed());
        assert!(matches!(
            sender.send_packet(app_packet(100), "late"),
            Err(SendError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_queue() {
        let (sender, sink) = sender_with_window(1250);
        sender.send_packet(app_packet(1200), "packet 1").unwrap();
        sender.send_packet(app_packet(1200), "blocked").unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);

        sender.shutdown();
        settle().await;
        // The blocked entry was discarded, not emitted.
        assert_eq!(sink.count(), 1);
        assert!(matches!(
            sender.send_packet(app_packet(10), "late"),
            Err(SendError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_close_emitted_before_shutdown() {
        let (sender, sink) = sender_with_window(1_000_000);
        sender.close_connection(0x0a, "protocol violation").unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);

        sender.shutdown();
        assert!(matches!(
            sender.close_connection(0, "again"),
            Err(SendError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_declare_lost_runs_handlers_and_releases_window() {
        struct Recorder {
            lost: Mutex<Vec<Frame>>,
        }
        impl LostFrameHandler for Recorder {
            fn on_frame_lost(self: Arc<Self>, frame: Frame) {
                self.lost.lock().unwrap().push(frame);
            }
        }

        let (sender, sink) = sender_with_window(1_000_000);
        let recorder = Arc::new(Recorder {
            lost: Mutex::new(Vec::new()),
        });
        let frame = Frame::Stream(StreamFrame {
            stream_id: 4,
            offset: 0,
            data: vec![1, 2, 3],
            fin: false,
        });
        sender
            .resend_frame(
                frame.clone(),
                EncryptionLevel::Application,
                Some(Arc::clone(&recorder) as Arc<dyn LostFrameHandler>),
            )
            .unwrap();
        settle().await;
        assert_eq!(sink.count(), 1);
        let in_flight = sender.congestion().bytes_in_flight();
        assert!(in_flight > 0);

        sender.declare_lost(PacketId::new(EncryptionLevel::Application, 0));
        assert_eq!(sender.congestion().bytes_in_flight(), 0);
        assert_eq!(*recorder.lost.lock().unwrap(), vec![frame]);
        sender.shutdown();
    }
}
