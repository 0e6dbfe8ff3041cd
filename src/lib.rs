//! # Quiver
//!
//! A client-side implementation of the QUIC transport send path: framing,
//! packetization, congestion admission, loss recovery, and the per-stream
//! buffers that feed it.
//!
//! The crate covers everything between "the application wrote bytes /
//! a control frame needs to go out" and "a protected datagram was handed
//! to the socket", plus the acknowledgement machinery that closes the
//! loop:
//!
//! - **Send loop**: one dedicated task drains the outbound queue,
//!   coalesces frames per encryption level, waits for congestion
//!   admission, numbers and protects packets, and emits datagrams in
//!   order.
//! - **Recovery**: an in-flight registry tracks every emission; ACK
//!   processing feeds the RTT estimator and the congestion controller;
//!   CRYPTO-bearing packets carry exponential-backoff retransmission
//!   timers.
//! - **Streams**: output buffers slice application bytes into STREAM
//!   frames sized to the sender's budget; input buffers reassemble,
//!   support blocking reads, and drive flow-control updates.
//!
//! TLS is a collaborator, not a dependency: symmetric keys arrive
//! ready-made per encryption level through
//! [`crypto::ConnectionSecrets`]. Datagram I/O hides behind
//! [`send::DatagramSink`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use quiver::core::TransportConfig;
//! use quiver::crypto::ConnectionSecrets;
//! use quiver::packet::header::ConnectionIds;
//! use quiver::send::{Sender, UdpSink};
//!
//! # async fn run(secrets: ConnectionSecrets, cids: ConnectionIds) -> std::io::Result<()> {
//! let socket = Arc::new(tokio::net::UdpSocket::bind("0.0.0.0:0").await?);
//! socket.connect("198.51.100.7:443").await?;
//!
//! let sender = Arc::new(Sender::new(
//!     TransportConfig::default(),
//!     cids,
//!     Arc::new(UdpSink::new(socket)),
//! ));
//! sender.start(secrets);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod congestion;
pub mod core;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod recovery;
pub mod send;
pub mod stream;
pub mod varint;

/// Convenient imports for typical use.
pub mod prelude {
    pub use crate::congestion::{CongestionAlgorithm, CongestionController, NewRenoController};
    pub use crate::core::{
        FrameError, QuiverError, RegistryError, SendError, StreamError, TransportConfig,
    };
    pub use crate::crypto::{ConnectionSecrets, PacketKeys};
    pub use crate::frame::{AckFrame, CryptoFrame, Frame, StreamFrame};
    pub use crate::packet::header::ConnectionIds;
    pub use crate::packet::{EncryptionLevel, PacketId, QuicPacket, VersionNegotiation};
    pub use crate::recovery::LostFrameHandler;
    pub use crate::send::{DatagramSink, Sender, UdpSink};
    pub use crate::stream::{ConnectionFlow, QuicStream};
}

pub use crate::core::{QuiverError, TransportConfig};
pub use crate::packet::{EncryptionLevel, PacketId, QuicPacket};
pub use crate::send::Sender;
pub use crate::stream::QuicStream;
