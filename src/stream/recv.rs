//! Stream input: reassembly of received STREAM frames into a readable
//! byte stream, driving flow-control updates on consumption.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::core::error::StreamError;
use crate::frame::{Frame, StreamFrame};
use crate::packet::EncryptionLevel;
use crate::recovery::LostFrameHandler;
use crate::send::Sender;

use super::flow::ConnectionFlow;

#[derive(Debug)]
struct InputState {
    /// Out-of-order segments keyed by stream offset.
    segments: BTreeMap<u64, Vec<u8>>,
    /// Next offset the reader will consume.
    read_offset: u64,
    /// Total stream length, known once the FIN frame arrives.
    final_offset: Option<u64>,
    aborted: bool,
    /// Receiver flow-control limit; non-decreasing.
    fc_limit: u64,
    /// Limit value last advertised in a MAX_STREAM_DATA frame.
    last_advertised: u64,
}

struct InputShared {
    stream_id: u64,
    state: Mutex<InputState>,
    readable: Notify,
}

/// The receive half of a stream.
pub struct StreamInput {
    shared: Arc<InputShared>,
    sender: Weak<Sender>,
    connection_flow: Arc<ConnectionFlow>,
    /// Advertise a new limit once the delta exceeds this many bytes.
    increment: u64,
    read_timeout: Option<Duration>,
}

impl StreamInput {
    /// Create the input half of `stream_id` with the given initial
    /// receiver flow-control limit.
    pub fn new(
        stream_id: u64,
        sender: &Arc<Sender>,
        connection_flow: Arc<ConnectionFlow>,
        initial_limit: u64,
        increment: u64,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(InputShared {
                stream_id,
                state: Mutex::new(InputState {
                    segments: BTreeMap::new(),
                    read_offset: 0,
                    final_offset: None,
                    aborted: false,
                    fc_limit: initial_limit,
                    last_advertised: initial_limit,
                }),
                readable: Notify::new(),
            }),
            sender: Arc::downgrade(sender),
            connection_flow,
            increment,
            read_timeout,
        }
    }

    /// Insert a received STREAM frame into the reassembly buffer.
    pub fn on_frame(&self, frame: StreamFrame) {
        {
            let mut st = self.shared.state.lock().unwrap();
            if frame.fin {
                st.final_offset = Some(frame.up_to_offset());
            }
            let stale = frame.up_to_offset() <= st.read_offset;
            if !stale && !frame.data.is_empty() {
                // Keep the longer segment when offsets collide.
                let replace = st
                    .segments
                    .get(&frame.offset)
                    .is_none_or(|existing| existing.len() < frame.data.len());
                if replace {
                    st.segments.insert(frame.offset, frame.data);
                }
            }
        }
        self.shared.readable.notify_waiters();
    }

    /// Read contiguously available bytes into `buf`.
    ///
    /// Blocks until bytes are available at the read cursor, the final
    /// offset is reached and consumed (returns `Ok(0)`), the stream is
    /// aborted, or the configured timeout elapses. Consumption advances
    /// the receiver flow-control limit and, past the advertisement
    /// increment, emits a MAX_STREAM_DATA update.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let deadline = self.read_timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // Register for wakeups before inspecting state, so an insert
            // between the check and the await is not missed.
            let notified = self.shared.readable.notified();

            let read_offset;
            {
                let mut st = self.shared.state.lock().unwrap();
                if st.aborted {
                    return Err(StreamError::Aborted(self.shared.stream_id));
                }
                let n = take_contiguous(&mut st, buf);
                if n > 0 {
                    drop(st);
                    self.on_consumed(n as u64);
                    return Ok(n);
                }
                if st.final_offset.is_some_and(|fin| st.read_offset >= fin) {
                    return Ok(0);
                }
                read_offset = st.read_offset;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(StreamError::ReadTimeout(self.shared.stream_id, read_offset));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Bytes contiguously available at the read cursor.
    pub fn available(&self) -> usize {
        let st = self.shared.state.lock().unwrap();
        let mut offset = st.read_offset;
        let mut available = 0usize;
        for (&start, data) in st.segments.range(..) {
            let end = start + data.len() as u64;
            if start > offset {
                break;
            }
            if end > offset {
                available += (end - offset) as usize;
                offset = end;
            }
        }
        available
    }

    /// Abort the stream: any blocked reader wakes with
    /// [`StreamError::Aborted`].
    pub fn abort(&self) {
        self.shared.state.lock().unwrap().aborted = true;
        self.shared.readable.notify_waiters();
    }

    /// Current receiver flow-control limit.
    pub fn flow_limit(&self) -> u64 {
        self.shared.state.lock().unwrap().fc_limit
    }

    /// Slide the flow-control window forward and advertise when due.
    fn on_consumed(&self, bytes: u64) {
        self.connection_flow.on_consumed(bytes);

        let advertise = {
            let mut st = self.shared.state.lock().unwrap();
            st.fc_limit += bytes;
            if st.fc_limit - st.last_advertised > self.increment {
                st.last_advertised = st.fc_limit;
                Some(st.fc_limit)
            } else {
                None
            }
        };
        if let Some(limit) = advertise {
            self.send_max_stream_data(limit);
        }
    }

    fn send_max_stream_data(&self, limit: u64) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        debug!(stream = self.shared.stream_id, limit, "advertising stream flow-control limit");
        let handler: Arc<dyn LostFrameHandler> = Arc::new(MaxStreamDataRetransmit {
            sender: self.sender.clone(),
            shared: Arc::clone(&self.shared),
        });
        let _ = sender.resend_frame(
            Frame::MaxStreamData {
                stream_id: self.shared.stream_id,
                limit,
            },
            EncryptionLevel::Application,
            Some(handler),
        );
    }
}

impl std::fmt::Debug for StreamInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("StreamInput")
            .field("stream_id", &self.shared.stream_id)
            .field("read_offset", &st.read_offset)
            .field("segments", &st.segments.len())
            .field("final_offset", &st.final_offset)
            .finish()
    }
}

/// Copy contiguous bytes at the read cursor into `buf`, pruning consumed
/// segments.
fn take_contiguous(st: &mut InputState, buf: &mut [u8]) -> usize {
    let mut n = 0;
    while n < buf.len() {
        let Some((&start, _)) = st.segments.range(..=st.read_offset).next_back() else {
            break;
        };
        let (copied, consumed) = {
            let data = &st.segments[&start];
            let end = start + data.len() as u64;
            if end <= st.read_offset {
                (0, true)
            } else {
                let skip = (st.read_offset - start) as usize;
                let take = (data.len() - skip).min(buf.len() - n);
                buf[n..n + take].copy_from_slice(&data[skip..skip + take]);
                (take, st.read_offset + take as u64 >= end)
            }
        };
        n += copied;
        st.read_offset += copied as u64;
        if consumed {
            st.segments.remove(&start);
        } else {
            break;
        }
    }
    n
}

/// Re-advertises the current (possibly higher) limit when a
/// MAX_STREAM_DATA frame is lost.
struct MaxStreamDataRetransmit {
    sender: Weak<Sender>,
    shared: Arc<InputShared>,
}

impl LostFrameHandler for MaxStreamDataRetransmit {
    fn on_frame_lost(self: Arc<Self>, frame: Frame) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let limit = self.shared.state.lock().unwrap().fc_limit;
        debug!(%frame, limit, "re-advertising stream flow-control limit after loss");
        let handler = Arc::clone(&self) as Arc<dyn LostFrameHandler>;
        let _ = sender.resend_frame(
            Frame::MaxStreamData {
                stream_id: self.shared.stream_id,
                limit,
            },
            EncryptionLevel::Application,
            Some(handler),
        );
    }
}
