//! Stream output: per-stream byte queues that serialize into STREAM
//! frames on demand.
//!
//! Writes append to the queue and arm a single send request with the
//! sender; the producer callback runs on the send task and drains the
//! queue into a frame sized to whatever budget the sender offers. Lost
//! frames are re-enqueued verbatim.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::core::error::StreamError;
use crate::frame::{Frame, StreamFrame};
use crate::packet::EncryptionLevel;
use crate::recovery::LostFrameHandler;
use crate::send::Sender;

/// Minimum budget worth offering a STREAM frame producer: type byte,
/// worst-case stream id and offset varints, length field, one data byte.
pub const MIN_STREAM_FRAME_SIZE: usize = 1 + 8 + 8 + 2 + 1;

#[derive(Debug, Default)]
struct OutputState {
    /// Buffers queued for sending, in write order. The front buffer's
    /// first byte is the next byte of the stream to serialize.
    queue: VecDeque<Vec<u8>>,
    /// Offset of the next byte not yet handed to a STREAM frame. Advanced
    /// only on the send task.
    current_offset: u64,
    /// close() was called: emit FIN once the queue drains.
    end_queued: bool,
    /// The FIN frame has been produced.
    fin_emitted: bool,
    /// A send request is already queued with the sender.
    request_pending: bool,
    /// No further writes are accepted.
    closed: bool,
}

/// The send half of a stream.
pub struct StreamOutput {
    stream_id: u64,
    state: Arc<Mutex<OutputState>>,
    sender: Weak<Sender>,
}

impl StreamOutput {
    /// Create the output half of `stream_id`, feeding `sender`.
    pub fn new(stream_id: u64, sender: &Arc<Sender>) -> Self {
        Self {
            stream_id,
            state: Arc::new(Mutex::new(OutputState::default())),
            sender: Arc::downgrade(sender),
        }
    }

    /// Append `data` to the stream.
    ///
    /// Non-blocking: bytes are queued and serialized by the send task.
    /// Fails with [`StreamError::Closed`] after [`close`](Self::close).
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        let arm = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(StreamError::Closed(self.stream_id));
            }
            state.queue.push_back(data.to_vec());
            if state.request_pending {
                false
            } else {
                state.request_pending = true;
                true
            }
        };
        if arm {
            self.arm_send_request();
        }
        Ok(())
    }

    /// No-op: queued data is always dispatched as soon as the sender
    /// allows. Fails once the stream is closed.
    pub fn flush(&self) -> Result<(), StreamError> {
        if self.state.lock().unwrap().closed {
            return Err(StreamError::Closed(self.stream_id));
        }
        Ok(())
    }

    /// Close the send side: remaining bytes go out, the last frame
    /// carries FIN.
    pub fn close(&self) {
        let arm = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.end_queued = true;
            if state.request_pending {
                false
            } else {
                state.request_pending = true;
                true
            }
        };
        if arm {
            self.arm_send_request();
        }
    }

    /// Offset of the next byte not yet serialized into a frame.
    pub fn send_offset(&self) -> u64 {
        self.state.lock().unwrap().current_offset
    }

    fn arm_send_request(&self) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let stream_id = self.stream_id;
        let state = Arc::clone(&self.state);
        let handler: Arc<dyn LostFrameHandler> = Arc::new(StreamFrameRetransmit {
            sender: self.sender.clone(),
        });
        let producer = {
            let sender = self.sender.clone();
            Box::new(move |max_frame_size: usize| {
                produce_frame(&state, stream_id, max_frame_size, &sender)
            })
        };
        if sender
            .send_frame(
                producer,
                MIN_STREAM_FRAME_SIZE,
                EncryptionLevel::Application,
                Some(handler),
            )
            .is_err()
        {
            // Connection closed under us; drop the pending flag so a later
            // writer sees a consistent state.
            self.state.lock().unwrap().request_pending = false;
        }
    }
}

impl std::fmt::Debug for StreamOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("StreamOutput")
            .field("stream_id", &self.stream_id)
            .field("offset", &state.current_offset)
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Build one STREAM frame from the queue, re-arming the request when data
/// remains. Runs on the send task.
fn produce_frame(
    state: &Arc<Mutex<OutputState>>,
    stream_id: u64,
    max_frame_size: usize,
    sender: &Weak<Sender>,
) -> Option<Frame> {
    let mut st = state.lock().unwrap();

    let fin_due = st.end_queued && !st.fin_emitted;
    if st.queue.is_empty() && !fin_due {
        st.request_pending = false;
        return None;
    }

    let overhead = StreamFrame::header_overhead(stream_id, st.current_offset);
    if max_frame_size <= overhead {
        // Budget too small this round (packet shared with other frames);
        // try again with a fresh packet.
        rearm(state, &mut st, stream_id, sender);
        return None;
    }
    let cap = max_frame_size - overhead;

    let mut data = Vec::new();
    while data.len() < cap {
        let Some(front) = st.queue.front_mut() else {
            break;
        };
        let take = front.len().min(cap - data.len());
        data.extend_from_slice(&front[..take]);
        if take == front.len() {
            st.queue.pop_front();
        } else {
            front.drain(..take);
        }
    }

    let fin = st.end_queued && st.queue.is_empty();
    if fin {
        st.fin_emitted = true;
    }
    let frame = StreamFrame {
        stream_id,
        offset: st.current_offset,
        data,
        fin,
    };
    st.current_offset += frame.data.len() as u64;

    if st.queue.is_empty() && !(st.end_queued && !st.fin_emitted) {
        st.request_pending = false;
    } else {
        rearm(state, &mut st, stream_id, sender);
    }
    Some(Frame::Stream(frame))
}

fn rearm(
    state: &Arc<Mutex<OutputState>>,
    st: &mut OutputState,
    stream_id: u64,
    sender: &Weak<Sender>,
) {
    let Some(strong) = sender.upgrade() else {
        st.request_pending = false;
        return;
    };
    st.request_pending = true;
    let state = Arc::clone(state);
    let weak = sender.clone();
    let handler: Arc<dyn LostFrameHandler> = Arc::new(StreamFrameRetransmit {
        sender: weak.clone(),
    });
    let producer = Box::new(move |max_frame_size: usize| {
        produce_frame(&state, stream_id, max_frame_size, &weak)
    });
    if strong
        .send_frame(
            producer,
            MIN_STREAM_FRAME_SIZE,
            EncryptionLevel::Application,
            Some(handler),
        )
        .is_err()
    {
        st.request_pending = false;
    }
}

/// Re-enqueues a lost STREAM frame verbatim (same offset and data); the
/// replacement is ack-eliciting by nature.
struct StreamFrameRetransmit {
    sender: Weak<Sender>,
}

impl LostFrameHandler for StreamFrameRetransmit {
    fn on_frame_lost(self: Arc<Self>, frame: Frame) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        debug!(%frame, "re-queueing lost stream frame");
        let handler = Arc::clone(&self) as Arc<dyn LostFrameHandler>;
        let _ = sender.resend_frame(frame, EncryptionLevel::Application, Some(handler));
    }
}
