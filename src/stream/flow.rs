//! Connection-level flow control.
//!
//! Mirrors the per-stream machinery: consumption slides the connection
//! receive limit forward, and once the delta since the last advertisement
//! exceeds the increment, a MAX_DATA frame goes out. A lost advertisement
//! is replaced with one carrying the current limit.

use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::frame::Frame;
use crate::packet::EncryptionLevel;
use crate::recovery::LostFrameHandler;
use crate::send::Sender;

#[derive(Debug)]
struct FlowState {
    limit: u64,
    last_advertised: u64,
}

/// Connection-wide receive window shared by all streams.
pub struct ConnectionFlow {
    state: Mutex<FlowState>,
    increment: u64,
    sender: Weak<Sender>,
}

impl ConnectionFlow {
    /// Create the connection window with its initial limit.
    pub fn new(sender: &Arc<Sender>, initial_limit: u64, increment: u64) -> Self {
        Self {
            state: Mutex::new(FlowState {
                limit: initial_limit,
                last_advertised: initial_limit,
            }),
            increment,
            sender: Arc::downgrade(sender),
        }
    }

    /// A window with no sender behind it; updates are tracked but never
    /// advertised. Used where the send path is absent.
    pub fn detached(initial_limit: u64, increment: u64) -> Self {
        Self {
            state: Mutex::new(FlowState {
                limit: initial_limit,
                last_advertised: initial_limit,
            }),
            increment,
            sender: Weak::new(),
        }
    }

    /// Slide the window forward by consumed bytes; advertise when due.
    pub fn on_consumed(self: &Arc<Self>, bytes: u64) {
        let advertise = {
            let mut state = self.state.lock().unwrap();
            state.limit += bytes;
            if state.limit - state.last_advertised > self.increment {
                state.last_advertised = state.limit;
                Some(state.limit)
            } else {
                None
            }
        };
        if let Some(limit) = advertise {
            self.send_max_data(limit);
        }
    }

    /// Current connection receive limit.
    pub fn limit(&self) -> u64 {
        self.state.lock().unwrap().limit
    }

    fn send_max_data(self: &Arc<Self>, limit: u64) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        debug!(limit, "advertising connection flow-control limit");
        let handler: Arc<dyn LostFrameHandler> = Arc::new(MaxDataRetransmit {
            sender: self.sender.clone(),
            flow: Arc::clone(self),
        });
        let _ = sender.resend_frame(
            Frame::MaxData(limit),
            EncryptionLevel::Application,
            Some(handler),
        );
    }
}

impl std::fmt::Debug for ConnectionFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ConnectionFlow")
            .field("limit", &state.limit)
            .field("last_advertised", &state.last_advertised)
            .finish()
    }
}

/// Re-advertises the current connection limit when a MAX_DATA frame is
/// lost.
struct MaxDataRetransmit {
    sender: Weak<Sender>,
    flow: Arc<ConnectionFlow>,
}

impl LostFrameHandler for MaxDataRetransmit {
    fn on_frame_lost(self: Arc<Self>, frame: Frame) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let limit = self.flow.limit();
        debug!(%frame, limit, "re-advertising connection flow-control limit after loss");
        let handler = Arc::clone(&self) as Arc<dyn LostFrameHandler>;
        let _ = sender.resend_frame(
            Frame::MaxData(limit),
            EncryptionLevel::Application,
            Some(handler),
        );
    }
}
