//! Test support: frame capture and logging setup.

pub mod packets;

use crate::dataplane::router::{EmittedFrame, FrameSink, SinkError};
use std::sync::Mutex;

/// [`FrameSink`] that records every emitted frame for assertions.
#[derive(Debug, Default)]
pub struct CollectSink {
    frames: Mutex<Vec<EmittedFrame>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything emitted so far.
    pub fn take(&self) -> Vec<EmittedFrame> {
        std::mem::take(&mut self.frames.lock().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().unwrap().is_empty()
    }
}

impl FrameSink for CollectSink {
    fn send_frame(&self, iface: &str, frame: &[u8]) -> Result<(), SinkError> {
        self.frames.lock().unwrap().push(EmittedFrame {
            iface: iface.to_string(),
            frame: frame.to_vec(),
        });
        Ok(())
    }
}

/// Initialize tracing for tests; safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
