use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::registry::{SessionTransport, TransportError};

/// Records every frame written to it. Clones share the frame buffer, so a
/// test can keep inspecting frames after the transport moves into the
/// registry.
#[derive(Clone, Default)]
pub(crate) struct RecordingTransport {
    pub(crate) frames: Arc<Mutex<Vec<Bytes>>>,
    fail: bool,
}

impl RecordingTransport {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionTransport for RecordingTransport {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::new(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write on closed transport",
            )));
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}
