use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vidbuf::capture::DisplaySurface;
use vidbuf::pool::BufferHandle;
use vidbuf::PixelFormat;

/// A frame shown on a `RecordingDisplay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedFrame {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// Display keeping a copy of every frame presented to it. Clones share the
/// same record, so one can be given to a capture loop and the other kept for
/// inspection.
#[derive(Clone, Default)]
pub struct RecordingDisplay {
    frames: Arc<Mutex<Vec<PresentedFrame>>>,
    /// Number of frames kept; older ones are discarded. 0 keeps them all.
    limit: usize,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Default::default()
    }

    /// Only keep the last `limit` frames.
    pub fn with_limit(limit: usize) -> Self {
        RecordingDisplay {
            frames: Default::default(),
            limit,
        }
    }

    pub fn frames(&self) -> MutexGuard<'_, Vec<PresentedFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last(&self) -> Option<PresentedFrame> {
        self.frames().last().cloned()
    }
}

impl DisplaySurface for RecordingDisplay {
    fn present(
        &mut self,
        buffer: &BufferHandle,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> anyhow::Result<()> {
        let frame = PresentedFrame {
            index: buffer.index(),
            width,
            height,
            format,
            data: buffer.data().to_vec(),
        };
        let mut frames = self.frames();
        if self.limit > 0 && frames.len() >= self.limit {
            frames.remove(0);
        }
        frames.push(frame);
        Ok(())
    }
}
