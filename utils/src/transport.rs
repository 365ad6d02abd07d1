use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vidbuf::capture::Transport;

/// A frame sent through a `RecordingTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// Transport keeping a copy of every frame sent through it. Clones share the
/// same record.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    frames: Arc<Mutex<Vec<SentFrame>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn frames(&self) -> MutexGuard<'_, Vec<SentFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, data: &[u8], is_keyframe: bool) -> anyhow::Result<()> {
        self.frames().push(SentFrame {
            data: data.to_vec(),
            is_keyframe,
        });
        Ok(())
    }
}

/// Transport appending frames to a writer, e.g. to save an H.264 elementary
/// stream.
pub struct WriterTransport<W: Write + Send> {
    writer: W,
    bytes_written: usize,
}

impl<W: Write + Send> WriterTransport<W> {
    pub fn new(writer: W) -> Self {
        WriterTransport {
            writer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Transport for WriterTransport<W> {
    fn send(&mut self, data: &[u8], _is_keyframe: bool) -> anyhow::Result<()> {
        self.writer.write_all(data)?;
        self.bytes_written += data.len();
        Ok(())
    }
}
