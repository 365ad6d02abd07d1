use crate::framegen::{FrameGenerator, GenerateFrameError};

use anyhow::bail;
use log::debug;
use vidbuf::capture::FrameSource;

/// Camera producing generated RGB565 frames on demand.
pub struct SyntheticCamera {
    generator: FrameGenerator,
    width: u32,
    height: u32,
    fps: u32,
    streaming: bool,
    /// Number of `start_streaming` calls that fail before the sensor comes up.
    failed_starts: u32,
    /// If not zero, every that many capture attempts find no frame.
    miss_every: u32,
    attempts: u32,
    sequence: u32,
    held: bool,
    frame: Vec<u8>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        let generator = FrameGenerator::rgb565(width as usize, height as usize);
        let frame = vec![0; generator.frame_size()];
        SyntheticCamera {
            generator,
            width,
            height,
            fps: 30,
            streaming: false,
            failed_starts: 0,
            miss_every: 0,
            attempts: 0,
            sequence: 0,
            held: false,
            frame,
        }
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Make the first `count` attempts to start streaming fail.
    pub fn slow_start(mut self, count: u32) -> Self {
        self.failed_starts = count;
        self
    }

    /// Miss one capture every `every` attempts.
    pub fn miss_every(mut self, every: u32) -> Self {
        self.miss_every = every;
        self
    }

    /// Whether a frame is currently held by `acquire_frame`.
    pub fn is_held(&self) -> bool {
        self.held
    }

    fn generate(&mut self) -> Result<(), GenerateFrameError> {
        self.generator.next_frame(&mut self.frame)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }
}

impl FrameSource for SyntheticCamera {
    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn start_streaming(&mut self) -> anyhow::Result<()> {
        if self.failed_starts > 0 {
            self.failed_starts -= 1;
            bail!("sensor is still powering up");
        }
        if !self.streaming {
            debug!("Synthetic camera streaming {}x{}", self.width, self.height);
            self.streaming = true;
        }
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.streaming = false;
        self.held = false;
    }

    fn capture_frame(&mut self) -> bool {
        if !self.streaming || self.held {
            return false;
        }
        self.attempts = self.attempts.wrapping_add(1);
        if self.miss_every > 0 && self.attempts % self.miss_every == 0 {
            return false;
        }
        self.generate().is_ok()
    }

    fn image_data(&self) -> Option<&[u8]> {
        if self.sequence == 0 {
            None
        } else {
            Some(&self.frame)
        }
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn current_sequence(&self) -> u32 {
        self.sequence
    }

    fn acquire_frame(&mut self, since_sequence: u32) -> bool {
        if self.held {
            return false;
        }
        if self.sequence <= since_sequence && !self.capture_frame() {
            return false;
        }
        self.held = true;
        true
    }

    fn release_frame(&mut self) {
        self.held = false;
    }
}
