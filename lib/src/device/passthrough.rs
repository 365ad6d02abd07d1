//! Virtual device copying frames from its `Output` queue to its `Capture`
//! queue unchanged. Useful to exercise the buffer exchange protocol without
//! any processing cost.
use super::m2m::{EngineError, FrameEngine, FrameKind, M2mDevice};
use crate::{Format, PixelFormat};

const FORMATS: [PixelFormat; 6] = [
    PixelFormat::RGB565,
    PixelFormat::RGB24,
    PixelFormat::YUV420,
    PixelFormat::SBGGR8,
    PixelFormat::JPEG,
    PixelFormat::H264,
];

#[derive(Debug, Default)]
pub struct CopyEngine;

impl FrameEngine for CopyEngine {
    fn driver(&self) -> &'static str {
        "vidbuf_passthrough"
    }

    fn card(&self) -> &'static str {
        "Passthrough device"
    }

    fn output_formats(&self) -> &[PixelFormat] {
        &FORMATS
    }

    fn capture_formats(&self) -> &[PixelFormat] {
        &FORMATS
    }

    fn capture_format_for(&self, _requested: PixelFormat, output: &Format) -> PixelFormat {
        output.pixelformat
    }

    fn capture_size(&self, output: &Format) -> usize {
        match output.sizeimage {
            // Compressed formats have no fixed size.
            0 => output.width as usize * output.height as usize * 2,
            size => size as usize,
        }
    }

    fn process(
        &mut self,
        input: &[u8],
        _format: &Format,
        output: &mut Vec<u8>,
    ) -> Result<FrameKind, EngineError> {
        output.extend_from_slice(input);
        Ok(FrameKind::Key)
    }
}

pub type PassthroughDevice = M2mDevice<CopyEngine>;

impl M2mDevice<CopyEngine> {
    pub fn new() -> Self {
        Self::with_engine(CopyEngine)
    }
}

impl Default for M2mDevice<CopyEngine> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{QBuffer, VideoDevice};
    use crate::memory::{MemoryType, Placement};
    use crate::pool::{BufferPool, DEFAULT_ALIGNMENT};
    use crate::QueueDirection;

    #[test]
    fn test_capture_follows_output() {
        let device = PassthroughDevice::new();
        device
            .set_format(
                QueueDirection::Output,
                &Format::from((PixelFormat::YUV420, (8, 8))),
            )
            .unwrap();
        let capture = device.get_format(QueueDirection::Capture).unwrap();
        assert_eq!(capture.pixelformat, PixelFormat::YUV420);
        assert_eq!(capture.sizeimage, 96);

        // Requesting another format on the capture queue is ignored.
        let capture = device
            .set_format(
                QueueDirection::Capture,
                &Format::from((PixelFormat::JPEG, (8, 8))),
            )
            .unwrap();
        assert_eq!(capture.pixelformat, PixelFormat::YUV420);
    }

    #[test]
    fn test_copy() {
        let device = PassthroughDevice::new();
        device.init().unwrap();
        device
            .set_format(
                QueueDirection::Output,
                &Format::from((PixelFormat::SBGGR8, (4, 4))),
            )
            .unwrap();
        let pools = [QueueDirection::Output, QueueDirection::Capture].map(|direction| {
            device
                .request_buffers(direction, 2, MemoryType::UserPtr)
                .unwrap();
            BufferPool::new(
                2,
                16,
                DEFAULT_ALIGNMENT,
                Placement::Internal,
                MemoryType::UserPtr,
            )
            .unwrap()
        });
        device.start(QueueDirection::Output).unwrap();
        device.start(QueueDirection::Capture).unwrap();

        let input = pools[0].claim_free().unwrap();
        let data = (0u8..16).collect::<Vec<_>>();
        input.write_clamped(&data);
        let output = pools[1].claim_free().unwrap();
        device
            .enqueue(QueueDirection::Output, QBuffer::userptr(input, 16))
            .unwrap();
        device
            .enqueue(QueueDirection::Capture, QBuffer::userptr(output, 0))
            .unwrap();

        let dq = device.dequeue(QueueDirection::Capture, None).unwrap();
        assert_eq!(dq.bytes_used, 16);
        assert_eq!(dq.sequence, 0);
        let memory = dq.memory.unwrap();
        assert_eq!(&*memory.data(), data.as_slice());
    }
}
