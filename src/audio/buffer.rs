//! Audio frames and the bounded capture queue
//!
//! The capture callback pushes into a lock-free ring buffer and never waits;
//! when the sender falls behind, new frames are dropped and counted.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Audio frame containing interleaved samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved audio samples in [-1, 1]
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frame sequence number within its stream
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32, sequence: u32) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
            sequence,
        }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Frame duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples_per_channel() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Lock-free ring buffer for audio frames
pub struct RingBuffer {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame into the buffer
    /// Returns false if buffer is full (the frame is dropped)
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest frame
    pub fn pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    /// Drop everything still queued, returning how many frames were discarded
    pub fn clear(&self) -> usize {
        let mut n = 0;
        while self.queue.pop().is_some() {
            n += 1;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Frames rejected because the buffer was full
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Where a capture source delivers frames: the ring buffer plus a wakeup for
/// the session loop. Both operations are non-blocking.
#[derive(Clone)]
pub struct FrameSink {
    buffer: SharedRingBuffer,
    ready: Arc<Notify>,
}

impl FrameSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(RingBuffer::new(capacity)),
            ready: Arc::new(Notify::new()),
        }
    }

    /// Hand a frame to the sender. Returns false if it was dropped.
    pub fn deliver(&self, frame: AudioFrame) -> bool {
        let accepted = self.buffer.push(frame);
        self.ready.notify_one();
        accepted
    }

    pub fn buffer(&self) -> &SharedRingBuffer {
        &self.buffer
    }

    /// Resolves after the next `deliver`
    pub async fn ready(&self) {
        self.ready.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_basic() {
        let buffer = RingBuffer::new(4);

        assert!(buffer.push(AudioFrame::new(vec![0.0; 480], 1, 16_000, 0)));
        assert!(buffer.push(AudioFrame::new(vec![1.0; 480], 1, 16_000, 1)));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.pop().unwrap().sequence, 0);
        assert_eq!(buffer.pop().unwrap().sequence, 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ring_buffer_drops_when_full() {
        let buffer = RingBuffer::new(2);
        for seq in 0..5 {
            buffer.push(AudioFrame::new(vec![], 1, 16_000, seq));
        }

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.overflow_count(), 3);
        // Oldest frames survive, order is preserved
        assert_eq!(buffer.pop().unwrap().sequence, 0);
        assert_eq!(buffer.pop().unwrap().sequence, 1);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 2400], 1, 24_000, 0);
        assert!((frame.duration() - 0.1).abs() < 1e-12);

        let stereo = AudioFrame::new(vec![0.0; 960], 2, 48_000, 0);
        assert_eq!(stereo.samples_per_channel(), 480);
        assert!((stereo.duration() - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_frame_sink_wakes_reader() {
        let sink = FrameSink::new(4);
        let reader = sink.clone();
        let waiter = tokio::spawn(async move {
            reader.ready().await;
            reader.buffer().pop()
        });

        tokio::task::yield_now().await;
        assert!(sink.deliver(AudioFrame::new(vec![0.5], 1, 16_000, 7)));
        let frame = waiter.await.unwrap().unwrap();
        assert_eq!(frame.sequence, 7);
    }
}
