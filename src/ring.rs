//! Lock-free single-writer history buffer for routed client audio.
//!
//! Unlike a FIFO there is no read index: readers address samples relative to
//! the latest write, so any number of destination mixes can look at the same
//! source history without coordinating with each other or with the writer.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Channels stored per frame. Routing is stereo only.
pub const ROUTING_CHANNELS: usize = 2;

/// Circular store of the most recent stereo frames written by one client.
///
/// Samples are kept as `f32` bit patterns in relaxed atomics so that a reader
/// racing the writer on a wrapped slot sees either the old or the new value,
/// never a torn one. Visibility of a completed block is carried by the
/// release/acquire pair on `write_pos`.
pub struct RoutingBuffer {
    data: Box<[AtomicU32]>,
    capacity_frames: usize,
    write_pos: AtomicU64,
}

impl RoutingBuffer {
    /// Allocate a zeroed buffer holding `capacity_frames` stereo frames.
    pub fn new(capacity_frames: usize) -> Self {
        let capacity_frames = capacity_frames.max(1);
        let data = (0..capacity_frames * ROUTING_CHANNELS)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect();
        Self {
            data,
            capacity_frames,
            write_pos: AtomicU64::new(0),
        }
    }

    /// Total capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Frames written since allocation.
    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Append `frame_count` interleaved stereo frames from `samples`.
    ///
    /// Only the owning client's IO cycle may call this. If `samples` is shorter
    /// than `frame_count` frames, only the complete frames it holds are written.
    /// Returns the number of frames written.
    pub fn store_frames(&self, samples: &[f32], frame_count: usize) -> usize {
        let frames = frame_count.min(samples.len() / ROUTING_CHANNELS);
        if frames == 0 {
            return 0;
        }

        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let capacity = self.capacity_frames as u64;
        // Older frames would be overwritten within this same call anyway.
        let skip = frames.saturating_sub(self.capacity_frames);
        for frame in skip..frames {
            let slot = ((write_pos + frame as u64) % capacity) as usize * ROUTING_CHANNELS;
            let src = frame * ROUTING_CHANNELS;
            for channel in 0..ROUTING_CHANNELS {
                self.data[slot + channel].store(samples[src + channel].to_bits(), Ordering::Relaxed);
            }
        }

        self.write_pos
            .store(write_pos + frames as u64, Ordering::Release);
        frames
    }

    /// Read one sample `sample_offset` frames back from the latest write.
    ///
    /// An offset of `1` is the newest frame. Returns silence for an unknown
    /// channel, for offset `0`, for offsets reaching before the first write,
    /// and for offsets older than the buffer retains.
    pub fn fetch(&self, channel: usize, sample_offset: u64) -> f32 {
        if channel >= ROUTING_CHANNELS {
            return 0.0;
        }
        let write_pos = self.write_pos.load(Ordering::Acquire);
        if sample_offset == 0
            || sample_offset > write_pos
            || sample_offset > self.capacity_frames as u64
        {
            return 0.0;
        }
        let frame = ((write_pos - sample_offset) % self.capacity_frames as u64) as usize;
        f32::from_bits(self.data[frame * ROUTING_CHANNELS + channel].load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for RoutingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingBuffer")
            .field("capacity_frames", &self.capacity_frames)
            .field("write_pos", &self.write_position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ramp(frames: usize, start: f32) -> Vec<f32> {
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let value = start + i as f32;
            samples.push(value);
            samples.push(-value);
        }
        samples
    }

    #[test]
    fn offsets_address_history_from_newest() {
        let ring = RoutingBuffer::new(64);
        let frames = 16;
        ring.store_frames(&ramp(frames, 0.0), frames);

        for k in 1..=frames as u64 {
            let expected = (frames as u64 - k) as f32;
            assert_eq!(ring.fetch(0, k), expected, "left at offset {k}");
            assert_eq!(ring.fetch(1, k), -expected, "right at offset {k}");
        }
    }

    #[test]
    fn insufficient_history_is_silent() {
        let ring = RoutingBuffer::new(64);
        assert_eq!(ring.fetch(0, 1), 0.0);
        ring.store_frames(&ramp(4, 1.0), 4);
        assert_eq!(ring.fetch(0, 5), 0.0);
        assert_eq!(ring.fetch(0, 0), 0.0);
        assert_eq!(ring.fetch(0, 4), 1.0);
    }

    #[test]
    fn out_of_range_channel_is_silent() {
        let ring = RoutingBuffer::new(8);
        ring.store_frames(&ramp(4, 1.0), 4);
        assert_eq!(ring.fetch(2, 1), 0.0);
    }

    #[test]
    fn wraparound_keeps_latest_frames() {
        let ring = RoutingBuffer::new(8);
        ring.store_frames(&ramp(6, 0.0), 6);
        ring.store_frames(&ramp(6, 6.0), 6);
        assert_eq!(ring.write_position(), 12);
        assert_eq!(ring.fetch(0, 1), 11.0);
        assert_eq!(ring.fetch(0, 8), 4.0);
        // Older than the retained window.
        assert_eq!(ring.fetch(0, 9), 0.0);
    }

    #[test]
    fn oversized_block_keeps_its_tail() {
        let ring = RoutingBuffer::new(4);
        ring.store_frames(&ramp(10, 0.0), 10);
        assert_eq!(ring.write_position(), 10);
        assert_eq!(ring.fetch(0, 1), 9.0);
        assert_eq!(ring.fetch(0, 4), 6.0);
    }

    #[test]
    fn short_slice_writes_whole_frames_only() {
        let ring = RoutingBuffer::new(8);
        let written = ring.store_frames(&[0.5, 0.5, 0.25], 4);
        assert_eq!(written, 1);
        assert_eq!(ring.write_position(), 1);
    }

    #[test]
    fn concurrent_reader_never_sees_unwritten_blocks() {
        let ring = Arc::new(RoutingBuffer::new(256));
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let block = vec![1.0f32; 64 * 2];
                for _ in 0..2_000 {
                    ring.store_frames(&block, 64);
                }
            })
        };
        for _ in 0..10_000 {
            let value = ring.fetch(0, 1);
            assert!(value == 0.0 || value == 1.0);
            if ring.write_position() > 0 {
                assert_eq!(ring.fetch(1, 1), 1.0);
            }
        }
        writer.join().unwrap();
    }
}
