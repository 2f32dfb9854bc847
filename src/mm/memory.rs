use super::address::{FrameNum, PhysAddr};
use crate::config::PAGE_SIZE;

/// The simulated physical memory: a fixed arena of page frames.
///
/// Frames are addressed by `FrameNum`; all access is bounds checked, so a
/// stale frame number can never reach past the arena.
pub struct PhysMemory {
    bytes: Vec<u8>,
    frames: usize,
}

impl PhysMemory {
    pub fn new(frames: usize) -> Self {
        Self {
            bytes: vec![0; frames * PAGE_SIZE],
            frames,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Returns the byte contents of one frame.
    pub fn frame(&self, frame: FrameNum) -> &[u8] {
        let base = frame.0 * PAGE_SIZE;
        &self.bytes[base..base + PAGE_SIZE]
    }

    /// Returns the byte contents of one frame, mutably.
    pub fn frame_mut(&mut self, frame: FrameNum) -> &mut [u8] {
        let base = frame.0 * PAGE_SIZE;
        &mut self.bytes[base..base + PAGE_SIZE]
    }

    /// Zero a frame. Done on every allocation so a page never leaks the
    /// previous owner's contents.
    pub fn zero(&mut self, frame: FrameNum) {
        self.frame_mut(frame).fill(0);
    }

    /// Copy one frame's contents onto another.
    pub fn copy_frame(&mut self, src: FrameNum, dst: FrameNum) {
        let page: [u8; PAGE_SIZE] = self.frame(src).try_into().unwrap();
        self.frame_mut(dst).copy_from_slice(&page);
    }

    /// Read bytes starting at a physical address. The range must stay within
    /// one frame, matching how callers use resolved page addresses.
    pub fn read(&self, at: PhysAddr, buf: &mut [u8]) {
        assert!(at.page_offset() + buf.len() <= PAGE_SIZE, "read crosses a frame");
        let frame = self.frame(at.frame());
        buf.copy_from_slice(&frame[at.page_offset()..at.page_offset() + buf.len()]);
    }

    /// Write bytes starting at a physical address, within one frame.
    pub fn write(&mut self, at: PhysAddr, buf: &[u8]) {
        assert!(at.page_offset() + buf.len() <= PAGE_SIZE, "write crosses a frame");
        let off = at.page_offset();
        self.frame_mut(at.frame())[off..off + buf.len()].copy_from_slice(buf);
    }
}
