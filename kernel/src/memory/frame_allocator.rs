// kernel/src/memory/frame_allocator.rs
//
// Physical memory: a fixed pool of 4 KiB frames with reference counts.
//
// A frame is referenced once per page-table entry pointing at it.  It
// returns to the free list when the last mapping goes away, so a
// copy-on-write frame stays alive for as long as either side of a fork
// still maps it.
//
// Frame 0 is never handed out; a zero frame address always means
// "nothing here".

use alloc::{boxed::Box, vec::Vec};

use x86_64::{
    PhysAddr,
    structures::paging::{PhysFrame, Size4KiB},
};

use crate::memlayout::PGSIZE;

type FrameData = Box<[u8; PGSIZE]>;

struct FrameInfo {
    refs: u32,
    data: Option<FrameData>,
}

pub struct FramePool {
    frames: Vec<FrameInfo>,
    free: Vec<usize>,
}

impl FramePool {
    /// A pool of `npages` frames (including the reserved frame 0).
    pub fn new(npages: usize) -> Self {
        let frames = (0..npages.max(1))
            .map(|_| FrameInfo { refs: 0, data: None })
            .collect();
        // Hand out low frames first.
        let free = (1..npages).rev().collect();
        Self { frames, free }
    }

    #[inline]
    fn index(frame: PhysFrame<Size4KiB>) -> usize {
        (frame.start_address().as_u64() / PGSIZE as u64) as usize
    }

    #[inline]
    fn frame_at(index: usize) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new((index * PGSIZE) as u64))
    }

    /// Take a zero-filled frame off the free list.  The caller owns no
    /// reference until it maps the frame (`incref`).
    pub fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let index = self.free.pop()?;
        let info = &mut self.frames[index];
        match info.data.as_mut() {
            Some(data) => data.fill(0),
            None => info.data = Some(Box::new([0u8; PGSIZE])),
        }
        log::trace!("frame: alloc {:#x}", index * PGSIZE);
        Some(Self::frame_at(index))
    }

    pub fn incref(&mut self, frame: PhysFrame<Size4KiB>) {
        if let Some(info) = self.frames.get_mut(Self::index(frame)) {
            info.refs += 1;
        }
    }

    /// Drop one reference; frees the frame when none are left.
    pub fn decref(&mut self, frame: PhysFrame<Size4KiB>) {
        let index = Self::index(frame);
        let Some(info) = self.frames.get_mut(index) else {
            return;
        };
        info.refs = info.refs.saturating_sub(1);
        if info.refs == 0 {
            log::trace!("frame: free {:#x}", index * PGSIZE);
            self.free.push(index);
        }
    }

    /// Give back a frame that was allocated but never mapped.
    pub fn release_unmapped(&mut self, frame: PhysFrame<Size4KiB>) {
        let index = Self::index(frame);
        if self.frames.get(index).is_some_and(|info| info.refs == 0) {
            self.free.push(index);
        }
    }

    pub fn refcount(&self, frame: PhysFrame<Size4KiB>) -> u32 {
        self.frames.get(Self::index(frame)).map_or(0, |info| info.refs)
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Contents of a frame, if it has ever been allocated.
    pub fn data(&self, frame: PhysFrame<Size4KiB>) -> Option<&[u8; PGSIZE]> {
        self.frames.get(Self::index(frame))?.data.as_deref()
    }

    pub fn data_mut(&mut self, frame: PhysFrame<Size4KiB>) -> Option<&mut [u8; PGSIZE]> {
        self.frames.get_mut(Self::index(frame))?.data.as_deref_mut()
    }
}
