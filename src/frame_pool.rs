use crate::error::{Error, Result};
use crate::frame::{Frame, FrameFlags};
use crate::utils::lock;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::time::Duration;

/// Fixed number of equally sized frames shared by every task.
///
/// Allocation never blocks on another task: the slot scan runs under a
/// short critical section. A handed-out frame is exclusively owned by its
/// [`PooledFrame`] until disposed.
#[derive(Debug)]
pub struct FramePool {
    slots: Mutex<Vec<Option<Frame>>>,
    frame_size: usize,
}

impl FramePool {
    pub fn new(frames: usize, frame_size: usize) -> Self {
        let slots = (0..frames)
            .map(|_| Some(Frame::with_capacity(frame_size)))
            .collect();

        Self {
            slots: Mutex::new(slots),
            frame_size,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn capacity(&self) -> usize {
        lock(&self.slots).len()
    }

    /// First free frame, recycled and flagged in use; `NoSpace` if none.
    pub fn allocate(&self) -> Result<PooledFrame<'_>> {
        let mut slots = lock(&self.slots);
        let (slot, entry) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, entry)| entry.is_some())
            .ok_or(Error::NoSpace)?;

        let mut frame = entry.take().ok_or(Error::NoSpace)?;
        frame.recycle();
        frame.set_flags(FrameFlags::IN_USE);

        Ok(PooledFrame {
            frame,
            slot,
            pool: self,
        })
    }

    /// Like [`FramePool::allocate`], with one blocking `delay` and a second
    /// attempt when the pool is exhausted.
    pub fn allocate_retry(&self, delay: Duration) -> Result<PooledFrame<'_>> {
        match self.allocate() {
            Ok(frame) => Ok(frame),
            Err(Error::NoSpace) => {
                std::thread::sleep(delay);
                self.allocate()
            }
            Err(e) => Err(e),
        }
    }

    /// Diagnostic count of frames not currently handed out.
    pub fn free_count(&self) -> usize {
        lock(&self.slots).iter().filter(|entry| entry.is_some()).count()
    }

    fn release(&self, slot: usize, mut frame: Frame) {
        frame.clear_flags(FrameFlags::IN_USE);
        let mut slots = lock(&self.slots);
        if let Some(entry) = slots.get_mut(slot) {
            *entry = Some(frame);
        }
    }
}

/// A frame on loan from a [`FramePool`]; returned on [`PooledFrame::dispose`]
/// or drop.
#[derive(Debug)]
pub struct PooledFrame<'a> {
    frame: Frame,
    slot: usize,
    pool: &'a FramePool,
}

impl PooledFrame<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn dispose(self) {
        drop(self);
    }
}

impl Deref for PooledFrame<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl DerefMut for PooledFrame<'_> {
    fn deref_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }
}

impl Drop for PooledFrame<'_> {
    fn drop(&mut self) {
        let frame = std::mem::replace(&mut self.frame, Frame::with_capacity(0));
        self.pool.release(self.slot, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = FramePool::new(2, 16);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.allocate().unwrap_err(), Error::NoSpace);

        a.dispose();
        assert_eq!(pool.free_count(), 1);
        drop(b);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_allocated_frame_is_recycled() {
        let pool = FramePool::new(1, 8);
        {
            let mut frame = pool.allocate().unwrap();
            frame.put_u32(7).unwrap();
            frame.set_flags(FrameFlags::IS_TRUSTED);
            assert!(frame.flags().contains(FrameFlags::IN_USE));
        }
        let frame = pool.allocate().unwrap();
        assert_eq!(frame.position(), 0);
        assert!(!frame.is_trusted());
    }

    #[test]
    fn test_allocate_retry_picks_up_released_frame() {
        let pool = FramePool::new(1, 8);
        std::thread::scope(|scope| {
            let held = pool.allocate().unwrap();
            scope.spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                held.dispose();
            });

            let frame = pool.allocate_retry(Duration::from_millis(200)).unwrap();
            assert_eq!(frame.slot(), 0);
        });

        let _only = pool.allocate().unwrap();
        assert_eq!(
            pool.allocate_retry(Duration::from_millis(1)).unwrap_err(),
            Error::NoSpace
        );
    }
}
