//! Page pre-touching ahead of the writer.
//!
//! A page fault on first write to a fresh page of the mapping costs microseconds to
//! milliseconds; the pretoucher takes that hit off the append path by faulting pages in before
//! the writer gets there. It has no thread of its own: an external scheduler calls
//! [`Pretoucher::execute`] periodically.
//!
//! Each pass:
//! 1. Resolves the cycle of "now" (plus `preroll` when early acquisition is enabled). On a
//!    change it releases the old segment and, under the queue lock, acquires (creating if
//!    needed) the new one.
//! 2. Touches every page from where the last pass stopped up to `touch_ahead` bytes beyond
//!    the segment's write position. Progress only moves forward.

use std::sync::Arc;

use crate::mmap::PAGE_SIZE;
use crate::queue::{RollingQueue, SegmentHandle};
use crate::queue_lock::QueueLock;
use crate::{Error, Result};

/// Called after each pass that touched pages, with the cycle and the touched byte range.
pub type ChunkListener = Box<dyn FnMut(i32, u64, u64) + Send>;
/// Called whenever the pretoucher moves to a new cycle.
pub type CycleChangedListener = Box<dyn FnMut(i32) + Send>;

pub struct Pretoucher {
    queue: Arc<RollingQueue>,
    current_cycle: Option<i32>,
    store: Option<SegmentHandle>,
    touched_to: u64,
    chunk_listener: Option<ChunkListener>,
    cycle_listener: Option<CycleChangedListener>,
    shut_down: bool,
}

impl Pretoucher {
    pub fn new(queue: Arc<RollingQueue>) -> Self {
        Self {
            queue,
            current_cycle: None,
            store: None,
            touched_to: 0,
            chunk_listener: None,
            cycle_listener: None,
            shut_down: false,
        }
    }

    pub fn with_chunk_listener(mut self, listener: ChunkListener) -> Self {
        self.chunk_listener = Some(listener);
        self
    }

    pub fn with_cycle_listener(mut self, listener: CycleChangedListener) -> Self {
        self.cycle_listener = Some(listener);
        self
    }

    pub fn current_cycle(&self) -> Option<i32> {
        self.current_cycle
    }

    /// Offset up to which the current segment has been touched.
    pub fn touched_to(&self) -> u64 {
        self.touched_to
    }

    /// Runs one pass.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState`: called after [`Pretoucher::shutdown`]
    /// - `Error::HandlerTerminated`: the queue was closed; the scheduler should stop calling
    ///
    /// Any other failure is logged and retried on the next call.
    pub fn execute(&mut self) -> Result<()> {
        if self.shut_down {
            return Err(Error::InvalidState(
                "pretoucher has been shut down".to_string(),
            ));
        }
        if self.queue.is_closed() {
            self.release_resources();
            return Err(Error::HandlerTerminated);
        }
        let pass = self.assign_current_cycle().and_then(|()| self.touch());
        match pass {
            Ok(()) => Ok(()),
            Err(_) if self.queue.is_closed() => {
                self.release_resources();
                Err(Error::HandlerTerminated)
            }
            Err(err) => {
                log::warn!(
                    "pretouch of {} failed, retrying next pass: {err}",
                    self.queue.path().display()
                );
                Ok(())
            }
        }
    }

    /// Closes the owning queue and releases the current segment.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        self.release_resources();
        self.queue.close();
    }

    fn assign_current_cycle(&mut self) -> Result<()> {
        let config = &self.queue.config().pretouch;
        let mut now = self.queue.clock().now_ms();
        if config.early_acquire_next_cycle {
            now += config.preroll.as_millis() as i64;
        }
        let cycle = self.queue.cycle_at(now);
        if self.current_cycle == Some(cycle) {
            return Ok(());
        }
        self.release_resources();

        let lock = self.queue.queue_lock();
        let token = lock.acquire_lock()?;
        let acquired = self
            .queue
            .store_for_cycle(cycle, self.queue.epoch(), true);
        let unlocked = lock.unlock(token);
        let store = acquired?
            .ok_or_else(|| Error::NotFound(format!("segment for cycle {cycle}")))?;
        if let Err(err) = unlocked {
            self.queue.release(store)?;
            return Err(err);
        }

        let write_offset = store.write_position()?.offset;
        self.touched_to = write_offset - write_offset % PAGE_SIZE as u64;
        log::debug!(
            "pretoucher moved to cycle {cycle} ({})",
            store.file().display()
        );
        self.store = Some(store);
        self.current_cycle = Some(cycle);
        if let Some(listener) = &mut self.cycle_listener {
            listener(cycle);
        }
        Ok(())
    }

    fn touch(&mut self) -> Result<()> {
        let (Some(cycle), Some(store)) = (self.current_cycle, self.store.as_ref()) else {
            return Ok(());
        };
        let map = store.bytes();
        // Only the part the file has grown to can be touched.
        let len = map.refresh_len()? as u64;
        let write_offset = store.write_position()?.offset;
        let target = (write_offset + self.queue.config().pretouch.touch_ahead as u64).min(len);
        let from = self.touched_to;
        if target <= from {
            return Ok(());
        }
        map.advise_will_need(from as usize, (target - from) as usize)?;
        let mut page = from;
        while page < target {
            map.touch_page(page as usize)?;
            page += PAGE_SIZE as u64;
            self.touched_to = page.min(len);
        }
        if let Some(listener) = &mut self.chunk_listener {
            listener(cycle, from, self.touched_to);
        }
        Ok(())
    }

    fn release_resources(&mut self) {
        self.current_cycle = None;
        self.touched_to = 0;
        if let Some(store) = self.store.take() {
            if let Err(err) = self.queue.release(store) {
                log::warn!("pretoucher failed to release segment: {err}");
            }
        }
    }
}

impl Drop for Pretoucher {
    fn drop(&mut self) {
        self.release_resources();
    }
}
