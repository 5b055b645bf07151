//! The writing cursor.
//!
//! Every write takes the queue lock, decides the target cycle, rolls if needed and appends
//! one framed excerpt to the target segment. Excerpts become visible to tailers in every
//! process the moment their header word is committed.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::header::MAX_PAYLOAD_LEN;
use crate::pretoucher::Pretoucher;
use crate::queue::{Direction, RollingQueue, SegmentHandle};
use crate::queue_lock::{LockToken, QueueLock};
use crate::{Error, Result};

pub struct Appender {
    queue: Arc<RollingQueue>,
    store: Option<SegmentHandle>,
    last_index: Option<u64>,
    pretoucher: Option<Pretoucher>,
}

impl Appender {
    pub(crate) fn new(queue: Arc<RollingQueue>) -> Self {
        Self {
            queue,
            store: None,
            last_index: None,
            pretoucher: None,
        }
    }

    pub fn queue(&self) -> &Arc<RollingQueue> {
        &self.queue
    }

    /// Cycle of the segment this appender last wrote to.
    pub fn cycle(&self) -> Option<i32> {
        self.store.as_ref().map(|store| store.cycle())
    }

    /// Index of the last excerpt written through this appender.
    pub fn last_index_appended(&self) -> Option<u64> {
        self.last_index
    }

    /// Appends one excerpt and returns its index.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidState`: the queue is closed
    /// - `Error::LockTimeout`: the queue lock could not be taken
    /// - `Error::PayloadTooLarge` / `Error::SegmentFull` / `Error::CycleFull`
    pub fn write_bytes(&mut self, payload: &[u8]) -> Result<u64> {
        let token = self.lock()?;
        let result = self.append_locked(payload);
        self.unlock(token, result)
    }

    /// Starts an excerpt written through `io::Write`. Nothing is appended until
    /// [`DocumentWriter::commit`]; dropping the writer discards it.
    pub fn writing_document(&mut self) -> DocumentWriter<'_> {
        DocumentWriter {
            appender: self,
            buf: Vec::new(),
        }
    }

    /// Holds the queue lock while `f` writes excerpts through the [`BatchWriter`] it is handed.
    ///
    /// `f` is called repeatedly until it returns `false` or `time_limit` has elapsed. Returns
    /// the number of excerpts written; those written before an error stay committed.
    pub fn batch_append<F>(&mut self, time_limit: Duration, mut f: F) -> Result<u64>
    where
        F: FnMut(&mut BatchWriter<'_>) -> Result<bool>,
    {
        let token = self.lock()?;
        let started = Instant::now();
        let mut batch = BatchWriter {
            appender: self,
            written: 0,
        };
        let result = loop {
            match f(&mut batch) {
                Ok(true) if started.elapsed() < time_limit => {}
                Ok(_) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let written = batch.written;
        self.unlock(token, result.map(|()| written))
    }

    /// Runs one pretouch pass with a pretoucher owned by this appender.
    pub fn pretouch(&mut self) -> Result<()> {
        let queue = &self.queue;
        self.pretoucher
            .get_or_insert_with(|| Pretoucher::new(Arc::clone(queue)))
            .execute()
    }

    fn lock(&self) -> Result<LockToken> {
        self.queue.check_open()?;
        self.queue.queue_lock().acquire_lock()
    }

    fn unlock<T>(&self, token: LockToken, result: Result<T>) -> Result<T> {
        let unlocked = self.queue.queue_lock().unlock(token);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    // ============================================================================
    // Lock held
    // ============================================================================

    fn append_locked(&mut self, payload: &[u8]) -> Result<u64> {
        // Checked before rolling so a rejected excerpt never leaves an empty cycle behind.
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        let mut cycle = self.target_cycle()?;
        loop {
            if self.cycle() != Some(cycle) {
                self.roll_to(cycle)?;
            }
            let Some(store) = self.store.as_ref() else {
                return Err(Error::InvalidState("appender has no segment".to_string()));
            };
            let rc = self.queue.roll_cycle();
            let max_sequence = rc
                .max_messages_per_cycle(store.header().index_count, store.header().index_spacing);
            if let Some(sequence) = store.append(payload, max_sequence)? {
                let index = rc.to_index(cycle, sequence);
                self.last_index = Some(index);
                return Ok(index);
            }
            // Sealed by a roll to a later cycle: writes continue there, never behind it.
            let next = self
                .queue
                .next_cycle(cycle, Direction::Forward)?
                .unwrap_or(cycle + 1);
            log::debug!("cycle {cycle} is sealed, appending to cycle {next}");
            cycle = next;
        }
    }

    /// The cycle of "now", unless a later cycle already holds data (another process with a
    /// clock ahead of ours): writing behind it would break index order.
    fn target_cycle(&self) -> Result<i32> {
        let now = self.queue.cycle();
        match self.queue.last_cycle_opt()? {
            Some(last) if last > now && self.queue.sequence_count(last)?.unwrap_or(0) > 0 => {
                Ok(last)
            }
            _ => Ok(now),
        }
    }

    /// Seals the segments being left behind and switches to `cycle`, creating it if needed.
    fn roll_to(&mut self, cycle: i32) -> Result<()> {
        let last = self.queue.last_cycle_opt()?;
        if let Some(previous) = self.store.take() {
            let sealed = if previous.cycle() < cycle {
                previous.write_eof()
            } else {
                Ok(false)
            };
            self.queue.release(previous)?;
            sealed?;
        }
        // The last cycle may have been left open by another appender or an earlier run.
        if let Some(last) = last.filter(|&last| last < cycle) {
            self.queue.with_store(last, |store| store.write_eof())?;
        }

        let store = self
            .queue
            .store_for_cycle(cycle, self.queue.epoch(), true)?
            .ok_or_else(|| Error::NotFound(format!("segment for cycle {cycle}")))?;
        log::debug!("appender rolled to cycle {cycle} ({})", store.file().display());
        self.store = Some(store);
        Ok(())
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(err) = self.queue.release(store) {
                log::warn!("appender failed to release segment: {err}");
            }
        }
    }
}

/// One excerpt under construction. See [`Appender::writing_document`].
#[must_use = "a document is only appended when committed"]
pub struct DocumentWriter<'a> {
    appender: &'a mut Appender,
    buf: Vec<u8>,
}

impl DocumentWriter<'_> {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends the document and returns its index.
    pub fn commit(self) -> Result<u64> {
        self.appender.write_bytes(&self.buf)
    }
}

impl io::Write for DocumentWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes excerpts while [`Appender::batch_append`] holds the queue lock.
pub struct BatchWriter<'a> {
    appender: &'a mut Appender,
    written: u64,
}

impl BatchWriter<'_> {
    pub fn write(&mut self, payload: &[u8]) -> Result<u64> {
        let index = self.appender.append_locked(payload)?;
        self.written += 1;
        Ok(index)
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}
