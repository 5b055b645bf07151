//! Two OS processes appending to one queue directory.
//!
//! The test binary re-executes itself: `child_writer` does nothing in a normal run and acts as
//! a writer when the environment variables below are set.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chronicle_rolling::{Clock, QueueConfig, QueueLock, RollCycle, RollingQueue, SetClock};
use tempfile::tempdir;

const CHILD_DIR: &str = "CHRONICLE_ROLLING_CHILD_DIR";
const CHILD_TAG: &str = "CHRONICLE_ROLLING_CHILD_TAG";
const PER_CHILD: usize = 500;
const BODY_LEN: usize = 200;
/// Table-store counter of writers currently inside the lock, shared by both children.
const INSIDE_KEY: &str = "test.inside";

fn open(dir: &Path) -> Arc<RollingQueue> {
    RollingQueue::open_with_config(
        dir,
        QueueConfig {
            roll_cycle: RollCycle::TEST4_DAILY,
            segment_size: 4 * 1024 * 1024,
            clock: Arc::new(SetClock::new(0)) as Arc<dyn Clock>,
            ..QueueConfig::default()
        },
    )
    .expect("queue open")
}

fn payload(tag: &str, i: usize) -> Vec<u8> {
    let mut payload = format!("{tag}:{i:05}:").into_bytes();
    payload.extend(std::iter::repeat(tag.as_bytes()[0]).take(BODY_LEN));
    payload
}

#[test]
fn child_writer() {
    let (Ok(dir), Ok(tag)) = (std::env::var(CHILD_DIR), std::env::var(CHILD_TAG)) else {
        return;
    };
    let queue = open(Path::new(&dir));
    let inside = queue
        .table_store()
        .acquire_value_for(INSIDE_KEY, 0)
        .expect("inside counter");
    let mut appender = queue.acquire_appender().expect("appender");
    for i in 0..PER_CHILD {
        appender
            .batch_append(Duration::from_secs(1), |batch| {
                assert_eq!(inside.add_atomic(1)?, 1, "two writers inside the lock");
                batch.write(&payload(&tag, i))?;
                assert_eq!(inside.add_atomic(-1)?, 0);
                Ok(false)
            })
            .expect("batch");
    }
}

#[test]
fn two_processes_append_without_interleaving() {
    let dir = tempdir().expect("tempdir");
    let exe = std::env::current_exe().expect("test binary");
    let children: Vec<_> = ["A", "B"]
        .iter()
        .map(|tag| {
            Command::new(&exe)
                .args(["child_writer", "--exact", "--test-threads=1", "--nocapture"])
                .env(CHILD_DIR, dir.path())
                .env(CHILD_TAG, tag)
                .spawn()
                .expect("spawn child writer")
        })
        .collect();
    for mut child in children {
        let status = child.wait().expect("wait for child");
        assert!(status.success(), "child writer failed: {status}");
    }

    let queue = open(dir.path());
    assert_eq!(queue.entry_count().expect("count"), 2 * PER_CHILD as u64);
    let mut tailer = queue.create_tailer().expect("tailer");
    let mut next = [0usize; 2];
    let mut read = 0;
    while let Some(excerpt) = tailer.reading_document().expect("read") {
        let body = excerpt.payload();
        let tag = std::str::from_utf8(&body[..1]).expect("tag");
        let writer = if tag == "A" { 0 } else { 1 };
        // Whole excerpts only: the body is exactly the writer's byte, nothing of the other's.
        assert_eq!(body, payload(tag, next[writer]).as_slice());
        next[writer] += 1;
        read += 1;
    }
    assert_eq!(read, 2 * PER_CHILD);
    assert_eq!(next, [PER_CHILD, PER_CHILD]);
    assert!(!queue.queue_lock().is_locked().expect("locked"));
}
