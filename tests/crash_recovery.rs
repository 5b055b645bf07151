//! A writer that dies inside the lock leaves the lock held, the header's write position stale
//! and possibly a half-written excerpt. The next writer must recover all three.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chronicle_rolling::header::{header_word, write_record, RecordHeader};
use chronicle_rolling::queue_lock::{LOCK_KEY, UNLOCKED};
use chronicle_rolling::{
    Clock, LockConfig, LockRecovery, PauseStrategy, QueueConfig, QueueLock, RollCycle,
    RollingQueue, SetClock, Tailer,
};
use tempfile::tempdir;

const DEAD_HOLDER: i64 = 0x7fff_fff0_0000_0002;

fn open(dir: &Path) -> Arc<RollingQueue> {
    RollingQueue::open_with_config(
        dir,
        QueueConfig {
            roll_cycle: RollCycle::TEST4_DAILY,
            segment_size: 256 * 1024,
            lock: LockConfig {
                timeout: Duration::from_millis(100),
                recovery: LockRecovery::default(),
                pause: PauseStrategy::Sleep(Duration::from_millis(1)),
            },
            clock: Arc::new(SetClock::new(0)) as Arc<dyn Clock>,
            ..QueueConfig::default()
        },
    )
    .expect("queue open")
}

fn read_all(tailer: &mut Tailer) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(excerpt) = tailer.reading_document().expect("read") {
        out.push(String::from_utf8(excerpt.into_payload()).expect("utf8"));
    }
    out
}

/// Writes what a writer killed mid-append leaves behind: `committed` excerpts past the
/// published write position, then a claimed but unfinished record. Returns its offset.
fn die_mid_append(queue: &RollingQueue, committed: &[&str]) -> u64 {
    let store = queue
        .store_for_cycle(0, queue.epoch(), false)
        .expect("lookup")
        .expect("segment");
    let mut offset = store.write_position().expect("position").offset;
    for payload in committed {
        offset = write_record(store.bytes(), offset, payload.as_bytes(), false).expect("write");
    }
    header_word(store.bytes(), offset)
        .expect("header")
        .store(
            RecordHeader::InProgress { len: 5, meta: false }.encode(),
            Ordering::Release,
        );
    queue.release(store).expect("release");
    queue
        .table_store()
        .acquire_value_for(LOCK_KEY, UNLOCKED)
        .expect("lock slot")
        .set_value(DEAD_HOLDER)
        .expect("wedge");
    offset
}

#[test]
fn next_writer_recovers_after_a_crash_mid_append() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().expect("tempdir");
    let queue = open(dir.path());
    queue
        .acquire_appender()
        .expect("appender")
        .write_bytes(b"zero")
        .expect("write");
    let torn = die_mid_append(&queue, &["one"]);

    // Readers see the committed excerpt and stop at the torn one.
    let mut tailer = queue.create_tailer().expect("tailer");
    assert_eq!(read_all(&mut tailer), ["zero", "one"]);
    assert_eq!(queue.sequence_count(0).expect("count"), Some(1));

    let index = queue
        .acquire_appender()
        .expect("appender")
        .write_bytes(b"two")
        .expect("write after recovery");
    assert_eq!(index, queue.roll_cycle().to_index(0, 2));
    assert_eq!(queue.sequence_count(0).expect("count"), Some(3));
    assert!(!queue.queue_lock().is_locked().expect("locked"));

    let store = queue
        .store_for_cycle(0, queue.epoch(), false)
        .expect("lookup")
        .expect("segment");
    assert_eq!(store.read_header(torn).expect("header"), RecordHeader::Meta { len: 5 });
    queue.release(store).expect("release");
    assert_eq!(read_all(&mut tailer), ["two"]);
    let mut fresh = queue.create_tailer().expect("tailer");
    assert_eq!(read_all(&mut fresh), ["zero", "one", "two"]);
    assert!(queue.dump().expect("dump").contains("metadata, 5 bytes"));
}

#[test]
fn recovered_excerpts_are_indexed() {
    let dir = tempdir().expect("tempdir");
    let queue = open(dir.path());
    let mut appender = queue.acquire_appender().expect("appender");
    for i in 0..4 {
        appender.write_bytes(format!("m{i}").as_bytes()).expect("write");
    }
    drop(appender);
    // Sequence 4 falls on the index spacing; the dead writer never recorded it.
    die_mid_append(&queue, &["m4"]);

    queue
        .acquire_appender()
        .expect("appender")
        .write_bytes(b"m5")
        .expect("write after recovery");

    let rc = *queue.roll_cycle();
    let mut tailer = queue.create_tailer().expect("tailer");
    for sequence in [4u64, 5] {
        assert!(tailer.move_to_index(rc.to_index(0, sequence)).expect("move"));
        let excerpt = tailer.reading_document().expect("read").expect("excerpt");
        assert_eq!(excerpt.payload(), format!("m{sequence}").as_bytes());
    }
}
