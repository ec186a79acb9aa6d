//! Delay buffer: a FIFO that holds delayable events for up to `hold`
//! seconds so isolated kernel events can be paired into logical ones
//! (renames, modify bursts) before anything downstream sees them.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::event::{Event, EventMask};

#[derive(Debug)]
struct Entry<T> {
    item: T,
    /// Identity for the head re-check after a timed wait. Replacements get
    /// a fresh sequence number, which restarts a waiting `get`.
    seq: u64,
    ready_at: Instant,
    delayed: bool,
}

#[derive(Debug)]
struct Inner<T> {
    queue: VecDeque<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// Single-consumer FIFO with a fixed hold interval for delayed entries and
/// an in-queue match-and-replace primitive used for pairing.
#[derive(Debug)]
pub struct DelayedQueue<T> {
    hold: Duration,
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
}

impl<T> DelayedQueue<T> {
    pub fn new(hold: Duration) -> DelayedQueue<T> {
        DelayedQueue {
            hold,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                next_seq: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
        }
    }

    pub async fn put(&self, item: T, delayed: bool) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push_back(Entry {
            item,
            seq,
            ready_at: Instant::now() + self.hold,
            delayed,
        });
        self.not_empty.notify_one();
    }

    /// Marks the queue closed and unblocks the consumer. Entries already
    /// queued are still drained.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.not_empty.notify_one();
    }

    /// Removes and returns the head, waiting for its hold to elapse if the
    /// entry was enqueued delayed. Returns `None` once the queue is closed
    /// and drained.
    ///
    /// The head is observed, waited on without the lock, and then re-checked
    /// by sequence number: `remove_if`/`replace_if` may have displaced it
    /// during the wait, in which case the wait restarts on the new head.
    pub async fn get(&self) -> Option<T> {
        loop {
            let (seq, ready_at, delayed) = loop {
                let notified = self.not_empty.notified();
                {
                    let inner = self.inner.lock().await;
                    if let Some(head) = inner.queue.front() {
                        break (head.seq, head.ready_at, head.delayed);
                    }
                    if inner.closed {
                        return None;
                    }
                }
                notified.await;
            };

            if delayed {
                tokio::time::sleep_until(ready_at).await;
            }

            let mut inner = self.inner.lock().await;
            match inner.queue.front() {
                Some(head) if head.seq == seq => {
                    return Some(inner.queue.pop_front().expect("head observed").item);
                }
                Some(_) => continue,
                None if inner.closed => return None,
                None => continue,
            }
        }
    }

    /// Removes and returns the first entry matching `predicate`, ignoring
    /// delay state.
    pub async fn remove_if(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock().await;
        let pos = inner.queue.iter().position(|e| predicate(&e.item))?;
        let entry = inner.queue.remove(pos).expect("position in range");
        self.not_empty.notify_one();
        Some(entry.item)
    }

    /// Replaces the first entry matching `predicate` in place. The
    /// replacement becomes immediately ready: a completed pairing must not
    /// sit out the remainder of its hold.
    pub async fn replace_if(
        &self,
        mut predicate: impl FnMut(&T) -> bool,
        replace: impl FnOnce(&T) -> T,
    ) -> Option<T>
    where
        T: Clone,
    {
        let mut inner = self.inner.lock().await;
        let pos = inner.queue.iter().position(|e| predicate(&e.item))?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = inner.queue.get_mut(pos).expect("position in range");
        let replacement = replace(&entry.item);
        entry.item = replacement.clone();
        entry.delayed = false;
        entry.seq = seq;
        self.not_empty.notify_one();
        Some(replacement)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

/// The coalescing front of the delay buffer: pairs `MOVED_FROM`/`MOVED_TO`
/// by cookie, promotes the first of a modify burst to `EX_BEGIN_MODIFY` and
/// marks followers with `EX_IN_MODIFY`, and applies the timeout promotions
/// on the way out.
#[derive(Debug)]
pub struct EventBuffer {
    queue: DelayedQueue<Event>,
}

impl EventBuffer {
    pub fn new(hold: Duration) -> EventBuffer {
        EventBuffer {
            queue: DelayedQueue::new(hold),
        }
    }

    fn wants_delay(event: &Event) -> bool {
        let mask = event.mask;
        (mask.intersects(EventMask::MOVED_FROM) && !mask.intersects(EventMask::RENAME))
            || (mask.intersects(EventMask::MODIFY) && !mask.intersects(EventMask::IN_MODIFY))
    }

    /// Coalesces one raw batch in order and enqueues the results. Unpaired
    /// `MOVED_FROM` and unmarked `MODIFY` events are held back for pairing.
    pub async fn push_batch(&self, batch: Vec<Event>) {
        for event in self.coalesce(batch).await {
            let delayed = Self::wants_delay(&event);
            self.queue.put(event, delayed).await;
        }
    }

    async fn coalesce(&self, batch: Vec<Event>) -> Vec<Event> {
        let mut grouped: Vec<Event> = Vec::new();
        for event in batch {
            let lsb = event.mask.lowest();
            if lsb == EventMask::MOVED_TO {
                let cookie = event.cookie;
                let check = |e: &Event| {
                    e.mask.lowest() == EventMask::MOVED_FROM && e.cookie == cookie
                };
                let pair = |e: &Event| {
                    e.derive(
                        EventMask::RENAME | EventMask::MOVED_TO,
                        Some(event.src_path.clone()),
                    )
                };
                if let Some(pos) = grouped.iter().position(|e| check(e)) {
                    let paired = pair(&grouped[pos]);
                    grouped[pos] = paired;
                    continue;
                }
                if self.queue.replace_if(check, pair).await.is_some() {
                    continue;
                }
                // Destination without a visible source: the file appeared.
                grouped.push(event.derive(EventMask::CREATE, None));
            } else if lsb == EventMask::MODIFY
                && !event.mask.intersects(EventMask::IN_MODIFY)
            {
                let path = event.src_path.clone();
                let check = |e: &Event| {
                    e.mask.lowest() == EventMask::MODIFY
                        && !e.mask.intersects(EventMask::IN_MODIFY)
                        && e.src_path == path
                };
                let mark = |e: &Event| e.derive(EventMask::IN_MODIFY, None);
                if let Some(pos) = grouped.iter().position(|e| check(e)) {
                    let marked = mark(&grouped[pos]);
                    grouped[pos] = marked;
                    grouped.push(event);
                } else if self.queue.replace_if(check, mark).await.is_some() {
                    grouped.push(event);
                } else {
                    grouped.push(event.derive(EventMask::BEGIN_MODIFY, None));
                }
            } else {
                grouped.push(event);
            }
        }
        grouped
    }

    /// Next logical event, applying the two timeout promotions: a
    /// `MOVED_FROM` that outlived its hold unpaired is a delete; a `MODIFY`
    /// that was never followed up ends its burst.
    pub async fn next(&self) -> Option<Event> {
        let event = self.queue.get().await?;
        let mask = event.mask;
        if mask.intersects(EventMask::MOVED_FROM) && !mask.intersects(EventMask::RENAME) {
            Some(event.derive(EventMask::DELETE, None))
        } else if mask.intersects(EventMask::MODIFY) && !mask.intersects(EventMask::IN_MODIFY) {
            Some(event.derive(EventMask::END_MODIFY, None))
        } else {
            Some(event)
        }
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}
