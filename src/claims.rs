//! Claim ingestion: nickname validation, query-string extraction, and
//! the bounded deadline-aware queue between HTTP workers and the
//! database consumer.

use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::lifecycle::Notification;

/// Maximum nickname length in bytes.
pub const NICK_MAX: usize = 40;
/// Capacity of the pending-claims ring.
pub const QUEUE_MAX: usize = 800;

/// One pending land claim: ownership of a /24 block at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub ip: u32,
    pub nick: String,
    pub created: i64,
}

/// Returns true iff `s` is a registrable nickname: 1..=40 bytes drawn
/// from `[A-Za-z0-9@/:.^+!_*-]`.
pub fn is_valid_nick(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= NICK_MAX
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'@' | b'/' | b':' | b'.' | b'^' | b'+' | b'!' | b'-' | b'_' | b'*'
                )
        })
}

/// Extracts the first valid `name=` value from a request query string.
/// `+` decodes to a space and stray percent-escapes are tolerated, so
/// whatever survives decoding still has to pass [`is_valid_nick`].
pub fn nick_from_query(query: &str) -> Option<String> {
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == "name" && is_valid_nick(&value) {
            return Some(value.into_owned());
        }
    }
    None
}

struct Ring {
    pos: usize,
    count: usize,
    slots: Vec<Option<Claim>>,
}

/// Bounded FIFO of pending claims.
///
/// Producers block on `non_full` with an absolute deadline and the
/// shutdown notification as a cancellation token; the consumer blocks on
/// `non_empty` with the terminate notification. Notifying a token does
/// not wake sleepers by itself; the server's notify paths call
/// [`ClaimQueue::interrupt`] right after.
pub struct ClaimQueue {
    ring: Mutex<Ring>,
    non_full: Condvar,
    non_empty: Condvar,
}

impl ClaimQueue {
    pub fn new() -> ClaimQueue {
        ClaimQueue::with_capacity(QUEUE_MAX)
    }

    pub fn with_capacity(cap: usize) -> ClaimQueue {
        assert!(cap > 0, "claim queue capacity must be positive");
        ClaimQueue {
            ring: Mutex::new(Ring {
                pos: 0,
                count: 0,
                slots: (0..cap).map(|_| None).collect(),
            }),
            non_full: Condvar::new(),
            non_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue `claim`, blocking while the ring is full until `deadline`.
    /// Returns false on timeout or once `cancel` has fired.
    pub fn enqueue(&self, claim: Claim, deadline: Instant, cancel: &Notification) -> bool {
        let mut ring = self.ring.lock();
        while ring.count == ring.slots.len() {
            if cancel.is_notified() {
                break;
            }
            if self.non_full.wait_until(&mut ring, deadline).timed_out() {
                break;
            }
        }
        if ring.count == ring.slots.len() {
            return false;
        }
        let cap = ring.slots.len();
        let idx = (ring.pos + ring.count) % cap;
        ring.slots[idx] = Some(claim);
        ring.count += 1;
        let wake = ring.count == 1;
        drop(ring);
        if wake {
            self.non_empty.notify_all();
        }
        true
    }

    /// Drain up to `max` claims in FIFO order, blocking while empty
    /// until `deadline` (forever when `None`). An empty batch means the
    /// wait timed out or `cancel` fired.
    pub fn dequeue_batch(
        &self,
        max: usize,
        deadline: Option<Instant>,
        cancel: &Notification,
    ) -> Vec<Claim> {
        let mut ring = self.ring.lock();
        while ring.count == 0 {
            if cancel.is_notified() {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.non_empty.wait_until(&mut ring, deadline).timed_out() {
                        break;
                    }
                }
                None => self.non_empty.wait(&mut ring),
            }
        }
        self.drain(&mut ring, max)
    }

    fn drain(&self, ring: &mut MutexGuard<'_, Ring>, max: usize) -> Vec<Claim> {
        let cap = ring.slots.len();
        let was_full = ring.count == cap;
        let mut out = Vec::with_capacity(max.min(ring.count));
        while out.len() < max && ring.count > 0 {
            let pos = ring.pos;
            let claim = ring.slots[pos].take().expect("counted slot is occupied");
            out.push(claim);
            ring.pos = (pos + 1) % cap;
            ring.count -= 1;
        }
        if was_full && !out.is_empty() {
            self.non_full.notify_all();
        }
        out
    }

    /// Wake every blocked producer and consumer so they can observe a
    /// freshly notified cancellation token.
    pub fn interrupt(&self) {
        let _ring = self.ring.lock();
        self.non_full.notify_all();
        self.non_empty.notify_all();
    }
}

impl Default for ClaimQueue {
    fn default() -> ClaimQueue {
        ClaimQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn claim(n: u32) -> Claim {
        Claim {
            ip: n,
            nick: format!("nick{n}"),
            created: 1_700_000_000 + i64::from(n),
        }
    }

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn accepts_exactly_valid_nicks() {
        assert!(is_valid_nick("Alice"));
        assert!(is_valid_nick("a"));
        assert!(is_valid_nick("user@host/path:8.1^x+y!z-w_v*"));
        assert!(is_valid_nick(&"x".repeat(40)));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick(&"x".repeat(41)));
        assert!(!is_valid_nick("bob$"));
        assert!(!is_valid_nick("two words"));
        assert!(!is_valid_nick("naïve"));
        assert!(!is_valid_nick("tab\there"));
    }

    #[test]
    fn extracts_name_from_query() {
        assert_eq!(nick_from_query("name=Alice").as_deref(), Some("Alice"));
        assert_eq!(nick_from_query("x=1&name=bob&y=2").as_deref(), Some("bob"));
        assert_eq!(nick_from_query("name=a%40b").as_deref(), Some("a@b"));
        // '+' is a space, which the nickname alphabet rejects
        assert_eq!(nick_from_query("name=two+words"), None);
        assert_eq!(nick_from_query("name="), None);
        assert_eq!(nick_from_query("name=bob%24"), None);
        assert_eq!(nick_from_query(""), None);
        // a later valid name wins over an earlier invalid one
        assert_eq!(nick_from_query("name=bad%24&name=good").as_deref(), Some("good"));
    }

    #[test]
    fn fifo_order_and_counts() {
        let queue = ClaimQueue::with_capacity(8);
        let shutdown = Notification::new();
        for n in 0..5 {
            assert!(queue.enqueue(claim(n), soon(50), &shutdown));
        }
        assert_eq!(queue.len(), 5);
        let batch = queue.dequeue_batch(3, Some(soon(50)), &shutdown);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], claim(0));
        assert_eq!(batch[2], claim(2));
        assert_eq!(queue.len(), 2);
        let rest = queue.dequeue_batch(64, Some(soon(50)), &shutdown);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1], claim(4));
        assert!(queue.is_empty());
    }

    #[test]
    fn wraps_around_capacity() {
        let queue = ClaimQueue::with_capacity(4);
        let token = Notification::new();
        for round in 0..5u32 {
            for n in 0..4 {
                assert!(queue.enqueue(claim(round * 4 + n), soon(50), &token));
            }
            let batch = queue.dequeue_batch(4, Some(soon(50)), &token);
            assert_eq!(batch.len(), 4);
            assert_eq!(batch[0].ip, round * 4);
        }
    }

    #[test]
    fn enqueue_times_out_when_full() {
        let queue = ClaimQueue::with_capacity(2);
        let shutdown = Notification::new();
        assert!(queue.enqueue(claim(1), soon(50), &shutdown));
        assert!(queue.enqueue(claim(2), soon(50), &shutdown));
        let start = Instant::now();
        assert!(!queue.enqueue(claim(3), soon(40), &shutdown));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_times_out_when_empty() {
        let queue = ClaimQueue::with_capacity(2);
        let terminate = Notification::new();
        let batch = queue.dequeue_batch(8, Some(soon(30)), &terminate);
        assert!(batch.is_empty());
    }

    #[test]
    fn shutdown_cancels_blocked_producer() {
        let queue = Arc::new(ClaimQueue::with_capacity(1));
        let shutdown = Arc::new(Notification::new());
        assert!(queue.enqueue(claim(1), soon(50), &shutdown));
        let producer = {
            let queue = Arc::clone(&queue);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || queue.enqueue(claim(2), soon(5_000), &shutdown))
        };
        thread::sleep(Duration::from_millis(30));
        shutdown.notify();
        queue.interrupt();
        let start = Instant::now();
        assert!(!producer.join().expect("producer panicked"));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn terminate_cancels_blocked_consumer() {
        let queue = Arc::new(ClaimQueue::with_capacity(4));
        let terminate = Arc::new(Notification::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            let terminate = Arc::clone(&terminate);
            thread::spawn(move || queue.dequeue_batch(8, None, &terminate))
        };
        thread::sleep(Duration::from_millis(30));
        terminate.notify();
        queue.interrupt();
        assert!(consumer.join().expect("consumer panicked").is_empty());
    }

    #[test]
    fn blocked_producer_resumes_after_drain() {
        let queue = Arc::new(ClaimQueue::with_capacity(1));
        let shutdown = Arc::new(Notification::new());
        assert!(queue.enqueue(claim(1), soon(50), &shutdown));
        let producer = {
            let queue = Arc::clone(&queue);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || queue.enqueue(claim(2), soon(5_000), &shutdown))
        };
        thread::sleep(Duration::from_millis(30));
        let batch = queue.dequeue_batch(1, Some(soon(50)), &shutdown);
        assert_eq!(batch.len(), 1);
        assert!(producer.join().expect("producer panicked"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(ClaimQueue::with_capacity(16));
        let shutdown = Arc::new(Notification::new());
        let terminate = Arc::new(Notification::new());
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 200;

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            let shutdown = Arc::clone(&shutdown);
            producers.push(thread::spawn(move || {
                for n in 0..PER_PRODUCER {
                    while !queue.enqueue(claim(p * PER_PRODUCER + n), soon(100), &shutdown) {}
                }
            }));
        }

        let consumer = {
            let queue = Arc::clone(&queue);
            let terminate = Arc::clone(&terminate);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let batch = queue.dequeue_batch(64, None, &terminate);
                    if batch.is_empty() {
                        return seen;
                    }
                    seen.extend(batch);
                }
            })
        };

        for handle in producers {
            handle.join().expect("producer panicked");
        }
        while !queue.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        terminate.notify();
        queue.interrupt();
        let mut seen: Vec<u32> = consumer
            .join()
            .expect("consumer panicked")
            .into_iter()
            .map(|c| c.ip)
            .collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(seen, expected, "every claim delivered exactly once");
    }
}
