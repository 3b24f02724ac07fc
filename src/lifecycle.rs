//! Lifecycle primitives: one-shot notifications, the startup countdown
//! barrier, and the SIGUSR1 cancellation plumbing.
//!
//! Two notifications sequence shutdown. `shutdown` halts the producers
//! (HTTP workers, regenerators, supervisor, now worker); `terminate` is
//! fired afterwards and releases the claim consumer to drain and stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::debug;
use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use parking_lot::{Condvar, Mutex};

/// Signal used to cancel a worker's blocked `accept`/`read`.
pub const CANCEL_SIGNAL: Signal = Signal::SIGUSR1;

/// One-shot notification observable from blocking waits.
#[derive(Default)]
pub struct Notification {
    notified: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Notification {
    pub fn new() -> Notification {
        Notification::default()
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    /// Fire the notification and wake every waiter. Idempotent.
    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.notified.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    /// Block until notified or `deadline` passes. Returns true iff the
    /// notification fired.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.lock.lock();
        while !self.is_notified() {
            if self.cv.wait_until(&mut guard, deadline).timed_out() {
                return self.is_notified();
            }
        }
        true
    }
}

/// Countdown barrier: each party arrives exactly once; `wait` blocks
/// until every party has arrived.
pub struct Countdown {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl Countdown {
    pub fn new(parties: usize) -> Countdown {
        Countdown {
            remaining: Mutex::new(parties),
            cv: Condvar::new(),
        }
    }

    /// Record this party's arrival.
    pub fn arrive(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cv.wait(&mut remaining);
        }
    }
}

/// Process lifecycle shared by every thread: the two notifications and
/// the startup readiness barrier.
pub struct Lifecycle {
    pub shutdown: Notification,
    pub terminate: Notification,
    pub ready: Countdown,
}

impl Lifecycle {
    /// `helpers` regenerator/consumer threads plus the main thread each
    /// arrive at `ready` once.
    pub fn new(helpers: usize) -> Lifecycle {
        Lifecycle {
            shutdown: Notification::new(),
            terminate: Notification::new(),
            ready: Countdown::new(helpers + 1),
        }
    }
}

extern "C" fn ignore_signal(_: libc::c_int) {
    // the side effect is EINTR in whatever syscall the thread was blocked in
}

/// Install the empty SIGUSR1 handler, without SA_RESTART, so a blocked
/// `accept`/`read` fails with EINTR when the thread is cancelled.
pub fn install_cancel_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(ignore_signal),
        SaFlags::empty(),
        SigSet::all(),
    );
    unsafe { signal::sigaction(CANCEL_SIGNAL, &action) }.map(drop)
}

/// Block every signal in the calling thread. Helpers stay masked for
/// their whole lifetime; workers unmask only around cancellable i/o.
pub fn block_all_signals() {
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None);
}

/// Allow only the cancellation signal in the calling thread.
pub fn allow_cancel_signal() {
    let mut mask = SigSet::all();
    mask.remove(CANCEL_SIGNAL);
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None);
}

/// Identity of the calling thread, as recorded in worker slots.
pub fn current_thread_id() -> u64 {
    pthread_self() as u64
}

/// Deliver the cancellation signal to a thread previously recorded with
/// `current_thread_id`. A zero id means the thread never started.
pub fn cancel_thread(thread_id: u64) {
    if thread_id != 0 {
        let _ = pthread_kill(thread_id as Pthread, CANCEL_SIGNAL);
    }
}

/// Pin the calling thread to one CPU, when enough CPUs exist. Affinity
/// is an optimization; failures are ignored.
pub fn pin_to_cpu(cpu: usize) {
    if num_cpus::get() > cpu + 1 {
        set_affinity(&[cpu]);
    }
}

/// Keep the calling thread off the first `reserved` CPUs, which the
/// periodic workers pin themselves to.
pub fn avoid_first_cpus(reserved: usize) {
    let total = num_cpus::get();
    if total > reserved {
        let cpus: Vec<usize> = (reserved..total).collect();
        set_affinity(&cpus);
    }
}

fn set_affinity(cpus: &[usize]) {
    let mut set = nix::sched::CpuSet::new();
    for &cpu in cpus {
        if set.set(cpu).is_err() {
            return;
        }
    }
    if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
        debug!("sched_setaffinity: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn notification_wait_times_out() {
        let note = Notification::new();
        let start = Instant::now();
        assert!(!note.wait_until(Instant::now() + Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn notification_wakes_waiter() {
        let note = Arc::new(Notification::new());
        let waiter = {
            let note = Arc::clone(&note);
            thread::spawn(move || note.wait_until(Instant::now() + Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        note.notify();
        assert!(waiter.join().expect("waiter panicked"));
        assert!(note.is_notified());
    }

    #[test]
    fn countdown_releases_at_zero() {
        let barrier = Arc::new(Countdown::new(3));
        let mut arrivers = Vec::new();
        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            arrivers.push(thread::spawn(move || barrier.arrive()));
        }
        for handle in arrivers {
            handle.join().expect("arriver panicked");
        }
        barrier.arrive();
        barrier.wait();
    }
}
