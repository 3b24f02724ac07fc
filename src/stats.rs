//! Whitebox metrics: relaxed atomic counters rendered verbatim by the
//! `/statusz` endpoint, together with `getrusage` readings.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::db::GenError;

/// One relaxed-ordering event counter.
#[derive(Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge, used for the live-connections count.
#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Every whitebox counter, one per observable event class.
        #[derive(Default)]
        pub struct Counters {
            $(pub $name: Counter,)*
        }

        impl Counters {
            /// Counter values in their canonical report order.
            pub fn snapshot(&self) -> Vec<(&'static str, i64)> {
                vec![$((stringify!($name), self.$name.get()),)*]
            }
        }
    };
}

counters!(
    accepts,
    messages,
    dbfails,
    proxied,
    memfails,
    sysfails,
    unproxied,
    readfails,
    notfounds,
    meltdowns,
    parsefails,
    iprequests,
    queuefulls,
    htmlclaims,
    emptyclaims,
    acceptfails,
    badversions,
    plainclaims,
    imageclaims,
    invalidnames,
    ipv6forwards,
    claimrequests,
    assetrequests,
    statuszrequests,
);

impl Counters {
    /// Attribute a regeneration failure to its taxonomy counter.
    pub fn count_gen_error(&self, err: &GenError) {
        match err {
            GenError::Io(_) => self.sysfails.bump(),
            GenError::Db(_) => self.dbfails.bump(),
        }
    }
}

/// Render the plain-text `/statusz` report body.
pub fn render_statusz(
    started_unix: i64,
    now_unix: i64,
    connections: i64,
    workers: usize,
    counters: &Counters,
) -> String {
    let mut out = String::with_capacity(2048);
    let uptime = (now_unix - started_unix).max(1);
    line(&mut out, "qps", counters.messages.get() / uptime);
    line(&mut out, "started", started_unix);
    line(&mut out, "now", now_unix);
    line(&mut out, "connections", connections);
    line(&mut out, "workers", workers as i64);
    for (name, value) in counters.snapshot() {
        line(&mut out, name, value);
    }
    append_rusage(&mut out);
    out
}

fn line(out: &mut String, key: &str, value: i64) {
    let _ = writeln!(out, "{key}: {value}");
}

/// Append every `getrusage(RUSAGE_SELF)` field under its C name.
fn append_rusage(out: &mut String) {
    let mut ru = unsafe { std::mem::zeroed::<libc::rusage>() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) } != 0 {
        return;
    }
    line(out, "ru_utime.tv_sec", ru.ru_utime.tv_sec as i64);
    line(out, "ru_utime.tv_usec", ru.ru_utime.tv_usec as i64);
    line(out, "ru_stime.tv_sec", ru.ru_stime.tv_sec as i64);
    line(out, "ru_stime.tv_usec", ru.ru_stime.tv_usec as i64);
    line(out, "ru_maxrss", ru.ru_maxrss as i64);
    line(out, "ru_ixrss", ru.ru_ixrss as i64);
    line(out, "ru_idrss", ru.ru_idrss as i64);
    line(out, "ru_isrss", ru.ru_isrss as i64);
    line(out, "ru_minflt", ru.ru_minflt as i64);
    line(out, "ru_majflt", ru.ru_majflt as i64);
    line(out, "ru_nswap", ru.ru_nswap as i64);
    line(out, "ru_inblock", ru.ru_inblock as i64);
    line(out, "ru_oublock", ru.ru_oublock as i64);
    line(out, "ru_msgsnd", ru.ru_msgsnd as i64);
    line(out, "ru_msgrcv", ru.ru_msgrcv as i64);
    line(out, "ru_nsignals", ru.ru_nsignals as i64);
    line(out, "ru_nvcsw", ru.ru_nvcsw as i64);
    line(out, "ru_nivcsw", ru.ru_nivcsw as i64);
}
