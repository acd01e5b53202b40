use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bootstrap::BootstrapOps;
use crate::config::Config;
use crate::error::{ShmemError, ShmemResult};

/// How a busy wait backs off, when it gives up, and when it complains.
#[derive(Clone, Debug, PartialEq)]
pub struct SpinPolicy {
    /// polls issued with a cpu spin hint before the waiter starts yielding
    pub spin_limit: u64,
    /// polls after which the waiter sleeps between polls instead of yielding
    pub yield_after: u64,
    /// polls after which a wait gives up with `Timeout`, `None` waits forever
    pub max_iters: Option<u64>,
    /// a warning is logged each time a single wait exceeds this
    pub deadlock_timeout: Duration,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        SpinPolicy {
            spin_limit: 128,
            yield_after: 10_000,
            max_iters: None,
            deadlock_timeout: Duration::from_secs_f64(Config::default().deadlock_timeout),
        }
    }
}

impl SpinPolicy {
    /// a policy that gives up after `max_iters` polls
    pub fn bounded(max_iters: u64) -> SpinPolicy {
        SpinPolicy {
            max_iters: Some(max_iters),
            ..Default::default()
        }
    }
}

/// The state of one busy wait
pub(crate) struct Spinner<'a, B: BootstrapOps> {
    policy: &'a SpinPolicy,
    bootstrap: &'a B,
    what: &'a str,
    iters: u64,
    start: Instant,
}

impl<'a, B: BootstrapOps> Spinner<'a, B> {
    pub(crate) fn new(policy: &'a SpinPolicy, bootstrap: &'a B, what: &'a str) -> Spinner<'a, B> {
        Spinner {
            policy,
            bootstrap,
            what,
            iters: 0,
            start: Instant::now(),
        }
    }

    /// back off once after an unsuccessful poll
    pub(crate) fn spin(&mut self) -> ShmemResult<()> {
        if let Some(status) = self.bootstrap.exit_status() {
            return Err(ShmemError::GlobalExit(status));
        }
        self.iters += 1;
        if let Some(max) = self.policy.max_iters {
            if self.iters >= max {
                debug!("pe {} {} gave up after {} polls", self.bootstrap.my_pe(), self.what, self.iters);
                return Err(ShmemError::Timeout);
            }
        }
        if self.iters < self.policy.spin_limit {
            std::hint::spin_loop();
        } else if self.iters < self.policy.yield_after {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }
        if self.start.elapsed() > self.policy.deadlock_timeout {
            warn!(
                "pe {} {} has been waiting for {:?} ({} polls), potential deadlock",
                self.bootstrap.my_pe(),
                self.what,
                self.policy.deadlock_timeout,
                self.iters
            );
            self.start = Instant::now();
        }
        Ok(())
    }
}

/// poll `f` until it yields a value
pub(crate) fn spin_until<B, R, F>(policy: &SpinPolicy, bootstrap: &B, what: &str, mut f: F) -> ShmemResult<R>
where
    B: BootstrapOps,
    F: FnMut() -> ShmemResult<Option<R>>,
{
    let mut spinner = Spinner::new(policy, bootstrap, what);
    loop {
        if let Some(r) = f()? {
            return Ok(r);
        }
        spinner.spin()?;
    }
}
