#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use pgas_shmem::{ShmemContext, ShmemContextBuilder, SimDriver, SpinPolicy, ThreadBootstrap};

static NEXT_JOB: AtomicUsize = AtomicUsize::new(1);

/// sim fabrics are keyed by job id, every run gets its own
pub fn job_id() -> usize {
    (std::process::id() as usize) * 1000 + NEXT_JOB.fetch_add(1, Ordering::SeqCst)
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// small heaps and two cores; waits give up instead of hanging a failed test
pub fn builder(my_pe: usize, n_pes: usize) -> ShmemContextBuilder {
    ShmemContextBuilder::new(my_pe, n_pes)
        .with_heap_size(2 * 1024 * 1024)
        .with_num_cores(2)
        .with_spin_policy(SpinPolicy::bounded(50_000_000))
}

/// Run `f` on `n_pes` PEs, one thread each, with the default test configuration
pub fn run_pes<F>(n_pes: usize, f: F)
where
    F: Fn(&ShmemContext) + Sync,
{
    run_pes_with(n_pes, |b| b, f)
}

pub fn run_pes_with<C, F>(n_pes: usize, configure: C, f: F)
where
    C: Fn(ShmemContextBuilder) -> ShmemContextBuilder + Sync,
    F: Fn(&ShmemContext) + Sync,
{
    init_logging();
    let job = job_id();
    let bootstraps = ThreadBootstrap::group(n_pes);
    std::thread::scope(|s| {
        for (pe, bootstrap) in bootstraps.into_iter().enumerate() {
            let configure = &configure;
            let f = &f;
            s.spawn(move || {
                let ctx = configure(builder(pe, n_pes))
                    .build(bootstrap, SimDriver::new(job, pe))
                    .expect("context setup");
                f(&ctx);
            });
        }
    });
}
