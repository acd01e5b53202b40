mod common;

use common::{builder, job_id, run_pes, run_pes_with};
use std::time::Duration;

use pgas_shmem::{
    Backend, CmpOp, InitStatus, MemKind, MteConfig, ShmemContextBuilder, ShmemError, SimDriver, SpinPolicy,
    ThreadBootstrap, MAX_LOCAL_SIZE,
};
use serial_test::serial;

#[test]
#[serial]
fn info_and_status() {
    run_pes(1, |ctx| {
        assert_eq!(ctx.init_status(), InitStatus::Initialized);
        assert_eq!(ctx.info_get_version(), (1, 0));
        assert_eq!(ctx.info_get_name(), "PGAS-SHMEM v1.0.0");
        assert_eq!(ctx.my_pe(), 0);
        assert_eq!(ctx.n_pes(), 1);
        assert_eq!(ctx.config().unwrap().heap_size, 2 * 1024 * 1024);
    });
}

#[test]
#[serial]
fn allocations_are_symmetric() {
    run_pes(3, |ctx| {
        let (me, n) = (ctx.my_pe(), ctx.n_pes());
        let offsets = ctx.calloc::<u64>(n * 3).unwrap();
        let a = ctx.malloc::<u8>(3).unwrap();
        let b = ctx.align::<f32>(4096, 10).unwrap();
        let c = ctx.calloc::<i64>(100).unwrap();
        let base = ctx.heap_base().unwrap();
        assert_eq!(b.addr().as_u64() % 4096, 0);
        assert_eq!(a.addr().as_u64() % 64, 0);
        let mine: Vec<u64> = [a.addr(), b.addr(), c.addr()]
            .iter()
            .map(|p| p.offset_from(base).unwrap() as u64)
            .collect();
        ctx.put(offsets.add(me * 3), &mine, 0).unwrap();
        ctx.barrier_all().unwrap();
        if me == 0 {
            let mut all = vec![0u64; n * 3];
            ctx.read_local(offsets, &mut all).unwrap();
            for pe in 1..n {
                assert_eq!(&all[pe * 3..pe * 3 + 3], &all[..3]);
            }
        }
        let mut zeros = vec![1i64; 100];
        ctx.read_local(c, &mut zeros).unwrap();
        assert!(zeros.iter().all(|v| *v == 0));

        let before = ctx.space_avail().unwrap();
        ctx.free(c).unwrap();
        assert!(ctx.space_avail().unwrap() > before);
        ctx.free(b).unwrap();
        ctx.free(a).unwrap();
        ctx.free(offsets).unwrap();
    });
}

#[test]
#[serial]
fn allocation_errors() {
    run_pes(2, |ctx| {
        assert!(matches!(ctx.malloc::<u8>(0), Err(ShmemError::InvalidValue(_))));
        assert!(matches!(ctx.malloc::<u64>(usize::MAX / 4), Err(ShmemError::InvalidValue(_))));
        assert!(matches!(ctx.malloc::<u8>(64 * 1024 * 1024), Err(ShmemError::MallocFailed(_))));
        assert!(matches!(ctx.align::<u8>(48, 8), Err(ShmemError::InvalidValue(_))));
        assert!(matches!(ctx.malloc_in::<u8>(MemKind::Host, 8), Err(ShmemError::InvalidParam(_))));
        let p = ctx.malloc::<u32>(4).unwrap();
        assert!(matches!(ctx.free(p.add(1)), Err(ShmemError::InvalidParam(_))));
        ctx.free(p).unwrap();
        ctx.barrier_all().unwrap();
    });
}

#[test]
#[serial]
fn host_heap_kind() {
    run_pes_with(
        2,
        |b| b.with_host_heap_size(2 * 1024 * 1024),
        |ctx| {
            let me = ctx.my_pe();
            let buf = ctx.malloc_in::<i32>(MemKind::Host, 8).unwrap();
            ctx.put(buf, &[me as i32; 8], 1 - me).unwrap();
            ctx.barrier_all().unwrap();
            let mut got = [0i32; 8];
            ctx.read_local(buf, &mut got).unwrap();
            assert_eq!(got, [(1 - me) as i32; 8]);
            ctx.free(buf).unwrap();
        },
    );
}

#[test]
#[serial]
fn peer_addresses_follow_the_link_domain() {
    run_pes_with(
        4,
        |b| b.with_pes_per_node(2),
        |ctx| {
            let me = ctx.my_pe();
            let buf = ctx.malloc::<u32>(16).unwrap();
            assert_eq!(ctx.ptr(buf, me), Some(buf.addr()));
            for pe in 0..ctx.n_pes() {
                let same_node = pe / 2 == me / 2;
                let at = ctx.ptr(buf, pe);
                assert_eq!(at.is_some(), same_node, "pe {} seen from pe {}", pe, me);
                if let Some(at) = at {
                    assert_eq!(ctx.ptr(buf.add(3), pe), Some(at.byte_add(12)));
                }
            }
            assert_eq!(ctx.ptr(buf, 9), None);
            ctx.barrier_all().unwrap();
        },
    );
}

#[test]
#[serial]
fn mte_config_round_trip() {
    run_pes(1, |ctx| {
        ctx.set_mte_config(64 * 1024, 5).unwrap();
        assert_eq!(
            ctx.mte_config().unwrap(),
            MteConfig {
                ub_size: 64 * 1024,
                event_id: 5
            }
        );
        assert!(matches!(ctx.set_mte_config(1, 0), Err(ShmemError::InvalidValue(_))));
    });
}

#[test]
#[serial]
fn global_exit_releases_waiters() {
    run_pes(2, |ctx| {
        let flag = ctx.calloc::<i32>(1).unwrap();
        if ctx.my_pe() == 1 {
            ctx.global_exit(7).unwrap();
        } else {
            assert_eq!(ctx.wait_until(flag, CmpOp::Eq, 1), Err(ShmemError::GlobalExit(7)));
        }
    });
}

#[test]
#[serial]
fn finalize_is_final() {
    let job = job_id();
    let bootstraps = ThreadBootstrap::group(2);
    std::thread::scope(|s| {
        for (pe, bootstrap) in bootstraps.into_iter().enumerate() {
            s.spawn(move || {
                let mut ctx = builder(pe, 2).build(bootstrap, SimDriver::new(job, pe)).unwrap();
                ctx.finalize().unwrap();
                assert_eq!(ctx.init_status(), InitStatus::NotInitialized);
                assert!(matches!(ctx.malloc::<u8>(8), Err(ShmemError::NotInitialized)));
                assert!(matches!(ctx.barrier_all(), Err(ShmemError::NotInitialized)));
                assert!(matches!(ctx.finalize(), Err(ShmemError::NotInitialized)));
            });
        }
    });
}

#[test]
#[serial]
fn builder_rejects_bad_parameters() {
    let job = job_id();
    let mismatched = ThreadBootstrap::group(1).pop().unwrap();
    let res = ShmemContextBuilder::new(0, 2).build(mismatched, SimDriver::new(job, 0));
    assert!(matches!(res, Err(ShmemError::InvalidParam(_))));

    let out_of_range = ThreadBootstrap::group(1).pop().unwrap();
    let res = ShmemContextBuilder::new(1, 1).build(out_of_range, SimDriver::new(job, 1));
    assert!(matches!(res, Err(ShmemError::InvalidParam(_))));

    let empty_heap = ThreadBootstrap::group(1).pop().unwrap();
    let res = builder(0, 1).with_heap_size(0).build(empty_heap, SimDriver::new(job, 0));
    assert!(matches!(res, Err(ShmemError::InvalidValue(_))));

    let huge_heap = ThreadBootstrap::group(1).pop().unwrap();
    let res = builder(0, 1)
        .with_heap_size(MAX_LOCAL_SIZE + 1)
        .build(huge_heap, SimDriver::new(job, 0));
    assert!(matches!(res, Err(ShmemError::InvalidValue(_))));
}

#[test]
#[serial]
fn deadlock_timeout_applies_to_the_context() {
    run_pes_with(
        2,
        |b| {
            b.with_spin_policy(SpinPolicy {
                deadlock_timeout: Duration::from_secs(2),
                ..SpinPolicy::bounded(50_000_000)
            })
        },
        |ctx| {
            assert_eq!(ctx.config().unwrap().deadlock_timeout, 2.0);
            ctx.barrier_all().unwrap();
        },
    );
    run_pes_with(
        2,
        |b| b.with_deadlock_timeout(0.25),
        |ctx| {
            assert_eq!(ctx.config().unwrap().deadlock_timeout, 0.25);
            ctx.barrier_all().unwrap();
        },
    );
}

#[test]
#[serial]
fn builds_on_the_configured_backend() {
    let job = job_id();
    let bootstraps = ThreadBootstrap::group(2);
    std::thread::scope(|s| {
        for (pe, bootstrap) in bootstraps.into_iter().enumerate() {
            s.spawn(move || {
                let ctx = builder(pe, 2)
                    .with_backend(Backend::Sim)
                    .with_job_id(job)
                    .build_on_backend(Some(bootstrap))
                    .unwrap();
                let buf = ctx.calloc::<u32>(1).unwrap();
                ctx.put(buf, &[pe as u32 + 1], 1 - pe).unwrap();
                ctx.barrier_all().unwrap();
                let mut got = [0u32];
                ctx.read_local(buf, &mut got).unwrap();
                assert_eq!(got[0], (1 - pe) as u32 + 1);
                ctx.barrier_all().unwrap();
            });
        }
    });

    let res = builder(0, 1).with_backend(Backend::Sim).build_on_backend(None);
    assert!(matches!(res, Err(ShmemError::InvalidParam(_))));
}
