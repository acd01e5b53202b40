mod common;

use common::{run_pes, run_pes_with};
use half::{bf16, f16};
use pgas_shmem::{CmpOp, ShmemError, StrideDesc};
use rand::Rng;
use serial_test::serial;

#[test]
#[serial]
fn ring_put() {
    run_pes(4, |ctx| {
        let (me, n) = (ctx.my_pe(), ctx.n_pes());
        let buf = ctx.malloc::<i32>(1).unwrap();
        ctx.put(buf, &[me as i32], (me + 1) % n).unwrap();
        ctx.barrier_all().unwrap();
        let mut got = [-1i32];
        ctx.read_local(buf, &mut got).unwrap();
        assert_eq!(got[0], ((me + n - 1) % n) as i32);
        ctx.free(buf).unwrap();
    });
}

#[test]
#[serial]
fn ring_put_nbi_then_wait() {
    run_pes(4, |ctx| {
        let (me, n) = (ctx.my_pe(), ctx.n_pes());
        let slot = ctx.calloc::<i32>(1).unwrap();
        ctx.put_nbi(slot, &[1000 + me as i32], (me + 1) % n).unwrap();
        ctx.quiet().unwrap();
        let from = ((me + n - 1) % n) as i32;
        assert_eq!(ctx.wait_until(slot, CmpOp::Eq, 1000 + from).unwrap(), 1000 + from);
        ctx.barrier_all().unwrap();
    });
}

/// For every length: a blocking put checked by the target, a blocking get of
/// the peer's source, and a put_nbi completed by quiet and read back twice.
macro_rules! put_get_test {
    ($($t:ident => $conv:expr),* $(,)?) => {
        paste::paste! {
            $(
                #[test]
                #[serial]
                fn [<put_get_ $t>]() {
                    let conv: fn(usize) -> $t = $conv;
                    let pattern = move |pe: usize, len: usize| -> Vec<$t> { (0..len).map(|i| conv(i + 10 * pe)).collect() };
                    run_pes(2, |ctx| {
                        let me = ctx.my_pe();
                        let other = 1 - me;
                        let dst = ctx.calloc::<$t>(4096).unwrap();
                        let src = ctx.malloc::<$t>(4096).unwrap();
                        ctx.write_local(src, &pattern(me, 4096)).unwrap();
                        ctx.barrier_all().unwrap();

                        for len in [1usize, 64, 4096] {
                            ctx.put(dst.slice(0, len), &pattern(me, len), other).unwrap();
                            ctx.barrier_all().unwrap();
                            let mut got = vec![<$t>::default(); len];
                            ctx.read_local(dst.slice(0, len), &mut got).unwrap();
                            assert_eq!(got, pattern(other, len), "put of {} elements", len);
                            ctx.barrier_all().unwrap();

                            let mut theirs = vec![<$t>::default(); len];
                            ctx.get(&mut theirs, src.slice(0, len), other).unwrap();
                            assert_eq!(theirs, pattern(other, len), "get of {} elements", len);

                            let shifted = pattern(me + 2, len);
                            for _ in 0..2 {
                                ctx.put_nbi(dst.slice(0, len), &shifted, other).unwrap();
                                ctx.quiet().unwrap();
                                let mut back = vec![<$t>::default(); len];
                                ctx.get(&mut back, dst.slice(0, len), other).unwrap();
                                assert_eq!(back, shifted, "put_nbi of {} elements", len);
                            }
                            ctx.barrier_all().unwrap();
                        }
                    });
                }
            )*
        }
    };
}

put_get_test!(
    u8 => |i| i as u8,
    u16 => |i| i as u16,
    u32 => |i| i as u32,
    u64 => |i| i as u64,
    i8 => |i| i as i8,
    i16 => |i| i as i16,
    i32 => |i| i as i32,
    i64 => |i| -(i as i64),
    f32 => |i| i as f32 * 0.5,
    f64 => |i| i as f64 * 0.25,
    f16 => |i| f16::from_f32(i as f32),
    bf16 => |i| bf16::from_f32(i as f32),
);

#[test]
#[serial]
fn strided_put_and_get() {
    run_pes(2, |ctx| {
        let me = ctx.my_pe();
        let dst = ctx.calloc::<i64>(20).unwrap();
        let src: Vec<i64> = (0..11).map(|i| 100 + i).collect();
        let desc = StrideDesc::new(4, 2, 3, 5);
        if me == 0 {
            ctx.put_strided(dst, &src, desc, 1).unwrap();
        }
        ctx.barrier_all().unwrap();
        if me == 1 {
            let mut got = vec![0i64; 20];
            ctx.read_local(dst, &mut got).unwrap();
            for r in 0..4 {
                for j in 0..2 {
                    assert_eq!(got[r * 5 + j], src[r * 3 + j]);
                }
                for j in 2..5 {
                    if r * 5 + j < 20 {
                        assert_eq!(got[r * 5 + j], 0);
                    }
                }
            }
        }
        ctx.barrier_all().unwrap();
        if me == 0 {
            // back again: the remote side is read with stride 5
            let mut back = vec![0i64; 8];
            ctx.get_strided(&mut back, dst, StrideDesc::new(4, 2, 5, 2), 1).unwrap();
            let want: Vec<i64> = (0..4).flat_map(|r| vec![src[r * 3], src[r * 3 + 1]]).collect();
            assert_eq!(back, want);
        }
        ctx.barrier_all().unwrap();
    });
}

#[test]
#[serial]
fn bad_transfers_are_rejected() {
    run_pes(2, |ctx| {
        let dst = ctx.malloc::<u32>(4).unwrap();
        let too_long = [0u32; 5];
        assert!(matches!(ctx.put(dst, &too_long, 1), Err(ShmemError::InvalidParam(_))));
        assert!(matches!(ctx.put(dst, &[1u32], 7), Err(ShmemError::InvalidParam(_))));
        let overlapping = StrideDesc::new(2, 3, 2, 3);
        assert!(matches!(
            ctx.put_strided(dst, &[0u32; 6], overlapping, 1),
            Err(ShmemError::InvalidParam(_))
        ));
        // an empty transfer touches nothing
        ctx.put(dst, &[], 1).unwrap();
        ctx.barrier_all().unwrap();
    });
}

#[test]
#[serial]
fn nbi_puts_complete_at_quiet() {
    run_pes(3, |ctx| {
        let (me, n) = (ctx.my_pe(), ctx.n_pes());
        let dst = ctx.malloc::<u16>(64).unwrap();
        let mut src: Vec<u16> = (0..64).map(|i| (i * 3 + me) as u16).collect();
        let target = (me + 1) % n;
        ctx.put_nbi(dst, &src, target).unwrap();
        // the source is free to change once the call returns
        let sent = src.clone();
        src.iter_mut().for_each(|x| *x = 0);
        // issuing the same transfer twice leaves the same result
        ctx.put_nbi(dst, &sent, target).unwrap();
        ctx.quiet().unwrap();
        ctx.barrier_all().unwrap();
        let from = (me + n - 1) % n;
        let mut got = vec![0u16; 64];
        ctx.read_local(dst, &mut got).unwrap();
        let want: Vec<u16> = (0..64).map(|i| (i * 3 + from) as u16).collect();
        assert_eq!(got, want);
        ctx.barrier_all().unwrap();
    });
}

#[test]
#[serial]
fn get_nbi_into_symmetric_memory() {
    run_pes(2, |ctx| {
        let me = ctx.my_pe();
        let src = ctx.malloc::<i32>(32).unwrap();
        let dst = ctx.calloc::<i32>(32).unwrap();
        let mine: Vec<i32> = (0..32).map(|i| i * (me as i32 + 1)).collect();
        ctx.write_local(src, &mine).unwrap();
        ctx.barrier_all().unwrap();
        let other = 1 - me;
        ctx.get_nbi(dst, src, other).unwrap();
        ctx.quiet().unwrap();
        let mut got = vec![0i32; 32];
        ctx.read_local(dst, &mut got).unwrap();
        let want: Vec<i32> = (0..32).map(|i| i * (other as i32 + 1)).collect();
        assert_eq!(got, want);
        ctx.barrier_all().unwrap();
    });
}

#[test]
#[serial]
fn dma_transfers_within_a_node() {
    run_pes_with(
        2,
        |b| b.with_dma_block_size(4096),
        |ctx| {
            let me = ctx.my_pe();
            let len = 3 * 4096 + 17;
            let buf = ctx.malloc::<u8>(len).unwrap();
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            if me == 0 {
                ctx.put_dma(buf, &data, 1).unwrap();
            }
            ctx.barrier_all().unwrap();
            if me == 1 {
                let mut got = vec![0u8; len];
                ctx.read_local(buf, &mut got).unwrap();
                assert_eq!(got, data);
            }
            ctx.barrier_all().unwrap();
            if me == 0 {
                let mut back = vec![0u8; len];
                ctx.get_dma(&mut back, buf, 1).unwrap();
                assert_eq!(back, data);
            }
            ctx.barrier_all().unwrap();
        },
    );
}

#[test]
#[serial]
fn dma_to_another_host_is_dropped() {
    run_pes_with(
        2,
        |b| b.with_pes_per_node(1),
        |ctx| {
            let me = ctx.my_pe();
            let buf = ctx.malloc::<i32>(1).unwrap();
            ctx.write_local(buf, &[-1]).unwrap();
            ctx.barrier_all().unwrap();
            if me == 0 {
                ctx.put_dma(buf, &[7], 1).unwrap();
                ctx.quiet().unwrap();
            }
            ctx.barrier_all().unwrap();
            let mut got = [0i32];
            ctx.read_local(buf, &mut got).unwrap();
            assert_eq!(got[0], -1);
            ctx.barrier_all().unwrap();
        },
    );
}

#[test]
#[serial]
fn blocking_dma_get_outlasts_the_poll_cap() {
    run_pes_with(
        2,
        |b| b.with_dma_block_size(1).with_dma_queue_depth(1 << 20).with_dma_poll_cap(1),
        |ctx| {
            let me = ctx.my_pe();
            let len = 256 * 1024;
            let buf = ctx.malloc::<u8>(len).unwrap();
            ctx.write_local(buf, &vec![0xab; len]).unwrap();
            ctx.barrier_all().unwrap();
            let mut back = vec![0u8; len];
            ctx.get_dma(&mut back, buf, 1 - me).unwrap();
            let at_return = back.iter().filter(|b| **b == 0xab).count();
            assert_eq!(at_return, len);
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(back.iter().all(|b| *b == 0xab));
            ctx.barrier_all().unwrap();
        },
    );
}

#[test]
#[serial]
fn abandoned_dma_transfers_do_not_complete_later_ones() {
    run_pes_with(
        2,
        |b| b.with_dma_block_size(1).with_dma_queue_depth(1 << 20).with_dma_poll_cap(1),
        |ctx| {
            let me = ctx.my_pe();
            let len = 64 * 1024;
            let first = ctx.calloc::<u8>(len).unwrap();
            let second = ctx.calloc::<u8>(len).unwrap();
            ctx.barrier_all().unwrap();
            if me == 0 {
                // both polls give up long before the copies ran
                ctx.put_dma(first, &vec![1u8; len], 1).unwrap();
                ctx.put_dma(second, &vec![2u8; len], 1).unwrap();
                let mut back = vec![0u8; len];
                ctx.get_dma(&mut back, second, 1).unwrap();
                assert!(back.iter().all(|v| *v == 2));
                ctx.get_dma(&mut back, first, 1).unwrap();
                assert!(back.iter().all(|v| *v == 1));
            }
            ctx.barrier_all().unwrap();
        },
    );
}

#[test]
#[serial]
fn puts_cross_hosts_over_the_network() {
    run_pes_with(
        4,
        |b| b.with_pes_per_node(2),
        |ctx| {
            let (me, n) = (ctx.my_pe(), ctx.n_pes());
            let buf = ctx.calloc::<u64>(n).unwrap();
            for pe in 0..n {
                ctx.put_nbi(buf.add(me), &[(me * 100 + pe) as u64], pe).unwrap();
            }
            ctx.barrier_all().unwrap();
            let mut got = vec![0u64; n];
            ctx.read_local(buf, &mut got).unwrap();
            let want: Vec<u64> = (0..n).map(|src| (src * 100 + me) as u64).collect();
            assert_eq!(got, want);
            ctx.barrier_all().unwrap();
        },
    );
}

#[test]
#[serial]
fn putmem_and_getmem_of_random_sizes() {
    run_pes(2, |ctx| {
        let me = ctx.my_pe();
        let buf = ctx.malloc::<u8>(64 * 1024).unwrap();
        let sizes: Vec<usize> = {
            let mut rng = rand::thread_rng();
            (0..8).map(|_| rng.gen_range(1..64 * 1024)).collect()
        };
        for len in sizes {
            if me == 0 {
                let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
                ctx.putmem(buf.addr(), &data, 1).unwrap();
                ctx.quiet().unwrap();
                let mut back = vec![0u8; len];
                ctx.getmem(&mut back, buf.addr(), 1).unwrap();
                assert_eq!(back, data);
            }
        }
        ctx.barrier_all().unwrap();
    });
}
