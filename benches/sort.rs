// times direct sorts of growing sizes with device timestamps written at the
// stage boundaries through the timestamps extension
use std::time::Duration;

use ash::vk;
use rand::{rngs::StdRng, Rng, SeedableRng};
use vk_sort::{utils::Context, BufferInfo, GpuSorter, SortExt, SortInfo, Target, TimestampProbe};

const PROBE_CAPACITY: u32 = 64;

fn time_sort(ctx: &Context, sorter: &GpuSorter, keys: &[u32]) -> Duration {
    let n = keys.len() as u32;

    let reqs = sorter.memory_requirements(n);
    let keyvals_even = ctx.alloc(reqs.keyvals_size, vk::BufferUsageFlags::empty());
    let keyvals_odd = ctx.alloc(reqs.keyvals_size, vk::BufferUsageFlags::empty());
    let internal = ctx.alloc(reqs.internal_size, vk::BufferUsageFlags::empty());
    ctx.upload(&keyvals_even, keys);

    let query_pool = ctx.create_timestamp_pool(PROBE_CAPACITY);

    let mut info = SortInfo {
        ext: Some(SortExt::Timestamps(TimestampProbe {
            query_pool,
            capacity: PROBE_CAPACITY,
            next_index: 0,
        })),
        key_bits: 32,
        count: n,
        keyvals_even: ctx.buffer_info(&keyvals_even),
        keyvals_odd: ctx.buffer_info(&keyvals_odd),
        internal: ctx.buffer_info(&internal),
    };

    let mut sorted = BufferInfo::default();
    ctx.onetime_submit(|cmd| unsafe {
        ctx.device()
            .cmd_reset_query_pool(cmd, query_pool, 0, PROBE_CAPACITY);
        sorted = sorter.sort(ctx.device(), cmd, &mut info);
    });
    assert_ne!(sorted.devaddr, 0);

    let written = match info.ext {
        Some(SortExt::Timestamps(probe)) => probe.next_index,
        None => unreachable!(),
    };
    let ticks = ctx.read_timestamps(query_pool, written);
    let elapsed = (ticks[written as usize - 1] - ticks[0]) as f32 * ctx.timestamp_period();

    ctx.destroy_timestamp_pool(query_pool);
    ctx.destroy_buffer(keyvals_even);
    ctx.destroy_buffer(keyvals_odd);
    ctx.destroy_buffer(internal);

    return Duration::from_nanos(elapsed as u64);
}

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VK_SORT_TARGET").ok())
        .expect("usage: sort <target archive> (or set VK_SORT_TARGET)");
    let blob = std::fs::read(&path).expect("could not read the target archive");
    let target = Target::open(&blob).expect("could not decode the target archive");
    if target.keyval_dwords() != 1 {
        eprintln!("bench expects a 32-bit target");
        return;
    }

    let ctx = Context::new(&target).expect("no Vulkan device offers the target's capabilities");
    let sorter = unsafe { GpuSorter::new(ctx.device(), None, vk::PipelineCache::null(), &target) }
        .expect("could not build the sort pipelines");

    let mut rng = StdRng::seed_from_u64(0);
    for n in [10_000, 100_000, 1_000_000, 8_000_000, 20_000_000] {
        let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
        // warm up pipelines and caches once before the timed run
        time_sort(&ctx, &sorter, &keys);
        let d = time_sort(&ctx, &sorter, &keys);
        println!("{n}: {d:?}");
    }

    unsafe { sorter.destroy(ctx.device(), None) };
}
