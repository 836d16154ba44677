// this demo sorts keyvals whose count lives in a gpu buffer: the init shader
// sizes all dispatches on-device and the heavy stages run indirectly
use std::fmt::Debug;

use ash::vk;
use vk_sort::{utils::Context, BufferInfo, GpuSorter, SortIndirectInfo, Target};

fn run<T: bytemuck::Pod + From<u32> + Debug>(ctx: &Context, sorter: &GpuSorter, key_bits: u32) {
    let n = 10u32;
    let keys_scrambled: Vec<T> = (0..n).rev().map(T::from).collect();

    let reqs = sorter.memory_requirements(n);
    let keyvals_even = ctx.alloc(reqs.keyvals_size, vk::BufferUsageFlags::empty());
    let keyvals_odd = ctx.alloc(reqs.keyvals_size, vk::BufferUsageFlags::empty());
    let internal = ctx.alloc(reqs.internal_size, vk::BufferUsageFlags::empty());
    let indirect = ctx.alloc(reqs.indirect_size, vk::BufferUsageFlags::INDIRECT_BUFFER);
    let count_buffer = ctx.alloc(4, vk::BufferUsageFlags::empty());
    ctx.upload(&keyvals_even, &keys_scrambled);
    // the host never tells the recording how many keys there are; only this
    // buffer knows
    ctx.upload(&count_buffer, &[n]);

    println!("before: {keys_scrambled:?}");

    let mut info = SortIndirectInfo {
        ext: None,
        key_bits,
        count_buffer: ctx.buffer_info(&count_buffer),
        keyvals_even: ctx.buffer_info(&keyvals_even),
        keyvals_odd: ctx.buffer_info(&keyvals_odd),
        internal: ctx.buffer_info(&internal),
        indirect: ctx.buffer_info(&indirect),
    };
    let mut sorted = BufferInfo::default();
    ctx.onetime_submit(|cmd| {
        sorted = unsafe { sorter.sort_indirect(ctx.device(), cmd, &mut info) };
    });

    let keys_sorted: Vec<T> = if sorted.devaddr == keyvals_even.devaddr {
        ctx.download(&keyvals_even, n as usize)
    } else {
        ctx.download(&keyvals_odd, n as usize)
    };
    println!("after:  {keys_sorted:?}");

    ctx.destroy_buffer(keyvals_even);
    ctx.destroy_buffer(keyvals_odd);
    ctx.destroy_buffer(internal);
    ctx.destroy_buffer(indirect);
    ctx.destroy_buffer(count_buffer);
}

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VK_SORT_TARGET").ok())
        .expect("usage: sort_indirect <target archive> (or set VK_SORT_TARGET)");
    let blob = std::fs::read(&path).expect("could not read the target archive");
    let target = Target::open(&blob).expect("could not decode the target archive");
    if !target.is_indirect() {
        eprintln!("this target does not bundle the init/fill stages; use the sort demo instead");
        return;
    }

    let ctx = Context::new(&target).expect("no Vulkan device offers the target's capabilities");
    let sorter = unsafe { GpuSorter::new(ctx.device(), None, vk::PipelineCache::null(), &target) }
        .expect("could not build the sort pipelines");

    match target.keyval_dwords() {
        1 => run::<u32>(&ctx, &sorter, 32),
        _ => run::<u64>(&ctx, &sorter, 64),
    }

    unsafe { sorter.destroy(ctx.device(), None) };
}
