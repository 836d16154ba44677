#![doc = include_str!("../README.md")]
/*
    This crate implements the host side of a gpu radix sort. A good introduction to general
    purpose radix sort can be found here: http://www.codercorner.com/RadixSortRevisited.htm

    The algorithm is the decoupled-lookback radix sort from the fuchsia repos:
    https://fuchsia.googlesource.com/fuchsia/+/refs/heads/main/src/graphics/lib/compute/radix_sort/
    driven here through raw Vulkan 1.2 (ash). The shaders themselves are opaque SPIR-V
    payloads shipped inside per-device target archives, see src/target.rs.
*/

use std::io::Cursor;
use std::mem;
use std::slice;

use ash::vk;
use bytemuck::bytes_of;

mod target;
pub mod utils;

pub use target::{
    DeviceRequirements, FillConfig, HistogramConfig, InitConfig, PrefixConfig, ScatterConfig,
    Target, TargetConfig, TargetHeader, ARCHIVE_MAGIC, HEADER_MAGIC,
};

// IMPORTANT: the following constants are fixed by the shader contract and have to stay in
// sync with every shipped target.

/// we sort 8 bits per pass
pub const RADIX_LOG2: u32 = 8;

/// 256 entries into the radix table
pub const RADIX_SIZE: u32 = 1 << RADIX_LOG2;

/// largest number of keyvals a single sort supports
pub const MAX_KEYVALS: u32 = (1 << 30) - 1;

/// bytes of one histogram row (256 dword counters)
const RADIX_ROW_BYTES: u32 = RADIX_SIZE * 4;

#[derive(thiserror::Error, Debug)]
pub enum SortError {
    /// archive or embedded header magic mismatch
    #[error("target magic mismatch")]
    InvalidMagic,

    /// the blob ends before the data it declares
    #[error("target archive truncated")]
    Truncated,

    /// the header decodes but describes a configuration this engine rejects
    #[error("target declares an unsupported configuration")]
    InvalidTarget,

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

pub type Result<T> = std::result::Result<T, SortError>;

/// One buffer extent handed to the sorter: the handle/offset pair is used for
/// transfer commands, the device address by the shaders. Addresses are read
/// during recording and never cached.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferInfo {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub devaddr: vk::DeviceAddress,
}

/// Writes a timestamp at every logical stage boundary of a sort until
/// `capacity` queries have been issued. Read `next_index` back after
/// recording to learn how many were written.
#[derive(Clone, Copy, Debug)]
pub struct TimestampProbe {
    pub query_pool: vk::QueryPool,
    pub capacity: u32,
    pub next_index: u32,
}

/// Optional per-sort extensions. A closed sum instead of a pointer chain:
/// the sorter dispatches on the variant, unknown kinds cannot exist.
#[derive(Clone, Copy, Debug)]
pub enum SortExt {
    Timestamps(TimestampProbe),
}

/// Parameters of one direct-dispatch sort recording.
///
/// `keyvals_even`, `keyvals_odd` and `internal` must not alias each other.
/// `count` must not exceed the count the buffers were sized with.
#[derive(Debug)]
pub struct SortInfo {
    pub ext: Option<SortExt>,
    /// how many high bits of each keyval participate in the sort
    pub key_bits: u32,
    pub count: u32,
    pub keyvals_even: BufferInfo,
    pub keyvals_odd: BufferInfo,
    pub internal: BufferInfo,
}

/// Parameters of one indirect-dispatch sort recording. The keyval count is
/// read from `count_buffer` on the device; `indirect` holds an
/// [`IndirectInfo`] record written by the init stage.
#[derive(Debug)]
pub struct SortIndirectInfo {
    pub ext: Option<SortExt>,
    pub key_bits: u32,
    /// holds the keyval count as a u32, 4-byte aligned
    pub count_buffer: BufferInfo,
    pub keyvals_even: BufferInfo,
    pub keyvals_odd: BufferInfo,
    pub internal: BufferInfo,
    pub indirect: BufferInfo,
}

/// Fill parameters computed on-device by the init stage and consumed by the
/// fill stage.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndirectInfoFill {
    pub block_offset: u32,
    pub dword_offset_min: u32,
    pub dword_offset_max: u32,
    pub reserved: u32,
}

/// One `VkDispatchIndirectCommand` per stage, padded to 16 bytes so every
/// dispatch offset stays u32vec4-aligned.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndirectInfoDispatch {
    pub pad: [u32; 4],
    pub zero: [u32; 4],
    pub histogram: [u32; 4],
    pub scatter: [u32; 4],
}

/// Layout of the caller's `indirect` extent. Shared contract between the
/// init shader and the dispatch recording below.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct IndirectInfo {
    pub pad: IndirectInfoFill,
    pub zero: IndirectInfoFill,
    pub dispatch: IndirectInfoDispatch,
}

const INDIRECT_FILL_PAD: u64 = mem::offset_of!(IndirectInfo, pad) as u64;
const INDIRECT_FILL_ZERO: u64 = mem::offset_of!(IndirectInfo, zero) as u64;
const INDIRECT_DISPATCH_PAD: u64 =
    (mem::offset_of!(IndirectInfo, dispatch) + mem::offset_of!(IndirectInfoDispatch, pad)) as u64;
const INDIRECT_DISPATCH_ZERO: u64 =
    (mem::offset_of!(IndirectInfo, dispatch) + mem::offset_of!(IndirectInfoDispatch, zero)) as u64;
const INDIRECT_DISPATCH_HISTOGRAM: u64 = (mem::offset_of!(IndirectInfo, dispatch)
    + mem::offset_of!(IndirectInfoDispatch, histogram)) as u64;
const INDIRECT_DISPATCH_SCATTER: u64 = (mem::offset_of!(IndirectInfo, dispatch)
    + mem::offset_of!(IndirectInfoDispatch, scatter)) as u64;

/// Sizes and alignments the caller must satisfy when allocating the sort
/// extents. All alignments are powers of two; sizes are padded so a
/// same-class buffer can follow immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub keyvals_size: vk::DeviceSize,
    pub keyvals_alignment: vk::DeviceSize,
    pub internal_size: vk::DeviceSize,
    pub internal_alignment: vk::DeviceSize,
    /// zero for targets without indirect support
    pub indirect_size: vk::DeviceSize,
    pub indirect_alignment: vk::DeviceSize,
}

// push-constant contracts, written by the host and read by the shaders

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct InitPush {
    devaddr_info: u64,
    devaddr_count: u64,
    passes: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FillPush {
    devaddr_info: u64,
    devaddr_dwords: u64,
    dword: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct HistogramPush {
    devaddr_histograms: u64,
    devaddr_keyvals: u64,
    passes: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PrefixPush {
    devaddr_histograms: u64,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ScatterPush {
    devaddr_keyvals_even: u64,
    devaddr_keyvals_odd: u64,
    devaddr_partitions: u64,
    devaddr_histograms: u64,
    pass_offset: u32,
    _pad: u32,
}

/// byte offset of the fields re-pushed between scatter passes
const SCATTER_RESUME_OFFSET: u32 = mem::offset_of!(ScatterPush, devaddr_histograms) as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Init,
    Fill,
    Histogram,
    Prefix,
    Scatter,
}

impl Stage {
    fn push_size(self) -> u32 {
        let size = match self {
            Stage::Init => mem::size_of::<InitPush>(),
            Stage::Fill => mem::size_of::<FillPush>(),
            Stage::Histogram => mem::size_of::<HistogramPush>(),
            Stage::Prefix => mem::size_of::<PrefixPush>(),
            Stage::Scatter => mem::size_of::<ScatterPush>(),
        };
        size as u32
    }

    /// zero means the stage runs at whatever subgroup size the driver picks
    fn subgroup_size_log2(self, config: &TargetConfig) -> u32 {
        match self {
            Stage::Init | Stage::Fill => 0,
            Stage::Histogram => config.histogram.subgroup_size_log2,
            Stage::Prefix => config.prefix.subgroup_size_log2,
            Stage::Scatter => config.scatter.subgroup_size_log2,
        }
    }
}

/// pipeline order inside an archive: [init, fill,] histogram, prefix, then
/// one even/odd scatter pair per keyval dword
fn stage_table(is_indirect: bool, keyval_dwords: u32) -> Vec<Stage> {
    let mut stages = Vec::new();
    if is_indirect {
        stages.push(Stage::Init);
        stages.push(Stage::Fill);
    }
    stages.push(Stage::Histogram);
    stages.push(Stage::Prefix);
    for _ in 0..2 * keyval_dwords {
        stages.push(Stage::Scatter);
    }
    return stages;
}

const PIPE_INIT: usize = 0;
const PIPE_FILL: usize = 1;

/// Sorting engine for one target. It can be shared read-only between threads
/// recording into distinct command buffers; it performs no synchronization
/// and never touches a queue.
pub struct GpuSorter {
    config: TargetConfig,
    is_indirect: bool,
    pipeline_layouts: Vec<vk::PipelineLayout>,
    pipelines: Vec<vk::Pipeline>,
    histograms_offset: vk::DeviceSize,
    partitions_offset: vk::DeviceSize,
}

impl GpuSorter {
    /// Builds every pipeline layout and compute pipeline of the target,
    /// compiling the bundled SPIR-V through the caller's pipeline cache.
    ///
    /// On any Vulkan failure everything created so far is released and the
    /// error is returned; no partial engine exists. The device, allocator
    /// and cache stay owned by the caller and must outlive the sorter.
    ///
    /// # Safety
    ///
    /// `device` must be a live device created with the capabilities reported
    /// by [`Target::requirements`].
    pub unsafe fn new(
        device: &ash::Device,
        allocator: Option<&vk::AllocationCallbacks<'_>>,
        pipeline_cache: vk::PipelineCache,
        target: &Target<'_>,
    ) -> Result<Self> {
        let config = *target.config();
        let is_indirect = target.is_indirect();
        let stages = stage_table(is_indirect, config.keyval_dwords);
        debug_assert_eq!(stages.len(), target.pipeline_count());

        let mut pipeline_layouts = Vec::with_capacity(stages.len());
        for stage in &stages {
            let push_range = vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .offset(0)
                .size(stage.push_size());
            let create_info = vk::PipelineLayoutCreateInfo::default()
                .push_constant_ranges(slice::from_ref(&push_range));
            match device.create_pipeline_layout(&create_info, allocator) {
                Ok(layout) => pipeline_layouts.push(layout),
                Err(err) => {
                    release(device, allocator, &pipeline_layouts, &[], &[]);
                    return Err(err.into());
                }
            }
        }

        let mut shader_modules = Vec::with_capacity(stages.len());
        for i in 0..stages.len() {
            let words = match ash::util::read_spv(&mut Cursor::new(target.spirv(i))) {
                Ok(words) => words,
                Err(_) => {
                    release(device, allocator, &pipeline_layouts, &shader_modules, &[]);
                    return Err(SortError::InvalidTarget);
                }
            };
            let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
            match device.create_shader_module(&create_info, allocator) {
                Ok(module) => shader_modules.push(module),
                Err(err) => {
                    release(device, allocator, &pipeline_layouts, &shader_modules, &[]);
                    return Err(err.into());
                }
            }
        }

        // Pin the subgroup size wherever the target tuned the stage for one;
        // without the extension the shaders must cope with the driver's pick.
        let require_subgroup_size = target.has_subgroup_size_control();
        let mut subgroup_infos: Vec<_> = stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageRequiredSubgroupSizeCreateInfoEXT::default()
                    .required_subgroup_size(1 << stage.subgroup_size_log2(&config))
            })
            .collect();

        let mut create_infos = Vec::with_capacity(stages.len());
        for (i, subgroup_info) in subgroup_infos.iter_mut().enumerate() {
            let mut stage_info = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(shader_modules[i])
                .name(c"main");
            if require_subgroup_size && stages[i].subgroup_size_log2(&config) != 0 {
                stage_info = stage_info
                    .flags(vk::PipelineShaderStageCreateFlags::REQUIRE_FULL_SUBGROUPS_EXT)
                    .push_next(subgroup_info);
            }
            create_infos.push(
                vk::ComputePipelineCreateInfo::default()
                    .stage(stage_info)
                    .layout(pipeline_layouts[i]),
            );
        }

        let pipelines = device.create_compute_pipelines(pipeline_cache, &create_infos, allocator);
        drop(create_infos);

        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err((partial, err)) => {
                release(device, allocator, &pipeline_layouts, &shader_modules, &partial);
                return Err(err.into());
            }
        };

        for module in shader_modules {
            device.destroy_shader_module(module, allocator);
        }

        let keyval_bytes = config.keyval_dwords as u64 * 4;
        let histograms_offset = 0;
        let partitions_offset = keyval_bytes * RADIX_ROW_BYTES as u64;

        Ok(Self {
            config,
            is_indirect,
            pipeline_layouts,
            pipelines,
            histograms_offset,
            partitions_offset,
        })
    }

    /// Releases every pipeline and pipeline layout. The caller's device,
    /// allocator and pipeline cache are untouched.
    ///
    /// # Safety
    ///
    /// `device` and `allocator` must be the ones the sorter was created
    /// with, and no recorded sort may still be executing.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        allocator: Option<&vk::AllocationCallbacks<'_>>,
    ) {
        release(device, allocator, &self.pipeline_layouts, &[], &self.pipelines);
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// whether [`GpuSorter::sort_indirect`] is available on this target
    pub fn is_indirect(&self) -> bool {
        self.is_indirect
    }

    /// Computes the sizes and alignments of the sort extents for at most
    /// `count` keyvals. Pure; `count == 0` yields zero sizes but the real
    /// alignments, so callers can reserve address ranges up front.
    pub fn memory_requirements(&self, count: u32) -> MemoryRequirements {
        plan_memory(&self.config, self.is_indirect, count)
    }

    /// Records a sort of `info.count` keyvals whose count is known host-side.
    ///
    /// Returns the extent that will hold the sorted keyvals once the command
    /// buffer executes. With `count <= 1` or `key_bits == 0` nothing is
    /// recorded and `keyvals_even` is returned as-is.
    ///
    /// No barrier is emitted after the final scatter; the caller owns the
    /// hand-off to whatever consumes the result.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state, the extents must be sized per
    /// [`GpuSorter::memory_requirements`] for a count >= `info.count`, and
    /// none of the extents may alias.
    pub unsafe fn sort(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        info: &mut SortInfo,
    ) -> BufferInfo {
        debug_assert!(info.count <= MAX_KEYVALS);

        if info.count <= 1 || info.key_bits == 0 {
            return info.keyvals_even;
        }
        debug_assert_ne!(
            info.keyvals_even.devaddr, info.keyvals_odd.devaddr,
            "keyval extents must not alias"
        );

        let config = &self.config;
        let keyval_bytes = config.keyval_dwords * 4;
        let passes = pass_count(config, info.key_bits);
        let mut pass_idx = keyval_bytes - passes;

        let keyvals_sorted = if passes % 2 == 0 {
            info.keyvals_even
        } else {
            info.keyvals_odd
        };

        let scatter_blocks = scatter_blocks_ru(config, info.count);
        let histo_blocks = histo_blocks_ru(config, info.count);
        let count_ru_histo = histo_blocks * histo_block_kvs(config);

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::TOP_OF_PIPE);

        // pad the keyval extent with synthetic maxima; the sort is stable so
        // they all land behind the real keys and are cut off by `count`
        if count_ru_histo > info.count {
            device.cmd_fill_buffer(
                cmd,
                info.keyvals_even.buffer,
                info.keyvals_even.offset + info.count as u64 * keyval_bytes as u64,
                (count_ru_histo - info.count) as u64 * keyval_bytes as u64,
                0xFFFF_FFFF,
            );
        }

        // one fill zeroes the histogram rows this sort uses and marks every
        // partition slot invalid: the rows start at pass_idx and the
        // partitions sit directly behind the last row
        device.cmd_fill_buffer(
            cmd,
            info.internal.buffer,
            info.internal.offset + self.histograms_offset + row_bytes(pass_idx),
            (passes + scatter_blocks - 1) as u64 * RADIX_ROW_BYTES as u64,
            0,
        );

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::TRANSFER);
        transfer_to_compute_barrier(device, cmd);

        let histogram_push = HistogramPush {
            devaddr_histograms: info.internal.devaddr + self.histograms_offset,
            devaddr_keyvals: info.keyvals_even.devaddr,
            passes,
            _pad: 0,
        };
        self.push_and_bind(device, cmd, self.histogram_idx(), bytes_of(&histogram_push));
        device.cmd_dispatch(cmd, histo_blocks, 1, 1);

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::COMPUTE_SHADER);
        compute_to_compute_barrier(device, cmd);

        let prefix_push = PrefixPush {
            devaddr_histograms: info.internal.devaddr + self.histograms_offset + row_bytes(pass_idx),
        };
        self.push_and_bind(device, cmd, self.prefix_idx(), bytes_of(&prefix_push));
        device.cmd_dispatch(cmd, passes, 1, 1);

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::COMPUTE_SHADER);
        compute_to_compute_barrier(device, cmd);

        let mut scatter_push = ScatterPush {
            devaddr_keyvals_even: info.keyvals_even.devaddr,
            devaddr_keyvals_odd: info.keyvals_odd.devaddr,
            devaddr_partitions: info.internal.devaddr + self.partitions_offset,
            devaddr_histograms: info.internal.devaddr + self.histograms_offset + row_bytes(pass_idx),
            pass_offset: (pass_idx % 4) * RADIX_LOG2,
            _pad: 0,
        };
        let mut is_even = true;
        self.push_and_bind(
            device,
            cmd,
            self.scatter_idx(pass_idx, is_even),
            bytes_of(&scatter_push),
        );

        loop {
            device.cmd_dispatch(cmd, scatter_blocks, 1, 1);
            probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::COMPUTE_SHADER);

            pass_idx += 1;
            if pass_idx == keyval_bytes {
                break;
            }
            compute_to_compute_barrier(device, cmd);

            is_even = !is_even;
            scatter_push.devaddr_histograms += RADIX_ROW_BYTES as u64;
            scatter_push.pass_offset = (pass_idx % 4) * RADIX_LOG2;

            // the keyval and partition addresses never change mid-sort, so
            // only the tail of the push struct is refreshed
            let idx = self.scatter_idx(pass_idx, is_even);
            device.cmd_push_constants(
                cmd,
                self.pipeline_layouts[idx],
                vk::ShaderStageFlags::COMPUTE,
                SCATTER_RESUME_OFFSET,
                &bytes_of(&scatter_push)[SCATTER_RESUME_OFFSET as usize..],
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipelines[idx]);
        }

        return keyvals_sorted;
    }

    /// Records a sort whose keyval count lives in `info.count_buffer` on the
    /// device. Block counts are computed by the bundled init shader and all
    /// heavy stages dispatch indirectly off `info.indirect`.
    ///
    /// # Safety
    ///
    /// Same as [`GpuSorter::sort`]; additionally the target must bundle the
    /// init/fill stages and `info.indirect` must be sized per
    /// [`MemoryRequirements::indirect_size`].
    pub unsafe fn sort_indirect(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        info: &mut SortIndirectInfo,
    ) -> BufferInfo {
        debug_assert!(self.is_indirect, "target does not bundle init/fill stages");

        if info.key_bits == 0 {
            return info.keyvals_even;
        }
        debug_assert_ne!(
            info.keyvals_even.devaddr, info.keyvals_odd.devaddr,
            "keyval extents must not alias"
        );

        let config = &self.config;
        let keyval_bytes = config.keyval_dwords * 4;
        let passes = pass_count(config, info.key_bits);
        let mut pass_idx = keyval_bytes - passes;

        let keyvals_sorted = if passes % 2 == 0 {
            info.keyvals_even
        } else {
            info.keyvals_odd
        };

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::TOP_OF_PIPE);

        let init_push = InitPush {
            devaddr_info: info.indirect.devaddr,
            devaddr_count: info.count_buffer.devaddr,
            passes,
            _pad: 0,
        };
        self.push_and_bind(device, cmd, PIPE_INIT, bytes_of(&init_push));
        device.cmd_dispatch(cmd, 1, 1, 1);

        compute_to_indirect_barrier(device, cmd);

        // pad + zero mirror the two buffer fills of the direct form, but run
        // on the fill pipeline with block counts the init stage just wrote
        let pad_push = FillPush {
            devaddr_info: info.indirect.devaddr + INDIRECT_FILL_PAD,
            devaddr_dwords: info.keyvals_even.devaddr,
            dword: 0xFFFF_FFFF,
            _pad: 0,
        };
        self.push_and_bind(device, cmd, PIPE_FILL, bytes_of(&pad_push));
        device.cmd_dispatch_indirect(
            cmd,
            info.indirect.buffer,
            info.indirect.offset + INDIRECT_DISPATCH_PAD,
        );

        let zero_push = FillPush {
            devaddr_info: info.indirect.devaddr + INDIRECT_FILL_ZERO,
            devaddr_dwords: info.internal.devaddr + self.histograms_offset + row_bytes(pass_idx),
            dword: 0,
            _pad: 0,
        };
        self.push_and_bind(device, cmd, PIPE_FILL, bytes_of(&zero_push));
        device.cmd_dispatch_indirect(
            cmd,
            info.indirect.buffer,
            info.indirect.offset + INDIRECT_DISPATCH_ZERO,
        );

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::COMPUTE_SHADER);
        compute_to_compute_barrier(device, cmd);

        let histogram_push = HistogramPush {
            devaddr_histograms: info.internal.devaddr + self.histograms_offset,
            devaddr_keyvals: info.keyvals_even.devaddr,
            passes,
            _pad: 0,
        };
        self.push_and_bind(device, cmd, self.histogram_idx(), bytes_of(&histogram_push));
        device.cmd_dispatch_indirect(
            cmd,
            info.indirect.buffer,
            info.indirect.offset + INDIRECT_DISPATCH_HISTOGRAM,
        );

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::COMPUTE_SHADER);
        compute_to_compute_barrier(device, cmd);

        // passes is host-known, so prefix stays a direct dispatch
        let prefix_push = PrefixPush {
            devaddr_histograms: info.internal.devaddr + self.histograms_offset + row_bytes(pass_idx),
        };
        self.push_and_bind(device, cmd, self.prefix_idx(), bytes_of(&prefix_push));
        device.cmd_dispatch(cmd, passes, 1, 1);

        probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::COMPUTE_SHADER);
        compute_to_compute_barrier(device, cmd);

        let mut scatter_push = ScatterPush {
            devaddr_keyvals_even: info.keyvals_even.devaddr,
            devaddr_keyvals_odd: info.keyvals_odd.devaddr,
            devaddr_partitions: info.internal.devaddr + self.partitions_offset,
            devaddr_histograms: info.internal.devaddr + self.histograms_offset + row_bytes(pass_idx),
            pass_offset: (pass_idx % 4) * RADIX_LOG2,
            _pad: 0,
        };
        let mut is_even = true;
        self.push_and_bind(
            device,
            cmd,
            self.scatter_idx(pass_idx, is_even),
            bytes_of(&scatter_push),
        );

        loop {
            device.cmd_dispatch_indirect(
                cmd,
                info.indirect.buffer,
                info.indirect.offset + INDIRECT_DISPATCH_SCATTER,
            );
            probe(device, cmd, &mut info.ext, vk::PipelineStageFlags::COMPUTE_SHADER);

            pass_idx += 1;
            if pass_idx == keyval_bytes {
                break;
            }
            compute_to_compute_barrier(device, cmd);

            is_even = !is_even;
            scatter_push.devaddr_histograms += RADIX_ROW_BYTES as u64;
            scatter_push.pass_offset = (pass_idx % 4) * RADIX_LOG2;

            let idx = self.scatter_idx(pass_idx, is_even);
            device.cmd_push_constants(
                cmd,
                self.pipeline_layouts[idx],
                vk::ShaderStageFlags::COMPUTE,
                SCATTER_RESUME_OFFSET,
                &bytes_of(&scatter_push)[SCATTER_RESUME_OFFSET as usize..],
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipelines[idx]);
        }

        return keyvals_sorted;
    }

    unsafe fn push_and_bind(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        idx: usize,
        push: &[u8],
    ) {
        device.cmd_push_constants(
            cmd,
            self.pipeline_layouts[idx],
            vk::ShaderStageFlags::COMPUTE,
            0,
            push,
        );
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipelines[idx]);
    }

    fn pipeline_base(&self) -> usize {
        if self.is_indirect {
            2
        } else {
            0
        }
    }

    fn histogram_idx(&self) -> usize {
        self.pipeline_base()
    }

    fn prefix_idx(&self) -> usize {
        self.pipeline_base() + 1
    }

    /// `pass_idx / 4` selects the keyval dword being scattered
    fn scatter_idx(&self, pass_idx: u32, is_even: bool) -> usize {
        self.pipeline_base() + 2 + 2 * (pass_idx / 4) as usize + usize::from(!is_even)
    }
}

/// Destroys handles in reverse creation order; null pipeline handles (from a
/// failed batched creation) are skipped.
unsafe fn release(
    device: &ash::Device,
    allocator: Option<&vk::AllocationCallbacks<'_>>,
    pipeline_layouts: &[vk::PipelineLayout],
    shader_modules: &[vk::ShaderModule],
    pipelines: &[vk::Pipeline],
) {
    for &pipeline in pipelines {
        if pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(pipeline, allocator);
        }
    }
    for &module in shader_modules {
        device.destroy_shader_module(module, allocator);
    }
    for &layout in pipeline_layouts {
        device.destroy_pipeline_layout(layout, allocator);
    }
}

unsafe fn probe(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    ext: &mut Option<SortExt>,
    stage: vk::PipelineStageFlags,
) {
    if let Some(SortExt::Timestamps(probe)) = ext {
        if probe.next_index < probe.capacity {
            device.cmd_write_timestamp(cmd, stage, probe.query_pool, probe.next_index);
            probe.next_index += 1;
        }
    }
}

// The two barrier shapes the algorithm needs. Both are global memory
// barriers; the sort only ever touches storage buffers.

unsafe fn transfer_to_compute_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ);
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::DependencyFlags::empty(),
        slice::from_ref(&barrier),
        &[],
        &[],
    );
}

unsafe fn compute_to_compute_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::DependencyFlags::empty(),
        slice::from_ref(&barrier),
        &[],
        &[],
    );
}

/// after init: the indirect records feed both `vkCmdDispatchIndirect` and the
/// fill stage's shader reads
unsafe fn compute_to_indirect_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ);
    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::DependencyFlags::empty(),
        slice::from_ref(&barrier),
        &[],
        &[],
    );
}

fn row_bytes(rows: u32) -> u64 {
    rows as u64 * RADIX_ROW_BYTES as u64
}

fn pass_count(config: &TargetConfig, key_bits: u32) -> u32 {
    let keyval_bits = config.keyval_dwords * 32;
    key_bits.min(keyval_bits).div_ceil(RADIX_LOG2)
}

/// number of elements scattered by one workgroup
fn scatter_block_kvs(config: &TargetConfig) -> u32 {
    (1 << config.scatter.workgroup_size_log2) * config.scatter.block_rows
}

/// number of elements histogrammed by one workgroup
fn histo_block_kvs(config: &TargetConfig) -> u32 {
    (1 << config.histogram.workgroup_size_log2) * config.histogram.block_rows
}

fn scatter_blocks_ru(config: &TargetConfig, n: u32) -> u32 {
    n.div_ceil(scatter_block_kvs(config))
}

/// histogram blocks covering the scatter-rounded count
fn histo_blocks_ru(config: &TargetConfig, n: u32) -> u32 {
    (scatter_blocks_ru(config, n) * scatter_block_kvs(config)).div_ceil(histo_block_kvs(config))
}

fn plan_memory(config: &TargetConfig, is_indirect: bool, count: u32) -> MemoryRequirements {
    let keyval_bytes = config.keyval_dwords as u64 * 4;
    let histo_sg = 1u64 << config.histogram.subgroup_size_log2;
    let prefix_sg = 1u64 << config.prefix.subgroup_size_log2;
    let internal_sg = histo_sg.max(prefix_sg);

    let keyvals_alignment = keyval_bytes * histo_sg;
    let internal_alignment = 4 * internal_sg;
    let indirect_alignment = mem::size_of::<[u32; 4]>() as u64;

    if count == 0 {
        return MemoryRequirements {
            keyvals_size: 0,
            keyvals_alignment,
            internal_size: 0,
            internal_alignment,
            indirect_size: 0,
            indirect_alignment,
        };
    }

    // keyvals round up to whole histogram blocks, the coarser of the two
    // block sizes, so one sizing rule serves both dispatch modes
    let scatter_blocks = scatter_blocks_ru(config, count) as u64;
    let count_ru_histo = histo_blocks_ru(config, count) as u64 * histo_block_kvs(config) as u64;

    MemoryRequirements {
        keyvals_size: keyval_bytes * count_ru_histo,
        keyvals_alignment,
        // histogram rows plus one lookback slot per scatter block except the
        // last block, which never publishes a partition
        internal_size: (keyval_bytes + scatter_blocks - 1) * RADIX_ROW_BYTES as u64,
        internal_alignment,
        indirect_size: if is_indirect {
            mem::size_of::<IndirectInfo>() as u64
        } else {
            0
        },
        indirect_alignment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::tests::test_header;

    fn test_config() -> TargetConfig {
        test_header(1).config
    }

    fn test_config_u64() -> TargetConfig {
        test_header(2).config
    }

    #[test]
    fn zero_count_yields_zero_sizes_and_real_alignments() {
        let reqs = plan_memory(&test_config(), true, 0);
        assert_eq!(reqs.keyvals_size, 0);
        assert_eq!(reqs.internal_size, 0);
        assert_eq!(reqs.indirect_size, 0);
        assert_eq!(reqs.keyvals_alignment, 4 * 32);
        assert_eq!(reqs.internal_alignment, 4 * 32);
        assert_eq!(reqs.indirect_alignment, 16);
    }

    #[test]
    fn single_block_plan() {
        // 256 lanes * 15 rows = 3840 keyvals per block for both stages
        let reqs = plan_memory(&test_config(), false, 1024);
        assert_eq!(reqs.keyvals_size, 4 * 3840);
        assert_eq!(reqs.internal_size, 4 * 1024);
        assert_eq!(reqs.indirect_size, 0);
    }

    #[test]
    fn multi_block_plan_adds_partitions() {
        let reqs = plan_memory(&test_config(), true, 3841);
        assert_eq!(reqs.keyvals_size, 4 * 7680);
        // 4 histogram rows + 1 partition slot
        assert_eq!(reqs.internal_size, 5 * 1024);
        assert_eq!(reqs.indirect_size, mem::size_of::<IndirectInfo>() as u64);
    }

    #[test]
    fn plan_scales_with_keyval_width() {
        let reqs = plan_memory(&test_config_u64(), false, 1024);
        assert_eq!(reqs.keyvals_size, 8 * 3840);
        assert_eq!(reqs.keyvals_alignment, 8 * 32);
        assert_eq!(reqs.internal_size, 8 * 1024);
    }

    #[test]
    fn plan_invariants_hold_over_a_count_sweep() {
        let config = test_config();
        for count in [1, 2, 255, 3839, 3840, 3841, 100_000, 1 << 22] {
            let reqs = plan_memory(&config, true, count);
            assert_eq!(reqs.keyvals_size % reqs.keyvals_alignment, 0, "count {count}");
            assert!(reqs.internal_size >= 4 * RADIX_ROW_BYTES as u64);
            assert!(reqs.keyvals_alignment.is_power_of_two());
            assert!(reqs.internal_alignment.is_power_of_two());
            assert!(reqs.indirect_alignment.is_power_of_two());
            assert!(reqs.keyvals_size >= count as u64 * 4);
        }
    }

    #[test]
    fn pass_math_matches_key_bits() {
        let config = test_config();
        assert_eq!(pass_count(&config, 32), 4);
        assert_eq!(pass_count(&config, 8), 1);
        assert_eq!(pass_count(&config, 9), 2);
        // key_bits beyond the keyval width are clamped
        assert_eq!(pass_count(&config, 64), 4);
        assert_eq!(pass_count(&test_config_u64(), 64), 8);
        assert_eq!(pass_count(&test_config_u64(), 33), 5);
    }

    #[test]
    fn stage_tables_match_pipeline_counts() {
        assert_eq!(stage_table(false, 1).len(), 4);
        assert_eq!(stage_table(true, 1).len(), 6);
        assert_eq!(stage_table(false, 2).len(), 6);
        assert_eq!(stage_table(true, 2).len(), 8);
        assert_eq!(stage_table(true, 1)[0], Stage::Init);
        assert_eq!(stage_table(true, 1)[2], Stage::Histogram);
    }

    #[test]
    fn push_structs_match_the_shader_contract() {
        assert_eq!(mem::size_of::<InitPush>(), 24);
        assert_eq!(mem::size_of::<FillPush>(), 24);
        assert_eq!(mem::size_of::<HistogramPush>(), 24);
        assert_eq!(mem::size_of::<PrefixPush>(), 8);
        assert_eq!(mem::size_of::<ScatterPush>(), 40);
        assert_eq!(SCATTER_RESUME_OFFSET, 24);
    }

    #[test]
    fn indirect_info_offsets_are_vec4_aligned() {
        assert_eq!(mem::size_of::<IndirectInfo>(), 96);
        assert_eq!(INDIRECT_FILL_PAD, 0);
        assert_eq!(INDIRECT_FILL_ZERO, 16);
        assert_eq!(INDIRECT_DISPATCH_PAD, 32);
        assert_eq!(INDIRECT_DISPATCH_ZERO, 48);
        assert_eq!(INDIRECT_DISPATCH_HISTOGRAM, 64);
        assert_eq!(INDIRECT_DISPATCH_SCATTER, 80);
        for offset in [
            INDIRECT_DISPATCH_PAD,
            INDIRECT_DISPATCH_ZERO,
            INDIRECT_DISPATCH_HISTOGRAM,
            INDIRECT_DISPATCH_SCATTER,
        ] {
            assert_eq!(offset % 16, 0);
        }
    }
}
