//! Target archives: self-describing bundles of one configuration header plus
//! the SPIR-V modules for one (vendor, architecture, keyval-width) triple.
//!
//! Archives are compiled offline and loaded as read-only blobs. The layout is
//! bit-exact:
//!
//! ```text
//! offset 0:            { magic: u32, count: u32 }
//! offset 8:            count entries of { offset: u64, size: u64 }
//! offset 8 + 16*count: payload region; entry i starts at its declared offset
//! ```
//!
//! Entry 0 is the target header, entries `1..count` are SPIR-V modules in
//! pipeline order. All payload offsets are 4-byte multiples.

use std::ffi::CStr;
use std::mem;

use ash::vk;

use crate::{Result, SortError, RADIX_LOG2};

/// leading magic of every target archive, reads `b"TRGT"` on disk
pub const ARCHIVE_MAGIC: u32 = 0x5447_5254;

/// magic of the embedded sort header (entry 0), reads `b"SORT"` on disk
pub const HEADER_MAGIC: u32 = 0x5452_4F53;

const ARCHIVE_HEADER_BYTES: usize = 8;
const ENTRY_BYTES: usize = 16;

/// Vulkan device extensions a target may declare, in bitmap bit order.
const EXTENSIONS: [&CStr; 3] = [
    ash::ext::subgroup_size_control::NAME,
    ash::khr::pipeline_executable_properties::NAME,
    ash::khr::shader_non_semantic_info::NAME,
];

const EXT_SUBGROUP_SIZE_CONTROL_BIT: u32 = 1 << 0;

/// number of Vulkan 1.0 feature bits, followed by 1.1, followed by 1.2
const FEATURES_10: u32 = 1;
const FEATURES_11: u32 = 1;
const FEATURES_12: u32 = 5;

/// Workgroup geometry of the `init` stage (indirect targets only).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InitConfig {
    pub workgroup_size_log2: u32,
}

/// Workgroup geometry of the `fill` stage (indirect targets only).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FillConfig {
    pub workgroup_size_log2: u32,
    pub block_rows: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HistogramConfig {
    pub workgroup_size_log2: u32,
    pub subgroup_size_log2: u32,
    pub block_rows: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PrefixConfig {
    pub workgroup_size_log2: u32,
    pub subgroup_size_log2: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScatterConfig {
    pub workgroup_size_log2: u32,
    pub subgroup_size_log2: u32,
    pub block_rows: u32,
}

/// Per-target tuning knobs. All sizes are log2; `keyval_dwords` selects
/// 32-bit (1) or 64-bit (2) key-values.
///
/// The record always carries all five stage sub-records. Direct-only targets
/// leave `init`/`fill` zeroed and omit their SPIR-V entries from the archive.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TargetConfig {
    pub keyval_dwords: u32,
    pub init: InitConfig,
    pub fill: FillConfig,
    pub histogram: HistogramConfig,
    pub prefix: PrefixConfig,
    pub scatter: ScatterConfig,
}

/// Typed view over archive entry 0.
///
/// The bitmaps pack one bit per declared extension/feature, LSB-first in
/// declaration order. Feature bits are partitioned 1.0 / 1.1 / 1.2.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TargetHeader {
    pub magic: u32,
    pub extensions: [u32; 1],
    pub features: [u32; 1],
    pub config: TargetConfig,
}

/// Everything the caller must enable on the Vulkan device before a target's
/// pipelines can run. Obtained from [`Target::requirements`].
///
/// `ext_names` is in the target's declaration order; the three feature
/// structs have exactly the booleans set that the target declares and can be
/// chained into `VkDeviceCreateInfo` as-is.
#[derive(Clone, Debug, Default)]
pub struct DeviceRequirements {
    pub ext_names: Vec<&'static CStr>,
    pub features: vk::PhysicalDeviceFeatures,
    pub features11: vk::PhysicalDeviceVulkan11Features<'static>,
    pub features12: vk::PhysicalDeviceVulkan12Features<'static>,
}

/// A decoded target archive. Borrows the caller's blob; the blob must stay
/// alive and unmodified while the target (or a sorter created from it) reads
/// SPIR-V out of it.
pub struct Target<'a> {
    header: TargetHeader,
    entries: Vec<&'a [u8]>,
    is_indirect: bool,
}

impl<'a> Target<'a> {
    /// Decodes and validates an archive. The blob must be 4-byte aligned.
    ///
    /// Archives are trusted data compiled offline; validation covers magics,
    /// bounds and the configuration record, not adversarial inputs.
    pub fn open(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < ARCHIVE_HEADER_BYTES {
            return Err(SortError::Truncated);
        }
        if read_u32(bytes, 0) != ARCHIVE_MAGIC {
            return Err(SortError::InvalidMagic);
        }
        let count = read_u32(bytes, 4) as usize;
        if count == 0 {
            return Err(SortError::Truncated);
        }

        let payload_base = ARCHIVE_HEADER_BYTES + count * ENTRY_BYTES;
        if bytes.len() < payload_base {
            return Err(SortError::Truncated);
        }
        let payloads = &bytes[payload_base..];

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let record = ARCHIVE_HEADER_BYTES + i * ENTRY_BYTES;
            let offset = read_u64(bytes, record) as usize;
            let size = read_u64(bytes, record + 8) as usize;
            let payload = offset
                .checked_add(size)
                .and_then(|end| payloads.get(offset..end))
                .ok_or(SortError::Truncated)?;
            entries.push(payload);
        }

        let header = parse_header(entries[0])?;
        let is_indirect = validate_config(&header.config, count - 1)?;

        Ok(Self {
            header,
            entries,
            is_indirect,
        })
    }

    pub fn header(&self) -> &TargetHeader {
        &self.header
    }

    pub fn config(&self) -> &TargetConfig {
        &self.header.config
    }

    /// 1 for 32-bit key-values, 2 for 64-bit
    pub fn keyval_dwords(&self) -> u32 {
        self.header.config.keyval_dwords
    }

    /// whether the archive bundles the init/fill stages for indirect dispatch
    pub fn is_indirect(&self) -> bool {
        self.is_indirect
    }

    pub(crate) fn has_subgroup_size_control(&self) -> bool {
        self.header.extensions[0] & EXT_SUBGROUP_SIZE_CONTROL_BIT != 0
    }

    /// SPIR-V payload of pipeline `i`, in pipeline order
    pub(crate) fn spirv(&self, i: usize) -> &'a [u8] {
        self.entries[i + 1]
    }

    /// number of pipelines bundled in the archive
    pub(crate) fn pipeline_count(&self) -> usize {
        self.entries.len() - 1
    }

    /// Derives the extensions and physical-device features the caller must
    /// enable before creating the device this target will run on.
    ///
    /// Names come out in the target's declaration order. Calling this twice
    /// yields identical results; the target is never mutated.
    pub fn requirements(&self) -> DeviceRequirements {
        let mut req = DeviceRequirements::default();

        for (i, name) in EXTENSIONS.iter().enumerate() {
            if self.header.extensions[i / 32] & (1 << (i % 32)) != 0 {
                req.ext_names.push(*name);
            }
        }

        let total = FEATURES_10 + FEATURES_11 + FEATURES_12;
        for bit in 0..total {
            if self.header.features[(bit / 32) as usize] & (1 << (bit % 32)) == 0 {
                continue;
            }
            set_feature(&mut req, bit);
        }

        return req;
    }
}

/// Maps feature bit `bit` (1.0 ∪ 1.1 ∪ 1.2 declaration order) onto the
/// corresponding boolean of the ash feature structs.
fn set_feature(req: &mut DeviceRequirements, bit: u32) {
    match bit {
        // Vulkan 1.0
        0 => req.features.shader_int64 = vk::TRUE,
        // Vulkan 1.1
        1 => req.features11.storage_buffer16_bit_access = vk::TRUE,
        // Vulkan 1.2
        2 => req.features12.buffer_device_address = vk::TRUE,
        3 => req.features12.vulkan_memory_model = vk::TRUE,
        4 => req.features12.vulkan_memory_model_device_scope = vk::TRUE,
        5 => req.features12.shader_subgroup_extended_types = vk::TRUE,
        6 => req.features12.shader_buffer_int64_atomics = vk::TRUE,
        _ => unreachable!("feature bit {bit} outside the declared sets"),
    }
}

/// Reads the header out of entry 0 by value. Payloads are only guaranteed
/// 4-byte aligned, so the bytes are memcpy'd rather than cast.
fn parse_header(payload: &[u8]) -> Result<TargetHeader> {
    let size = mem::size_of::<TargetHeader>();
    let bytes = payload.get(..size).ok_or(SortError::Truncated)?;
    let header: TargetHeader = bytemuck::pod_read_unaligned(bytes);
    if header.magic != HEADER_MAGIC {
        return Err(SortError::InvalidMagic);
    }
    Ok(header)
}

/// Checks the configuration record against the archive's module count and
/// returns whether the target supports indirect dispatch.
fn validate_config(config: &TargetConfig, pipeline_count: usize) -> Result<bool> {
    if config.keyval_dwords != 1 && config.keyval_dwords != 2 {
        return Err(SortError::InvalidTarget);
    }

    // The partitions region is laid out directly after the histograms on a
    // radix-row boundary; a subgroup wider than one radix row would need a
    // different alignment rule. No shipping target does this.
    let max_sg_log2 = config
        .histogram
        .subgroup_size_log2
        .max(config.prefix.subgroup_size_log2)
        .max(config.scatter.subgroup_size_log2);
    if max_sg_log2 > RADIX_LOG2 {
        return Err(SortError::InvalidTarget);
    }

    let scatter_pipes = 2 * config.keyval_dwords as usize;
    if pipeline_count == 2 + scatter_pipes {
        Ok(false)
    } else if pipeline_count == 4 + scatter_pipes {
        Ok(true)
    } else {
        Err(SortError::InvalidTarget)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// assembles an archive blob the way the offline compiler lays it out
    pub(crate) fn build_archive(header: &TargetHeader, modules: &[Vec<u8>]) -> Vec<u8> {
        let mut payloads: Vec<Vec<u8>> = vec![bytemuck::bytes_of(header).to_vec()];
        payloads.extend(modules.iter().cloned());

        let count = payloads.len();
        let mut blob = Vec::new();
        blob.extend_from_slice(&ARCHIVE_MAGIC.to_ne_bytes());
        blob.extend_from_slice(&(count as u32).to_ne_bytes());

        let mut offset = 0u64;
        let mut region = Vec::new();
        for payload in &payloads {
            blob.extend_from_slice(&offset.to_ne_bytes());
            blob.extend_from_slice(&(payload.len() as u64).to_ne_bytes());
            region.extend_from_slice(payload);
            let aligned = (payload.len() + 3) & !3;
            region.resize(region.len() + aligned - payload.len(), 0);
            offset += aligned as u64;
        }
        blob.extend_from_slice(&region);
        blob
    }

    pub(crate) fn test_header(keyval_dwords: u32) -> TargetHeader {
        TargetHeader {
            magic: HEADER_MAGIC,
            // subgroup size control + non-semantic info
            extensions: [0b101],
            // shader_int64 (64-bit only) | buffer_device_address | vulkan_memory_model
            features: [if keyval_dwords == 2 { 0b1101 } else { 0b1100 }],
            config: TargetConfig {
                keyval_dwords,
                init: InitConfig {
                    workgroup_size_log2: 5,
                },
                fill: FillConfig {
                    workgroup_size_log2: 7,
                    block_rows: 4,
                },
                histogram: HistogramConfig {
                    workgroup_size_log2: 8,
                    subgroup_size_log2: 5,
                    block_rows: 15,
                },
                prefix: PrefixConfig {
                    workgroup_size_log2: 8,
                    subgroup_size_log2: 5,
                },
                scatter: ScatterConfig {
                    workgroup_size_log2: 8,
                    subgroup_size_log2: 5,
                    block_rows: 15,
                },
            },
        }
    }

    fn fake_modules(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 16]).collect()
    }

    #[test]
    fn opens_direct_u32_target() {
        let blob = build_archive(&test_header(1), &fake_modules(4));
        let target = Target::open(&blob).unwrap();
        assert_eq!(target.keyval_dwords(), 1);
        assert!(!target.is_indirect());
        assert_eq!(target.pipeline_count(), 4);
        assert_eq!(target.spirv(2), &[2u8; 16][..]);
    }

    #[test]
    fn opens_indirect_u64_target() {
        let blob = build_archive(&test_header(2), &fake_modules(8));
        let target = Target::open(&blob).unwrap();
        assert_eq!(target.keyval_dwords(), 2);
        assert!(target.is_indirect());
        assert_eq!(target.pipeline_count(), 8);
    }

    #[test]
    fn rejects_archive_magic_mismatch() {
        let mut blob = build_archive(&test_header(1), &fake_modules(4));
        blob[0] ^= 0xFF;
        assert!(matches!(Target::open(&blob), Err(SortError::InvalidMagic)));
    }

    #[test]
    fn rejects_header_magic_mismatch() {
        let mut header = test_header(1);
        header.magic = 0xDEAD_BEEF;
        let blob = build_archive(&header, &fake_modules(4));
        assert!(matches!(Target::open(&blob), Err(SortError::InvalidMagic)));
    }

    #[test]
    fn rejects_truncated_blobs() {
        let blob = build_archive(&test_header(1), &fake_modules(4));
        for len in [0, 4, 8, 24, blob.len() - 1] {
            assert!(
                matches!(Target::open(&blob[..len]), Err(SortError::Truncated)),
                "length {len} must not decode"
            );
        }
    }

    #[test]
    fn rejects_bad_keyval_dwords() {
        let mut header = test_header(1);
        header.config.keyval_dwords = 3;
        let blob = build_archive(&header, &fake_modules(4));
        assert!(matches!(Target::open(&blob), Err(SortError::InvalidTarget)));
    }

    #[test]
    fn rejects_unexpected_module_count() {
        // 5 modules is neither direct (4) nor indirect (6) for 32-bit keyvals
        let blob = build_archive(&test_header(1), &fake_modules(5));
        assert!(matches!(Target::open(&blob), Err(SortError::InvalidTarget)));
    }

    #[test]
    fn rejects_oversized_subgroup() {
        let mut header = test_header(1);
        header.config.scatter.subgroup_size_log2 = RADIX_LOG2 + 1;
        let blob = build_archive(&header, &fake_modules(4));
        assert!(matches!(Target::open(&blob), Err(SortError::InvalidTarget)));
    }

    #[test]
    fn requirements_match_popcount_and_order() {
        let blob = build_archive(&test_header(1), &fake_modules(4));
        let target = Target::open(&blob).unwrap();

        let req = target.requirements();
        let popcount = target.header().extensions[0].count_ones() as usize;
        assert_eq!(req.ext_names.len(), popcount);
        assert_eq!(req.ext_names[0], ash::ext::subgroup_size_control::NAME);
        assert_eq!(req.ext_names[1], ash::khr::shader_non_semantic_info::NAME);

        // a second call is identical; there is no state between calls
        assert_eq!(req.ext_names, target.requirements().ext_names);
    }

    #[test]
    fn requirements_set_exactly_the_declared_features() {
        let blob = build_archive(&test_header(2), &fake_modules(8));
        let target = Target::open(&blob).unwrap();

        let req = target.requirements();
        assert_eq!(req.features.shader_int64, vk::TRUE);
        assert_eq!(req.features11.storage_buffer16_bit_access, vk::FALSE);
        assert_eq!(req.features12.buffer_device_address, vk::TRUE);
        assert_eq!(req.features12.vulkan_memory_model, vk::TRUE);
        assert_eq!(req.features12.vulkan_memory_model_device_scope, vk::FALSE);
        assert_eq!(req.features12.shader_subgroup_extended_types, vk::FALSE);
        assert_eq!(req.features12.shader_buffer_int64_atomics, vk::FALSE);
    }

    #[test]
    fn header_layout_is_fixed() {
        assert_eq!(mem::size_of::<TargetHeader>(), 60);
        assert_eq!(mem::offset_of!(TargetHeader, extensions), 4);
        assert_eq!(mem::offset_of!(TargetHeader, features), 8);
        assert_eq!(mem::offset_of!(TargetHeader, config), 12);
        assert_eq!(mem::offset_of!(TargetConfig, histogram), 16);
        assert_eq!(mem::offset_of!(TargetConfig, scatter), 36);
    }
}
