//! Dispatch info builder: work geometry validation and normalization
//!
//! [`DispatchInfo::build`] is the single place enqueue-time geometry is
//! validated; everything it returns fits the 32-bit walker fields, so the
//! codec never sees an out-of-range value.

pub mod walker;

use crate::config::DeviceConfig;
use crate::error::{BindError, DispatchError};
use crate::kernel::{DispatchTraits, KernelDescriptor, PatchBuffer, PatchLocation};

pub use walker::{WalkerGeometry, generate_local_ids};

/// Device limits the builder validates against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_work_group_size: u32,
    pub max_work_item_sizes: [u32; 3],
    pub max_threads_per_group: u32,
}

impl DeviceLimits {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            max_work_group_size: config.max_work_group_size,
            max_work_item_sizes: config.max_work_item_sizes,
            max_threads_per_group: config.family.max_threads_per_group(),
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

/// Normalized, validated dispatch geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchInfo {
    pub work_dim: u32,
    pub global_offset: [u64; 3],
    pub global_size: [u64; 3],
    /// `None` when neither the caller nor the kernel fixed a local size
    pub local_size: Option<[u32; 3]>,
    /// Whether the local size came from the kernel's required work-group size
    pub required_local_size: bool,
}

/// One uniform piece of a dispatch, programmed as a single walker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRegion {
    pub group_start: [u32; 3],
    pub group_count: [u32; 3],
    pub local_size: [u32; 3],
}

/// One past the largest global id a 4-byte built-in patch can carry
const TRAIT_ID_LIMIT: u64 = 1 << 32;

impl DispatchInfo {
    /// Validate and normalize enqueue-time geometry
    ///
    /// Dimensions at or above `work_dim` are normalized to size 1, offset 0.
    pub fn build(
        descriptor: &KernelDescriptor,
        limits: &DeviceLimits,
        work_dim: u32,
        global_size: [u64; 3],
        global_offset: [u64; 3],
        local_size: Option<[u32; 3]>,
    ) -> Result<Self, DispatchError> {
        if !(1..=3).contains(&work_dim) {
            return Err(DispatchError::InvalidWorkDimension(work_dim));
        }
        let dims = work_dim as usize;

        let mut global = [1u64; 3];
        let mut offset = [0u64; 3];
        for dim in 0..dims {
            let size = global_size[dim];
            if size == 0 || size > u32::MAX as u64 {
                return Err(DispatchError::InvalidGlobalWorkSize { dim, size });
            }
            // work-item built-ins are patched as 32-bit values, so the last
            // global id must fit in 32 bits
            match global_offset[dim].checked_add(size) {
                Some(end) if end <= TRAIT_ID_LIMIT => {}
                _ => return Err(DispatchError::InvalidGlobalOffset { dim }),
            }
            global[dim] = size;
            offset[dim] = global_offset[dim];
        }

        let normalize = |size: [u32; 3]| {
            let mut out = [1u32; 3];
            out[..dims].copy_from_slice(&size[..dims]);
            out
        };

        let (local, required_local_size) = match (descriptor.required_work_group_size, local_size) {
            (Some(required), None) => (Some(required), true),
            (Some(required), Some(supplied)) => {
                if normalize(supplied) != required {
                    return Err(DispatchError::InvalidWorkGroupSize(
                        "local size does not match the required work-group size",
                    ));
                }
                (Some(required), true)
            }
            (None, Some(supplied)) => (Some(normalize(supplied)), false),
            (None, None) => (None, false),
        };

        if let Some(local) = local {
            if local.contains(&0) {
                return Err(DispatchError::InvalidWorkGroupSize("local size is zero"));
            }
            for dim in 0..3 {
                let limit = limits.max_work_item_sizes[dim];
                if local[dim] > limit {
                    return Err(DispatchError::InvalidWorkItemSize {
                        dim,
                        size: local[dim],
                        limit,
                    });
                }
            }
            let remainder: u64 = (0..3).map(|dim| global[dim] % local[dim] as u64).sum();
            if remainder != 0 && !descriptor.flags.allows_non_uniform_work_groups {
                return Err(DispatchError::InvalidWorkGroupSize(
                    "global size is not a multiple of the local size",
                ));
            }
            let items: u64 = local.iter().map(|&l| l as u64).product();
            if items > descriptor.work_group_limit(limits.max_work_group_size) as u64 {
                return Err(DispatchError::InvalidWorkGroupSize(
                    "work-group exceeds the maximum work-group size",
                ));
            }
        }

        log::debug!(
            "dispatch '{}': dim {work_dim}, global {global:?}, offset {offset:?}, local {local:?}",
            descriptor.name
        );
        Ok(Self {
            work_dim,
            global_offset: offset,
            global_size: global,
            local_size: local,
            required_local_size,
        })
    }

    /// Local size to program: the validated one, or a heuristic choice
    pub fn effective_local_size(&self, descriptor: &KernelDescriptor, limits: &DeviceLimits) -> [u32; 3] {
        match self.local_size {
            Some(local) => local,
            None => choose_local_size(
                self.global_size,
                self.work_dim,
                max_group_items(descriptor, limits),
                limits.max_work_item_sizes,
            ),
        }
    }

    /// Work-groups per dimension, counting partial groups
    pub fn group_count(&self, local: [u32; 3]) -> [u32; 3] {
        std::array::from_fn(|dim| self.global_size[dim].div_ceil(local[dim] as u64) as u32)
    }

    /// Split the dispatch into uniform regions
    ///
    /// A uniform dispatch yields one region. Otherwise every dimension with a
    /// partial trailing group contributes a second slice, giving up to
    /// `2^work_dim` regions.
    pub fn regions(&self, local: [u32; 3]) -> Vec<DispatchRegion> {
        let mut slices: [Vec<(u32, u32, u32)>; 3] = Default::default();
        for dim in 0..3 {
            let size = self.global_size[dim];
            let full = (size / local[dim] as u64) as u32;
            let rem = (size % local[dim] as u64) as u32;
            if full > 0 {
                slices[dim].push((0, full, local[dim]));
            }
            if rem > 0 {
                slices[dim].push((full, 1, rem));
            }
        }

        let mut regions = Vec::new();
        for &(sx, cx, lx) in &slices[0] {
            for &(sy, cy, ly) in &slices[1] {
                for &(sz, cz, lz) in &slices[2] {
                    regions.push(DispatchRegion {
                        group_start: [sx, sy, sz],
                        group_count: [cx, cy, cz],
                        local_size: [lx, ly, lz],
                    });
                }
            }
        }
        regions
    }

    /// Write the work-item built-ins for `region` into a parameter block copy
    pub fn patch_traits(
        &self,
        traits: &DispatchTraits,
        region: &DispatchRegion,
        enqueued_local: [u32; 3],
        block: &mut PatchBuffer,
    ) -> Result<(), BindError> {
        let groups = self.group_count(enqueued_local);
        let values: [(&[Option<u32>; 3], [u64; 3]); 5] = [
            (&traits.global_offset, self.global_offset),
            (&traits.global_size, self.global_size),
            (&traits.local_size, region.local_size.map(u64::from)),
            (&traits.enqueued_local_size, enqueued_local.map(u64::from)),
            (&traits.num_groups, groups.map(u64::from)),
        ];
        for (offsets, value) in values {
            for (offset, value) in offsets.iter().zip(value) {
                if let Some(offset) = offset {
                    block.write_patch(PatchLocation::new(*offset, 4), value)?;
                }
            }
        }
        if let Some(offset) = traits.work_dim {
            block.write_patch(PatchLocation::new(offset, 4), self.work_dim as u64)?;
        }
        Ok(())
    }
}

/// Largest work-group the heuristic may pick: bounded by what the kernel's
/// SIMD width can cover with the per-group thread limit
pub fn max_group_items(descriptor: &KernelDescriptor, limits: &DeviceLimits) -> u32 {
    let simd_limit = descriptor.simd.width() * limits.max_threads_per_group;
    descriptor
        .work_group_limit(limits.max_work_group_size)
        .min(simd_limit)
}

/// Pick a local size that divides the global size, filling dimension 0 first
pub fn choose_local_size(
    global_size: [u64; 3],
    work_dim: u32,
    max_items: u32,
    max_item_sizes: [u32; 3],
) -> [u32; 3] {
    let mut local = [1u32; 3];
    let mut remaining = max_items.max(1);
    for dim in 0..work_dim.min(3) as usize {
        let bound = remaining.min(max_item_sizes[dim]) as u64;
        let size = global_size[dim];
        let divisor = (1..=bound.min(size))
            .rev()
            .find(|d| size % d == 0)
            .unwrap_or(1) as u32;
        local[dim] = divisor;
        remaining /= divisor;
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn descriptor(required: Option<[u32; 3]>, non_uniform: bool) -> std::sync::Arc<KernelDescriptor> {
        let mut builder = KernelDescriptor::builder("k").with_parameter_block_size(64);
        if let Some(required) = required {
            builder = builder.with_required_work_group_size(required);
        }
        if non_uniform {
            builder = builder.allow_non_uniform_work_groups();
        }
        builder.build().unwrap()
    }

    #[rstest]
    #[case([64, 64, 1], Some([8, 8, 1]), false, true)]
    #[case([64, 64, 1], Some([4, 8, 1]), false, false)]
    #[case([10, 8, 1], Some([8, 8, 1]), false, false)]
    #[case([10, 8, 1], Some([8, 8, 1]), true, true)]
    fn test_required_work_group_size(
        #[case] global: [u64; 3],
        #[case] local: Option<[u32; 3]>,
        #[case] non_uniform: bool,
        #[case] ok: bool,
    ) {
        let descriptor = descriptor(Some([8, 8, 1]), non_uniform);
        let result = DispatchInfo::build(&descriptor, &DeviceLimits::default(), 2, global, [0; 3], local);
        assert_eq!(result.is_ok(), ok, "{result:?}");
        if let Err(err) = result {
            assert!(matches!(err, DispatchError::InvalidWorkGroupSize(_)));
        }
    }

    #[test]
    fn test_required_size_used_when_unset() {
        let descriptor = descriptor(Some([8, 8, 1]), false);
        let info =
            DispatchInfo::build(&descriptor, &DeviceLimits::default(), 2, [16, 16, 1], [0; 3], None).unwrap();
        assert_eq!(info.local_size, Some([8, 8, 1]));
        assert!(info.required_local_size);
    }

    #[test]
    fn test_unset_local_size_left_to_caller() {
        let descriptor = descriptor(None, false);
        let info =
            DispatchInfo::build(&descriptor, &DeviceLimits::default(), 1, [100, 7, 7], [3, 9, 9], None).unwrap();
        assert_eq!(info.local_size, None);
        assert_eq!(info.global_size, [100, 1, 1]);
        assert_eq!(info.global_offset, [3, 0, 0]);
        assert_eq!(info.effective_local_size(&descriptor, &DeviceLimits::default()), [100, 1, 1]);
    }

    #[rstest]
    #[case(0, [1, 1, 1], DispatchError::InvalidWorkDimension(0))]
    #[case(4, [1, 1, 1], DispatchError::InvalidWorkDimension(4))]
    #[case(1, [0, 1, 1], DispatchError::InvalidGlobalWorkSize { dim: 0, size: 0 })]
    #[case(2, [1, 1 << 32, 1], DispatchError::InvalidGlobalWorkSize { dim: 1, size: 1 << 32 })]
    fn test_geometry_errors(#[case] work_dim: u32, #[case] global: [u64; 3], #[case] expected: DispatchError) {
        let descriptor = descriptor(None, false);
        let err = DispatchInfo::build(&descriptor, &DeviceLimits::default(), work_dim, global, [0; 3], None)
            .unwrap_err();
        assert_eq!(err, expected);
    }

    #[test]
    fn test_offset_overflow() {
        let descriptor = descriptor(None, false);
        let err = DispatchInfo::build(&descriptor, &DeviceLimits::default(), 1, [16, 1, 1], [u64::MAX, 0, 0], None)
            .unwrap_err();
        assert_eq!(err, DispatchError::InvalidGlobalOffset { dim: 0 });
    }

    #[rstest]
    #[case([1 << 32, 0, 0], [1, 1, 1], Some(0))]
    #[case([u32::MAX as u64, 0, 0], [2, 1, 1], Some(0))]
    #[case([0, (1 << 32) - 16, 0], [1, 16, 1], None)]
    #[case([u32::MAX as u64, 0, 0], [1, 1, 1], None)]
    fn test_offset_beyond_32_bit_ids(
        #[case] offset: [u64; 3],
        #[case] global: [u64; 3],
        #[case] rejected_dim: Option<usize>,
    ) {
        let descriptor = descriptor(None, false);
        let result = DispatchInfo::build(&descriptor, &DeviceLimits::default(), 2, global, offset, None);
        match rejected_dim {
            Some(dim) => assert_eq!(result.unwrap_err(), DispatchError::InvalidGlobalOffset { dim }),
            None => assert_eq!(result.unwrap().global_offset, offset),
        }
    }

    #[test]
    fn test_largest_offset_reaches_parameter_block() {
        let traits = DispatchTraits {
            global_offset: [Some(0), None, None],
            ..Default::default()
        };
        let descriptor = descriptor(None, false);
        let offset = u32::MAX as u64 - 7;
        let info = DispatchInfo::build(&descriptor, &DeviceLimits::default(), 1, [8, 1, 1], [offset, 0, 0], Some([8, 1, 1]))
            .unwrap();
        let region = info.regions([8, 1, 1])[0];
        let mut block = PatchBuffer::new(4);
        info.patch_traits(&traits, &region, [8, 1, 1], &mut block).unwrap();
        assert_eq!(block.read_u32(0).unwrap() as u64, offset);
    }

    #[test]
    fn test_work_group_limits() {
        let descriptor = descriptor(None, false);
        let limits = DeviceLimits {
            max_work_group_size: 256,
            ..DeviceLimits::default()
        };
        let err = DispatchInfo::build(&descriptor, &limits, 2, [512, 512, 1], [0; 3], Some([32, 16, 1]))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidWorkGroupSize(_)));
        let err = DispatchInfo::build(&descriptor, &limits, 1, [4096, 1, 1], [0; 3], Some([2048, 1, 1]))
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::InvalidWorkItemSize {
                dim: 0,
                size: 2048,
                limit: 1024
            }
        );
    }

    #[test]
    fn test_choose_local_size() {
        assert_eq!(choose_local_size([1024, 1, 1], 1, 256, [1024; 3]), [256, 1, 1]);
        assert_eq!(choose_local_size([100, 64, 1], 2, 256, [1024; 3]), [100, 2, 1]);
        assert_eq!(choose_local_size([17, 1, 1], 1, 256, [1024; 3]), [17, 1, 1]);
        assert_eq!(choose_local_size([997 * 2, 1, 1], 1, 256, [1024; 3]), [2, 1, 1]);
    }

    #[test]
    fn test_regions_non_uniform() {
        let descriptor = descriptor(None, true);
        let info = DispatchInfo::build(
            &descriptor,
            &DeviceLimits::default(),
            2,
            [10, 20, 1],
            [0; 3],
            Some([8, 8, 1]),
        )
        .unwrap();
        let regions = info.regions([8, 8, 1]);
        assert_eq!(regions.len(), 4);
        assert_eq!(regions[0].group_count, [1, 2, 1]);
        assert_eq!(regions[3].group_start, [1, 2, 0]);
        assert_eq!(regions[3].local_size, [2, 4, 1]);
        let covered: u64 = regions
            .iter()
            .map(|r| {
                (0..3)
                    .map(|d| r.group_count[d] as u64 * r.local_size[d] as u64)
                    .product::<u64>()
            })
            .sum();
        assert_eq!(covered, 200);
        assert_eq!(info.group_count([8, 8, 1]), [2, 3, 1]);
    }

    #[test]
    fn test_patch_traits() {
        let traits = DispatchTraits {
            global_size: [Some(0), Some(4), None],
            local_size: [Some(8), None, None],
            num_groups: [Some(12), None, None],
            work_dim: Some(16),
            ..Default::default()
        };
        let descriptor = descriptor(None, false);
        let info =
            DispatchInfo::build(&descriptor, &DeviceLimits::default(), 2, [64, 4, 1], [0; 3], Some([16, 4, 1]))
                .unwrap();
        let region = info.regions([16, 4, 1])[0];
        let mut block = PatchBuffer::new(20);
        info.patch_traits(&traits, &region, [16, 4, 1], &mut block).unwrap();
        assert_eq!(block.read_u32(0).unwrap(), 64);
        assert_eq!(block.read_u32(4).unwrap(), 4);
        assert_eq!(block.read_u32(8).unwrap(), 16);
        assert_eq!(block.read_u32(12).unwrap(), 4);
        assert_eq!(block.read_u32(16).unwrap(), 2);
    }
}
