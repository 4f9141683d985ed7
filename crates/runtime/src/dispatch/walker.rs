//! Walker geometry and driver-generated local IDs

use anvil_packets::prelude::SimdSize;

/// Thread layout of one work-group at a given SIMD width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerGeometry {
    pub simd: SimdSize,
    pub local_size: [u32; 3],
    pub threads_per_group: u32,
    /// Lanes enabled in the last thread of a group
    pub right_execution_mask: u32,
    pub bottom_execution_mask: u32,
}

impl WalkerGeometry {
    pub fn new(local_size: [u32; 3], simd: SimdSize) -> Self {
        let width = simd.width();
        let items: u32 = local_size.iter().product();
        let full_mask = lane_mask(width);
        let remainder = items % width;
        Self {
            simd,
            local_size,
            threads_per_group: items.div_ceil(width).max(1),
            right_execution_mask: if remainder == 0 {
                full_mask
            } else {
                lane_mask(remainder)
            },
            bottom_execution_mask: u32::MAX,
        }
    }

    pub fn items(&self) -> u32 {
        self.local_size.iter().product()
    }
}

fn lane_mask(lanes: u32) -> u32 {
    if lanes >= 32 { u32::MAX } else { (1 << lanes) - 1 }
}

/// Per-thread local-ID payload for generations without hardware local IDs
///
/// Each thread gets three blocks (x, y, z) of one `u16` per SIMD lane, every
/// block padded to a whole register. Lanes past the end of the work-group
/// are zero.
pub fn generate_local_ids(local_size: [u32; 3], simd: SimdSize, grf_size: u32) -> Vec<u8> {
    let width = simd.width() as usize;
    let block = (width * 2).div_ceil(grf_size as usize) * grf_size as usize;
    let [lx, ly, _] = local_size.map(|l| l.max(1) as usize);
    let items = local_size.iter().map(|&l| l.max(1) as usize).product::<usize>();
    let threads = items.div_ceil(width).max(1);

    let mut payload = vec![0u8; threads * block * 3];
    for thread in 0..threads {
        let base = thread * block * 3;
        for lane in 0..width {
            let linear = thread * width + lane;
            if linear >= items {
                break;
            }
            let ids = [linear % lx, (linear / lx) % ly, linear / (lx * ly)];
            for (dim, id) in ids.into_iter().enumerate() {
                let at = base + dim * block + lane * 2;
                payload[at..at + 2].copy_from_slice(&(id as u16).to_le_bytes());
            }
        }
    }
    payload
}

/// Bytes of local-ID payload per thread
pub fn local_id_bytes_per_thread(simd: SimdSize, grf_size: u32) -> u32 {
    (simd.width() * 2).div_ceil(grf_size) * grf_size * 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case([64, 1, 1], SimdSize::Simd16, 4, 0xFFFF)]
    #[case([10, 1, 1], SimdSize::Simd8, 2, 0b11)]
    #[case([5, 5, 1], SimdSize::Simd32, 1, 0x01FF_FFFF)]
    #[case([32, 2, 1], SimdSize::Simd32, 2, u32::MAX)]
    fn test_geometry(
        #[case] local: [u32; 3],
        #[case] simd: SimdSize,
        #[case] threads: u32,
        #[case] right_mask: u32,
    ) {
        let geometry = WalkerGeometry::new(local, simd);
        assert_eq!(geometry.threads_per_group, threads);
        assert_eq!(geometry.right_execution_mask, right_mask);
    }

    #[test]
    fn test_local_ids_layout() {
        let payload = generate_local_ids([4, 3, 1], SimdSize::Simd8, 32);
        // 12 items over SIMD8: two threads, three 32-byte blocks each
        assert_eq!(payload.len(), 2 * 3 * 32);
        assert_eq!(local_id_bytes_per_thread(SimdSize::Simd8, 32), 96);

        let read = |thread: usize, dim: usize, lane: usize| {
            let at = thread * 96 + dim * 32 + lane * 2;
            u16::from_le_bytes([payload[at], payload[at + 1]])
        };
        // lane 5 of thread 0 is work-item (1, 1, 0)
        assert_eq!((read(0, 0, 5), read(0, 1, 5), read(0, 2, 5)), (1, 1, 0));
        // lane 3 of thread 1 is work-item 11 = (3, 2, 0)
        assert_eq!((read(1, 0, 3), read(1, 1, 3)), (3, 2));
        // past the end of the group
        assert_eq!(read(1, 0, 4), 0);
    }
}
