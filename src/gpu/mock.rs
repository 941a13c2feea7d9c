//! In-memory device and command list doubles for cache tests.

use std::cell::Cell;
use std::sync::Arc;

use super::*;

/// Fake device with configurable capacity and a running allocation count.
pub struct MockDevice {
    pub memory: Cell<DeviceMemoryStats>,
    pub max_subdivision_level: u16,
    pub micromap_size_per_micro_triangle_bit: DeviceSize,
    /// When set, the next N buffer allocations fail.
    pub fail_next_allocations: Cell<u32>,
    next_buffer_id: Cell<u64>,
    next_micromap_id: Cell<u64>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            memory: Cell::new(DeviceMemoryStats {
                device_local_size: 8 << 30,
                device_local_budget: 8 << 30,
                device_local_used: 0,
            }),
            max_subdivision_level: 12,
            // Build output roughly mirrors the array data size.
            micromap_size_per_micro_triangle_bit: 1,
            fail_next_allocations: Cell::new(0),
            next_buffer_id: Cell::new(1),
            next_micromap_id: Cell::new(1),
        }
    }
}

impl MicromapDevice for MockDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer, GpuError> {
        let pending = self.fail_next_allocations.get();
        if pending > 0 {
            self.fail_next_allocations.set(pending - 1);
            return Err(GpuError::OutOfDeviceMemory {
                label: desc.label,
                size: desc.size,
            });
        }
        let id = self.next_buffer_id.get();
        self.next_buffer_id.set(id + 1);
        Ok(GpuBuffer {
            id,
            size: desc.size,
        })
    }

    fn create_micromap(
        &self,
        _storage: &GpuBuffer,
        _size: DeviceSize,
    ) -> Result<MicromapHandle, GpuError> {
        let id = self.next_micromap_id.get();
        self.next_micromap_id.set(id + 1);
        Ok(MicromapHandle(id))
    }

    fn micromap_build_sizes(&self, usage: &MicromapUsage) -> MicromapBuildSizes {
        let micro_triangles =
            usage.count as u64 * (1u64 << (2 * usage.subdivision_level as u64));
        let bits = micro_triangles * usage.format.bits_per_micro_triangle();
        let bytes = (bits + 7) / 8;
        MicromapBuildSizes {
            micromap_size: bytes * self.micromap_size_per_micro_triangle_bit,
            build_scratch_size: 256,
        }
    }

    fn max_subdivision_level(&self, _format: OmmFormat) -> u16 {
        self.max_subdivision_level
    }

    fn memory_stats(&self) -> DeviceMemoryStats {
        self.memory.get()
    }

    fn supports_opacity_micromaps(&self) -> bool {
        true
    }
}

/// Records the commands the manager emits so tests can assert on them.
#[derive(Default)]
pub struct MockCommandList {
    pub tracked_buffers: Vec<(u64, ResourceAccess)>,
    pub tracked_omm_buffers: Vec<(u64, ResourceAccess)>,
    pub buffer_writes: Vec<(u64, DeviceSize, usize)>,
    pub bake_dispatches: Vec<u32>,
    pub builds: Vec<usize>,
    pub barriers: Vec<BarrierKind>,
    /// Per-dispatch bake throughput cap, on top of the desc budget.
    pub micro_triangles_per_dispatch: Option<u32>,
}

impl CommandList for MockCommandList {
    fn track_buffer(&mut self, buffer: &GpuBuffer, access: ResourceAccess) {
        self.tracked_buffers.push((buffer.id, access));
    }

    fn track_omm_buffers(&mut self, buffers: &Arc<BlasOmmBuffers>, access: ResourceAccess) {
        self.tracked_omm_buffers.push((buffers.micromap.0, access));
    }

    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: DeviceSize, data: &[u8]) {
        self.buffer_writes.push((buffer.id, offset, data.len()));
    }

    fn dispatch_bake(
        &mut self,
        desc: &BakeDispatchDesc<'_>,
        state: &mut BakingState,
        _target: &GpuBuffer,
    ) {
        let remaining = state
            .micro_triangles_to_bake
            .saturating_sub(state.micro_triangles_baked);
        let mut baked = remaining.min(desc.max_micro_triangles_to_bake);
        if let Some(cap) = self.micro_triangles_per_dispatch {
            baked = baked.min(cap);
        }
        state.micro_triangles_baked += baked;
        state.micro_triangles_baked_in_last_dispatch = baked;
        self.bake_dispatches.push(baked);
    }

    fn build_micromaps(&mut self, builds: &[MicromapBuildInfo]) {
        self.builds.push(builds.len());
    }

    fn memory_barrier(&mut self, barrier: BarrierKind) {
        self.barriers.push(barrier);
    }
}
