//! Device-facing contracts for opacity micromap baking and building.
//!
//! The cache manager never talks to a graphics API directly. It drives two
//! narrow traits: [`MicromapDevice`] for allocations and capability queries,
//! and [`CommandList`] for recording bake dispatches, micromap builds,
//! barriers and resource lifetime tracking. The renderer backend implements
//! both; tests use the mock implementations in `gpu::mock`.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::instance::{MaterialType, TextureRef};

/// Frames of GPU work that may be in flight at once.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 2;

/// Alignment of baked opacity array buffers.
pub const OMM_BUFFER_ALIGNMENT: u64 = 16;
/// Alignment of micromap storage buffers.
pub const MICROMAP_BUFFER_ALIGNMENT: u64 = 256;

pub type DeviceSize = u64;

/// Encoding of per-micro-triangle opacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OmmFormat {
    /// Opaque / transparent. 1 bit per micro-triangle.
    TwoState,
    /// Adds unknown-opaque / unknown-transparent. 2 bits per micro-triangle.
    FourState,
}

impl OmmFormat {
    pub fn bits_per_micro_triangle(self) -> u64 {
        match self {
            OmmFormat::TwoState => 1,
            OmmFormat::FourState => 2,
        }
    }

    /// Wire value stored in [`MicromapTriangleDesc::format`].
    pub fn wire_value(self) -> u16 {
        match self {
            OmmFormat::TwoState => 1,
            OmmFormat::FourState => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn stride(self) -> u32 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// Opaque handle to a device buffer, with its accounted byte size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuBuffer {
    pub id: u64,
    pub size: DeviceSize,
}

/// Opaque handle to a built micromap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicromapHandle(pub u64);

/// What a buffer is for; lets a backend pick usage flags and memory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Bake target holding raw opacity bit arrays.
    OpacityArray,
    /// Per-triangle descriptor input to the micromap build.
    MicromapBuildInput,
    /// Backing storage for a micromap object.
    MicromapStorage,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: DeviceSize,
    pub alignment: u64,
    pub usage: BufferUsage,
}

/// One homogeneous usage group within a micromap build.
#[derive(Debug, Clone, Copy)]
pub struct MicromapUsage {
    pub count: u32,
    pub subdivision_level: u16,
    pub format: OmmFormat,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MicromapBuildSizes {
    pub micromap_size: DeviceSize,
    pub build_scratch_size: DeviceSize,
}

/// Aggregated device-local memory numbers, as reported by the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceMemoryStats {
    /// Total device-local memory.
    pub device_local_size: DeviceSize,
    /// OS-advised budget, or 0 when the driver reports none.
    pub device_local_budget: DeviceSize,
    pub device_local_used: DeviceSize,
}

impl DeviceMemoryStats {
    /// Memory the cache may consider allocatable from.
    pub fn allocatable_size(&self) -> DeviceSize {
        if self.device_local_budget > 0 {
            self.device_local_budget
        } else {
            self.device_local_size
        }
    }
}

/// Per-triangle micromap build input. Matches the device wire layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MicromapTriangleDesc {
    /// Byte offset of the triangle's opacity data within the array buffer.
    pub data_offset: u32,
    pub subdivision_level: u16,
    pub format: u16,
}

const_assert_eq!(std::mem::size_of::<MicromapTriangleDesc>(), 8);

/// Progress of a resumable bake across frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct BakingState {
    pub micro_triangles_to_bake: u32,
    pub micro_triangles_baked: u32,
    pub micro_triangles_baked_in_last_dispatch: u32,
}

impl BakingState {
    pub fn is_complete(&self) -> bool {
        self.micro_triangles_to_bake > 0
            && self.micro_triangles_baked >= self.micro_triangles_to_bake
    }
}

/// Parameters of one bake dispatch over a triangle range.
pub struct BakeDispatchDesc<'a> {
    pub subdivision_level: u16,
    pub micro_triangles_per_triangle: u32,
    pub format: OmmFormat,
    pub material_type: MaterialType,
    pub apply_vertex_and_texture_operations: bool,
    pub use_conservative_estimation: bool,
    pub conservative_estimation_max_texel_taps: u32,
    /// Throughput budget left for this frame; the dispatch must not exceed it.
    pub max_micro_triangles_to_bake: u32,
    pub num_triangles: u32,
    pub triangle_offset: u32,
    pub resolve_transparency_threshold: f32,
    pub resolve_opaqueness_threshold: f32,
    pub opacity_texture: &'a TextureRef,
    pub secondary_opacity_texture: Option<&'a TextureRef>,
}

/// Everything a backend needs to record one micromap build.
#[derive(Debug, Clone)]
pub struct MicromapBuildInfo {
    pub usage: MicromapUsage,
    pub dst_micromap: MicromapHandle,
    /// Baked opacity data consumed by the build.
    pub array_buffer: GpuBuffer,
    /// Per-triangle [`MicromapTriangleDesc`] records.
    pub triangle_array_buffer: GpuBuffer,
    pub scratch_size: DeviceSize,
}

/// Micromap attachment parameters for an acceleration structure geometry.
#[derive(Debug, Clone)]
pub struct BlasOmmAttachment {
    pub micromap: MicromapHandle,
    pub index_type: IndexType,
    pub index_stride: u32,
    pub base_triangle: u32,
}

/// GPU objects a bound micromap keeps alive.
#[derive(Debug)]
pub struct BlasOmmBuffers {
    pub micromap: MicromapHandle,
    pub micromap_buffer: GpuBuffer,
    pub triangle_index_buffer: GpuBuffer,
    pub attachment: BlasOmmAttachment,
}

/// Acceleration structure geometry the manager binds micromaps into.
#[derive(Debug, Default)]
pub struct GeometryDesc {
    pub opacity_micromap: Option<Arc<BlasOmmBuffers>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAccess {
    Read,
    Write,
}

/// Pipeline barriers the micromap lifecycle needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Baked array and triangle descriptor uploads -> micromap build reads.
    TransferToMicromapBuild,
    /// Micromap builds -> acceleration structure build reads.
    MicromapBuildToAccelStructBuild,
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("out of device memory allocating {size} bytes for {label}")]
    OutOfDeviceMemory { label: &'static str, size: DeviceSize },
    #[error("micromap object creation failed: {reason}")]
    MicromapCreation { reason: String },
}

/// Allocation and capability surface of the micromap-capable device.
pub trait MicromapDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer, GpuError>;
    fn create_micromap(
        &self,
        storage: &GpuBuffer,
        size: DeviceSize,
    ) -> Result<MicromapHandle, GpuError>;
    fn micromap_build_sizes(&self, usage: &MicromapUsage) -> MicromapBuildSizes;
    fn max_subdivision_level(&self, format: OmmFormat) -> u16;
    fn memory_stats(&self) -> DeviceMemoryStats;
    fn supports_opacity_micromaps(&self) -> bool;
}

/// Command recording surface the manager drives each frame.
pub trait CommandList {
    /// Keeps a buffer alive until this command list's GPU work completes.
    fn track_buffer(&mut self, buffer: &GpuBuffer, access: ResourceAccess);
    /// Keeps a bound micromap's buffers alive likewise.
    fn track_omm_buffers(&mut self, buffers: &Arc<BlasOmmBuffers>, access: ResourceAccess);
    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: DeviceSize, data: &[u8]);
    /// Records one bake dispatch and advances `state` by the number of
    /// micro-triangles actually baked.
    fn dispatch_bake(
        &mut self,
        desc: &BakeDispatchDesc<'_>,
        state: &mut BakingState,
        target: &GpuBuffer,
    );
    fn build_micromaps(&mut self, builds: &[MicromapBuildInfo]);
    fn memory_barrier(&mut self, barrier: BarrierKind);
}

#[cfg(test)]
pub(crate) mod mock;
