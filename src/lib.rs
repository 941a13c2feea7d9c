//! Opacity micromap lifecycle management for a ray-traced renderer.
//!
//! Opacity micromaps (OMMs) encode per-micro-triangle opacity so alpha-tested
//! and alpha-blended geometry can be resolved in hardware during ray
//! traversal instead of through any-hit shading. Producing one is expensive:
//! opacity is baked from material textures and fixed-function stage state
//! into bit arrays, built into a device micromap object, synchronized and
//! then bound to acceleration structure geometry.
//!
//! This crate manages that lifecycle for a whole scene: content-hashed
//! deduplication and caching, admission heuristics, per-frame bake and build
//! throughput budgets, a device memory budget with LRU eviction and deferred
//! release, and the bind points the renderer calls while building
//! acceleration structures. The GPU itself sits behind the narrow traits in
//! [`gpu`], so the cache logic is backend-agnostic and testable.
//!
//! Per-frame driving sequence on [`manager::OpacityMicromapManager`]:
//!
//! 1. `on_frame_start` - budget refresh, eviction, counter reset
//! 2. `register_opacity_micromap_build_request` per eligible instance
//! 3. `build_opacity_micromaps` - records bake dispatches and builds
//! 4. `try_bind_opacity_micromap` per geometry while building BLASes
//! 5. `on_blas_build` - synchronizes freshly built micromaps

pub mod cache;
pub mod error;
pub mod gpu;
pub mod hash;
pub mod instance;
pub mod manager;
pub mod memory;
pub mod order_list;
pub mod request;
pub mod settings;

mod utils;

pub use cache::{CacheState, CachedSourceData, InstanceOmmRequests, OpacityMicromapCacheItem};
pub use error::OmmResult;
pub use gpu::{
    BakeDispatchDesc, BakingState, BarrierKind, BlasOmmAttachment, BlasOmmBuffers, BufferDesc,
    BufferUsage, CommandList, DeviceMemoryStats, DeviceSize, GeometryDesc, GpuBuffer, GpuError,
    IndexType, MicromapBuildInfo, MicromapBuildSizes, MicromapDevice, MicromapHandle,
    MicromapTriangleDesc, MicromapUsage, OmmFormat, ResourceAccess, MAX_FRAMES_IN_FLIGHT,
};
pub use instance::{
    AlphaState, AlphaTestType, Billboard, BlendType, InstanceId, InstanceRegistry, MaterialType,
    RtInstance, SurfaceState, TextureArgSource, TextureOperation, TextureRef,
};
pub use manager::{OpacityMicromapManager, OpacityMicromapStats};
pub use memory::OpacityMicromapMemoryManager;
pub use order_list::{OrderList, OrderToken};
pub use request::OmmRequest;
pub use settings::OpacityMicromapSettings;
