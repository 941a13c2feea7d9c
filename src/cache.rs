//! Cache item and source data records for the opacity micromap cache.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::gpu::{BakingState, BlasOmmBuffers, DeviceSize, GpuBuffer, OmmFormat};
use crate::instance::{InstanceId, RtInstance};
use crate::order_list::OrderToken;
use crate::request::OmmRequest;

/// Lifecycle stage of a cache item. Ordered; early stages still need their
/// source geometry around, later ones are self-contained GPU objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheState {
    /// Admitted, no GPU work recorded yet.
    Unprocessed,
    /// Opacity array bake in progress, resumable across frames.
    Baking,
    /// Opacity array fully baked.
    Baked,
    /// Micromap object built this frame; a barrier must land before use.
    Built,
    /// Synchronized and bindable.
    Ready,
}

/// One cached micromap through its lifecycle.
#[derive(Debug)]
pub struct OpacityMicromapCacheItem {
    pub state: CacheState,
    /// Subdivision level actually baked, clamped to the device maximum.
    pub subdivision_level: u16,
    pub format: OmmFormat,
    pub num_triangles: u32,
    /// Whether the bake evaluated texture stage and vertex opacity inputs.
    /// Items baked under the opposite setting are stale.
    pub use_vertex_and_texture_operations: bool,
    pub last_use_frame_index: u32,
    /// Position in the eviction order.
    pub lru_token: OrderToken,
    /// Position in the current stage's processing list.
    pub stage_token: Option<OrderToken>,
    /// Baked opacity bit array. Present from the first bake dispatch until
    /// the micromap build consumes it.
    pub array_buffer: Option<GpuBuffer>,
    pub array_buffer_device_size: DeviceSize,
    /// Built micromap and the buffers it keeps alive.
    pub blas_buffers: Option<Arc<BlasOmmBuffers>>,
    pub blas_buffers_device_size: DeviceSize,
    pub baking: BakingState,
}

impl OpacityMicromapCacheItem {
    pub fn new(
        request: &OmmRequest,
        subdivision_level: u16,
        use_vertex_and_texture_operations: bool,
        current_frame_index: u32,
        stage_token: OrderToken,
        lru_token: OrderToken,
    ) -> Self {
        Self {
            state: CacheState::Unprocessed,
            subdivision_level,
            format: request.format,
            num_triangles: request.num_triangles,
            use_vertex_and_texture_operations,
            last_use_frame_index: current_frame_index,
            lru_token,
            stage_token: Some(stage_token),
            array_buffer: None,
            array_buffer_device_size: 0,
            blas_buffers: None,
            blas_buffers_device_size: 0,
            baking: BakingState::default(),
        }
    }

    /// Bytes of cache budget this item currently occupies.
    pub fn device_size(&self) -> DeviceSize {
        self.array_buffer_device_size + self.blas_buffers_device_size
    }

    /// A later request resolving to this item's hash must describe the same
    /// micromap. A mismatch means a hash collision between different content.
    pub fn is_compatible_with(&self, request: &OmmRequest) -> bool {
        self.num_triangles == request.num_triangles && self.format == request.format
    }
}

/// Per-instance request bookkeeping, keyed by the instance's compound source
/// hash. `num_active_requests` counts cache items that still hold a live
/// back-reference to the instance.
#[derive(Debug, Default)]
pub struct InstanceOmmRequests {
    pub num_active_requests: u32,
    pub requests: Vec<OmmRequest>,
}

#[derive(Debug, Clone, Copy)]
struct InstanceBackref {
    id: InstanceId,
    /// Compound hash the instance was registered under, kept here so a
    /// detach can decrement the right request container without the
    /// instance still existing.
    compound_hash: u64,
}

/// Source geometry description an item needs until its bake completes.
///
/// The instance back-reference is weak: destroying the instance mid-bake
/// clears it (preserving bake progress) and a matching re-registration
/// re-attaches.
#[derive(Debug)]
pub struct CachedSourceData {
    pub num_triangles: u32,
    pub triangle_offset: u32,
    pub is_sub_slice: bool,
    instance: Option<InstanceBackref>,
}

impl CachedSourceData {
    pub fn new(request: &OmmRequest) -> Self {
        Self {
            num_triangles: request.num_triangles,
            triangle_offset: request.triangle_offset,
            is_sub_slice: request.is_sub_slice(),
            instance: None,
        }
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.instance.map(|backref| backref.id)
    }

    pub fn instance_compound_hash(&self) -> Option<u64> {
        self.instance.map(|backref| backref.compound_hash)
    }

    /// Links this source data to `instance` and counts the link in the
    /// instance's request container.
    pub fn attach(
        &mut self,
        instance: &RtInstance,
        containers: &mut FxHashMap<u64, InstanceOmmRequests>,
    ) {
        if self.instance.is_some() {
            self.detach(containers, true);
        }
        let compound_hash = instance.opacity_micromap_source_hash();
        containers
            .entry(compound_hash)
            .or_default()
            .num_active_requests += 1;
        self.instance = Some(InstanceBackref {
            id: instance.id,
            compound_hash,
        });
    }

    /// Clears the instance link. With `remove_empty_container`, a container
    /// that drops to zero active links is deleted.
    pub fn detach(
        &mut self,
        containers: &mut FxHashMap<u64, InstanceOmmRequests>,
        remove_empty_container: bool,
    ) {
        if let Some(backref) = self.instance.take() {
            if let Some(container) = containers.get_mut(&backref.compound_hash) {
                container.num_active_requests = container.num_active_requests.saturating_sub(1);
                if remove_empty_container && container.num_active_requests == 0 {
                    containers.remove(&backref.compound_hash);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_list::OrderList;
    use crate::settings::OpacityMicromapSettings;

    fn request(num_triangles: u32) -> OmmRequest {
        let mut instance = RtInstance::new(1, 0);
        instance.material_data_hash = 0xab;
        instance.texcoord_hash = 0xcd;
        instance.num_triangles = num_triangles;
        OmmRequest::new(&instance, &OpacityMicromapSettings::default())
    }

    #[test]
    fn state_ordering_tracks_lifecycle() {
        assert!(CacheState::Unprocessed < CacheState::Baking);
        assert!(CacheState::Baking <= CacheState::Baked);
        assert!(CacheState::Baked < CacheState::Built);
        assert!(CacheState::Built < CacheState::Ready);
    }

    #[test]
    fn compatibility_requires_matching_shape() {
        let mut lists = OrderList::new();
        let a = lists.push_back(1);
        let b = lists.push_back(2);
        let item = OpacityMicromapCacheItem::new(&request(8), 8, true, 0, a, b);
        assert!(item.is_compatible_with(&request(8)));
        assert!(!item.is_compatible_with(&request(6)));
    }

    #[test]
    fn attach_detach_balances_request_counts() {
        let mut containers: FxHashMap<u64, InstanceOmmRequests> = FxHashMap::default();
        let instance = RtInstance::new(3, 0);
        instance.set_opacity_micromap_source_hash(0x77);

        let mut first = CachedSourceData::new(&request(4));
        let mut second = CachedSourceData::new(&request(6));
        first.attach(&instance, &mut containers);
        second.attach(&instance, &mut containers);
        assert_eq!(containers[&0x77].num_active_requests, 2);
        assert_eq!(first.instance_id(), Some(3));

        first.detach(&mut containers, true);
        assert_eq!(containers[&0x77].num_active_requests, 1);
        second.detach(&mut containers, true);
        assert!(containers.is_empty());
        assert!(second.instance_id().is_none());
    }

    #[test]
    fn reattach_moves_the_link() {
        let mut containers: FxHashMap<u64, InstanceOmmRequests> = FxHashMap::default();
        let old = RtInstance::new(1, 0);
        old.set_opacity_micromap_source_hash(0x11);
        let new = RtInstance::new(2, 0);
        new.set_opacity_micromap_source_hash(0x22);

        let mut data = CachedSourceData::new(&request(4));
        data.attach(&old, &mut containers);
        data.attach(&new, &mut containers);
        assert!(!containers.contains_key(&0x11));
        assert_eq!(containers[&0x22].num_active_requests, 1);
        assert_eq!(data.instance_id(), Some(2));
    }
}
