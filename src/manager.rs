//! Opacity micromap lifecycle manager.
//!
//! Owns the cache of baked and built micromaps, admits build requests from
//! instances, spreads bake and build work across frames under per-frame
//! micro-triangle budgets, keeps the cache inside a device memory budget and
//! binds finished micromaps into acceleration structure geometry.
//!
//! Items move through a one-way pipeline:
//!
//! `Unprocessed -> Baking -> Baked -> Built -> Ready`
//!
//! Baking is resumable across frames. Up to and including `Baked` an item
//! needs its source geometry (and, while baking, a live instance) around;
//! from `Built` on it is a self-contained GPU object shared by every
//! instance whose content resolves to the same source hash.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cache::{CacheState, CachedSourceData, InstanceOmmRequests, OpacityMicromapCacheItem};
use crate::error::OmmResult;
use crate::gpu::{
    BakeDispatchDesc, BarrierKind, BlasOmmAttachment, BlasOmmBuffers, BufferDesc, BufferUsage,
    CommandList, DeviceSize, GeometryDesc, GpuBuffer, GpuError, IndexType, MicromapBuildInfo,
    MicromapDevice, MicromapHandle, MicromapTriangleDesc, MicromapUsage, OmmFormat,
    ResourceAccess, MICROMAP_BUFFER_ALIGNMENT, OMM_BUFFER_ALIGNMENT,
};
use crate::hash::{self, EMPTY_HASH};
use crate::instance::{InstanceRegistry, RtInstance, TextureArgSource, TextureOperation, TextureRef};
use crate::memory::OpacityMicromapMemoryManager;
use crate::order_list::{OrderList, OrderToken};
use crate::request::OmmRequest;
use crate::settings::OpacityMicromapSettings;
use crate::utils::{align_up, ceil_divide, log_once};

/// Per-source-hash request tracking used by the admission heuristics.
#[derive(Debug)]
struct OmmBuildRequestStatistics {
    num_requests: u32,
    num_frames_requested: u32,
    last_request_frame_index: u32,
}

impl Default for OmmBuildRequestStatistics {
    fn default() -> Self {
        Self {
            num_requests: 0,
            num_frames_requested: 0,
            // Sentinel distinct from any real frame so the first request
            // counts as a new frame.
            last_request_frame_index: u32::MAX,
        }
    }
}

/// Point-in-time counters for overlays and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpacityMicromapStats {
    pub num_bound_omms: u32,
    pub num_requested_omm_bindings: u32,
    pub micro_triangles_baked: u32,
    pub micro_triangles_built: u32,
    pub unprocessed_items: usize,
    pub baked_items: usize,
    pub built_items: usize,
    pub ready_items: usize,
    pub cache_items: usize,
    pub staged_requests: usize,
    pub black_listed_items: usize,
    pub memory_used: u64,
    pub memory_budget: u64,
}

pub struct OpacityMicromapManager {
    device: Arc<dyn MicromapDevice>,
    memory: OpacityMicromapMemoryManager,

    cache: FxHashMap<u64, OpacityMicromapCacheItem>,
    cached_source_data: FxHashMap<u64, CachedSourceData>,
    /// Keyed by instance compound source hash.
    instance_omm_requests: FxHashMap<u64, InstanceOmmRequests>,
    build_request_stats: FxHashMap<u64, OmmBuildRequestStatistics>,
    /// Source hashes that failed permanently or collided; never re-admitted.
    black_list: FxHashSet<u64>,

    /// Unprocessed and Baking items, ascending by triangle count with
    /// billboard sub-slices grouped at the back.
    unprocessed_list: OrderList,
    baked_list: OrderList,
    built_list: OrderList,
    ready_list: OrderList,
    /// Eviction order, least recently used at the front.
    lru_list: OrderList,

    /// Micromaps bound this frame, kept alive for the frames in flight.
    bound_omms: Vec<Arc<BlasOmmBuffers>>,
    bound_omms_require_synchronization: bool,

    current_frame_index: u32,
    /// Bytes that allocation attempts fell short by this frame; drives
    /// next frame's eviction.
    amount_of_memory_missing: DeviceSize,

    num_bound_omms: u32,
    num_requested_omm_bindings: u32,
    num_micro_triangles_baked: u32,
    num_micro_triangles_built: u32,

    // Mirrors of the settings that invalidate baked data when changed.
    subdivision_level: u16,
    enable_vertex_and_texture_operations: bool,
    enable_conservative_estimation: bool,
    conservative_estimation_max_texel_taps: u32,
}

impl OpacityMicromapManager {
    pub fn new(device: Arc<dyn MicromapDevice>) -> Self {
        let defaults = OpacityMicromapSettings::default();
        log::info!(
            "[OpacityMicromapManager::new] Initialized. Device support: {}",
            device.supports_opacity_micromaps()
        );
        Self {
            device,
            memory: OpacityMicromapMemoryManager::new(),
            cache: FxHashMap::default(),
            cached_source_data: FxHashMap::default(),
            instance_omm_requests: FxHashMap::default(),
            build_request_stats: FxHashMap::default(),
            black_list: FxHashSet::default(),
            unprocessed_list: OrderList::new(),
            baked_list: OrderList::new(),
            built_list: OrderList::new(),
            ready_list: OrderList::new(),
            lru_list: OrderList::new(),
            bound_omms: Vec::new(),
            bound_omms_require_synchronization: false,
            current_frame_index: 0,
            amount_of_memory_missing: 0,
            num_bound_omms: 0,
            num_requested_omm_bindings: 0,
            num_micro_triangles_baked: 0,
            num_micro_triangles_built: 0,
            subdivision_level: defaults.subdivision_level,
            enable_vertex_and_texture_operations: defaults.enable_vertex_and_texture_operations,
            enable_conservative_estimation: defaults.enable_conservative_estimation,
            conservative_estimation_max_texel_taps: defaults
                .conservative_estimation_max_texel_taps,
        }
    }

    pub fn stats(&self) -> OpacityMicromapStats {
        OpacityMicromapStats {
            num_bound_omms: self.num_bound_omms,
            num_requested_omm_bindings: self.num_requested_omm_bindings,
            micro_triangles_baked: self.num_micro_triangles_baked,
            micro_triangles_built: self.num_micro_triangles_built,
            unprocessed_items: self.unprocessed_list.len(),
            baked_items: self.baked_list.len(),
            built_items: self.built_list.len(),
            ready_items: self.ready_list.len(),
            cache_items: self.cache.len(),
            staged_requests: self.build_request_stats.len(),
            black_listed_items: self.black_list.len(),
            memory_used: self.memory.used(),
            memory_budget: self.memory.budget(),
        }
    }

    // ---------------------------------------------------------------------
    // Frame lifecycle
    // ---------------------------------------------------------------------

    /// Advances the frame: resets counters, applies settings changes that
    /// invalidate baked data, recomputes the memory budget and evicts until
    /// last frame's memory deficit fits.
    pub fn on_frame_start(
        &mut self,
        cmd: &mut dyn CommandList,
        frame_index: u32,
        settings: &OpacityMicromapSettings,
    ) {
        self.current_frame_index = frame_index;
        self.num_bound_omms = 0;
        self.num_requested_omm_bindings = 0;
        self.num_micro_triangles_baked = 0;
        self.num_micro_triangles_built = 0;

        // Baked opacity depends on these; a change makes every cached item
        // stale at once.
        let baked_data_stale = self.subdivision_level != settings.subdivision_level
            || self.enable_vertex_and_texture_operations
                != settings.enable_vertex_and_texture_operations
            || self.enable_conservative_estimation != settings.enable_conservative_estimation
            || self.conservative_estimation_max_texel_taps
                != settings.conservative_estimation_max_texel_taps;
        if (baked_data_stale || !settings.enable || settings.reset_cache_every_frame)
            && !self.cache.is_empty()
        {
            log::debug!(
                "[OpacityMicromapManager::on_frame_start] Rebuilding the cache (settings changed: {}, enabled: {})",
                baked_data_stale,
                settings.enable
            );
            self.clear();
        }
        self.subdivision_level = settings.subdivision_level;
        self.enable_vertex_and_texture_operations = settings.enable_vertex_and_texture_operations;
        self.enable_conservative_estimation = settings.enable_conservative_estimation;
        self.conservative_estimation_max_texel_taps =
            settings.conservative_estimation_max_texel_taps;

        // Requests that went quiet will not reach the admission thresholds.
        let max_age = settings.max_request_frame_age;
        self.build_request_stats
            .retain(|_, stats| frame_index.saturating_sub(stats.last_request_frame_index) <= max_age);

        // Micromaps bound last frame may still be referenced by in-flight
        // acceleration structure work.
        for omm in self.bound_omms.drain(..) {
            cmd.track_omm_buffers(&omm, ResourceAccess::Read);
        }

        let device_stats = self.device.memory_stats();
        let previous_budget = self.memory.budget();
        self.memory.update_memory_budget(&device_stats, settings);
        let budget_decreased = self.memory.budget() < previous_budget;
        if budget_decreased {
            // A shrinking budget can leave the cache over-subscribed with no
            // new allocations arriving to report a deficit.
            let over_subscription = self.memory.used().max(self.memory.budget()) - self.memory.budget();
            self.amount_of_memory_missing = self.amount_of_memory_missing.max(over_subscription);
        }

        if self.memory.budget() == 0 && !self.cache.is_empty() {
            self.clear();
        }

        // Evict least recently used items until last frame's deficit fits,
        // but never touch items used within the warmth floor unless the
        // budget itself shrank.
        self.amount_of_memory_missing = self.amount_of_memory_missing.min(self.memory.budget());
        if self.amount_of_memory_missing > 0 {
            let mut cursor = self.lru_list.front_token();
            while self.amount_of_memory_missing > self.memory.pending_available() {
                let Some(token) = cursor else { break };
                let next = self.lru_list.next_token(token);
                let Some(hash) = self.lru_list.value(token) else { break };
                match self.cache.get(&hash) {
                    None => {
                        log_once!(
                            error,
                            "[OpacityMicromapManager::on_frame_start] LRU entry without a cache item. Dropping it."
                        );
                        self.lru_list.remove(token);
                    }
                    Some(item) => {
                        let age = frame_index.saturating_sub(item.last_use_frame_index);
                        if age < settings.min_usage_frame_age_before_eviction && !budget_decreased
                        {
                            break;
                        }
                        log::debug!(
                            "[OpacityMicromapManager::on_frame_start] Evicting {:#018x} in state {:?}",
                            hash,
                            item.state
                        );
                        self.destroy_omm_data(hash, true);
                    }
                }
                cursor = next;
            }
        }
        self.amount_of_memory_missing = 0;

        self.memory.on_frame_start();
    }

    /// Destroys all cached data and accounting. The black-list survives; the
    /// content it names is still bad.
    pub fn clear(&mut self) {
        log::debug!(
            "[OpacityMicromapManager::clear] Destroying {} cached items",
            self.cache.len()
        );
        self.memory.release_all();
        self.cache.clear();
        self.cached_source_data.clear();
        self.instance_omm_requests.clear();
        self.build_request_stats.clear();
        self.unprocessed_list.clear();
        self.baked_list.clear();
        self.built_list.clear();
        self.ready_list.clear();
        self.lru_list.clear();
        self.amount_of_memory_missing = 0;
    }

    // ---------------------------------------------------------------------
    // Request registration
    // ---------------------------------------------------------------------

    /// Registers this frame's micromap interest of `instance`. Returns
    /// whether any of its requests is now cached or staged for admission.
    pub fn register_opacity_micromap_build_request(
        &mut self,
        instance: &RtInstance,
        textures: &[TextureRef],
        settings: &OpacityMicromapSettings,
    ) -> bool {
        if !settings.enable || !self.device.supports_opacity_micromaps() {
            return false;
        }
        if !self.does_instance_use_opacity_micromap(instance, settings) {
            return false;
        }
        // Baking from a partially streamed texture would cache wrong bits.
        if !are_instance_textures_resident(instance, textures) {
            return false;
        }

        let requests = self.generate_instance_omm_requests(instance, settings);
        if requests.is_empty() {
            return false;
        }
        let compound_hash = instance.opacity_micromap_source_hash();
        self.instance_omm_requests
            .entry(compound_hash)
            .or_default()
            .requests = requests.clone();

        let mut any_accepted = false;
        for request in &requests {
            any_accepted |= self.register_omm_request(instance, request, settings);
        }

        if let Some(container) = self.instance_omm_requests.get(&compound_hash) {
            if container.num_active_requests == 0 {
                self.instance_omm_requests.remove(&compound_hash);
            }
        }
        any_accepted
    }

    /// Derives the per-instance request set and refreshes the instance's
    /// compound source hash, retiring requests of stale content.
    fn generate_instance_omm_requests(
        &mut self,
        instance: &RtInstance,
        settings: &OpacityMicromapSettings,
    ) -> Vec<OmmRequest> {
        let mut requests = Vec::new();
        let compound_hash;
        if settings.split_billboard_geometry && instance.billboard_count() > 0 {
            debug_assert!(instance.num_triangles % 2 == 0);
            let mut seen = Vec::with_capacity(instance.billboard_count() as usize);
            for index in 0..instance.billboard_count() {
                let request = OmmRequest::for_sub_slice(instance, settings, index);
                if !seen.contains(&request.source_hash) {
                    seen.push(request.source_hash);
                    requests.push(request);
                }
            }
            compound_hash = hash::combine_all(EMPTY_HASH, &seen);
        } else {
            let request = OmmRequest::new(instance, settings);
            compound_hash = request.source_hash;
            requests.push(request);
        }

        let previous = instance.opacity_micromap_source_hash();
        if previous != EMPTY_HASH && previous != compound_hash {
            // Same instance, new content. The old requests can only waste
            // budget now.
            self.destroy_instance_requests(previous, false);
        }
        instance.set_opacity_micromap_source_hash(compound_hash);
        requests
    }

    fn register_omm_request(
        &mut self,
        instance: &RtInstance,
        request: &OmmRequest,
        settings: &OpacityMicromapSettings,
    ) -> bool {
        let hash = request.source_hash;
        if hash == EMPTY_HASH {
            log_once!(
                warn,
                "[OpacityMicromapManager::register_omm_request] Request with an empty source hash. Rejecting."
            );
            return false;
        }
        if self.black_list.contains(&hash) {
            return false;
        }

        if self.cache.contains_key(&hash) {
            let compatible = self
                .cache
                .get(&hash)
                .map(|item| item.is_compatible_with(request))
                .unwrap_or(false);
            if !compatible {
                // Two different micromaps resolved to one hash. The data is
                // untrustworthy for either; poison the hash.
                log_once!(
                    warn,
                    "[OpacityMicromapManager::register_omm_request] Source hash collision with incompatible geometry. Black-listing the hash."
                );
                self.black_list.insert(hash);
                self.destroy_omm_data(hash, true);
                return false;
            }
            let state = self
                .cache
                .get(&hash)
                .map(|item| item.state)
                .unwrap_or(CacheState::Ready);
            if state <= CacheState::Baking {
                // Re-attach an item orphaned by a mid-bake instance destroy.
                let orphaned = self
                    .cached_source_data
                    .get(&hash)
                    .map(|data| data.instance_id().is_none())
                    .unwrap_or(false);
                if orphaned {
                    if let Some(data) = self.cached_source_data.get_mut(&hash) {
                        data.attach(instance, &mut self.instance_omm_requests);
                    }
                }
            }
            return true;
        }

        self.add_new_omm_build_request(instance, request, settings)
    }

    fn add_new_omm_build_request(
        &mut self,
        instance: &RtInstance,
        request: &OmmRequest,
        settings: &OpacityMicromapSettings,
    ) -> bool {
        let hash = request.source_hash;
        if self.memory.budget() == 0 {
            return false;
        }

        // Billboard quads are cheap and dedupe well across particle systems;
        // gating them on age or popularity would just delay the whole system.
        let (min_age, min_requests, min_frames) = if request.is_sub_slice() {
            (0, 1, 1)
        } else {
            (
                settings.min_instance_frame_age,
                settings.min_num_requests,
                settings.min_num_frames_requested,
            )
        };
        if instance.frame_age(self.current_frame_index) < min_age {
            return false;
        }

        // The statistics table is capped before any threshold handling, so a
        // flood of one-off hashes cannot grow it without bound.
        if !self.build_request_stats.contains_key(&hash)
            && self.build_request_stats.len() >= settings.max_omm_build_requests as usize
        {
            return false;
        }
        let stats = self.build_request_stats.entry(hash).or_default();
        stats.num_requests = stats.num_requests.saturating_add(1);
        if stats.last_request_frame_index != self.current_frame_index {
            stats.num_frames_requested = stats.num_frames_requested.saturating_add(1);
            stats.last_request_frame_index = self.current_frame_index;
        }
        if stats.num_requests < min_requests || stats.num_frames_requested < min_frames {
            // Staged; counts toward admission on later requests.
            return true;
        }
        self.build_request_stats.remove(&hash);

        let Some(stage_token) = self.insert_into_unprocessed_list(instance, request) else {
            return false;
        };
        let lru_token = self.lru_list.push_back(hash);
        let max_level = self.device.max_subdivision_level(request.format);
        let item = OpacityMicromapCacheItem::new(
            request,
            settings.subdivision_level.min(max_level),
            settings.enable_vertex_and_texture_operations,
            self.current_frame_index,
            stage_token,
            lru_token,
        );
        self.cache.insert(hash, item);
        log::debug!(
            "[OpacityMicromapManager::add_new_omm_build_request] Admitted {:#018x} ({} triangles, {:?})",
            hash,
            request.num_triangles,
            request.format
        );
        true
    }

    /// Registers source data and places the request in the unprocessed list:
    /// ascending by triangle count so small items complete quickly, with
    /// billboard sub-slices grouped at the back.
    fn insert_into_unprocessed_list(
        &mut self,
        instance: &RtInstance,
        request: &OmmRequest,
    ) -> Option<OrderToken> {
        if request.num_triangles == 0 {
            log_once!(
                warn,
                "[OpacityMicromapManager::insert_into_unprocessed_list] Request covering zero triangles. Rejecting."
            );
            return None;
        }
        let mut data = CachedSourceData::new(request);
        data.attach(instance, &mut self.instance_omm_requests);
        self.cached_source_data.insert(request.source_hash, data);

        if request.is_sub_slice() {
            return Some(self.unprocessed_list.push_back(request.source_hash));
        }
        let mut insert_at = None;
        let mut cursor = self.unprocessed_list.front_token();
        while let Some(token) = cursor {
            if let Some(hash) = self.unprocessed_list.value(token) {
                if let Some(other) = self.cached_source_data.get(&hash) {
                    if other.is_sub_slice || request.num_triangles < other.num_triangles {
                        insert_at = Some(token);
                        break;
                    }
                }
            }
            cursor = self.unprocessed_list.next_token(token);
        }
        Some(match insert_at {
            Some(token) => self.unprocessed_list.insert_before(token, request.source_hash),
            None => self.unprocessed_list.push_back(request.source_hash),
        })
    }

    /// Whether this instance's material and alpha pipeline can benefit from
    /// an opacity micromap at all.
    pub fn does_instance_use_opacity_micromap(
        &self,
        instance: &RtInstance,
        settings: &OpacityMicromapSettings,
    ) -> bool {
        use crate::instance::MaterialType;

        // Replicated view model copies would multiply identical requests.
        if instance.is_view_model_non_reference {
            return false;
        }
        if instance.texcoord_hash == EMPTY_HASH {
            // Opacity is sampled through texture coordinates; without them
            // there is nothing to bake.
            return false;
        }

        let surface = &instance.surface;
        let alpha = &surface.alpha_state;
        let mut use_omm = if (!alpha.is_fully_opaque && alpha.is_particle) || alpha.emissive_blend
        {
            true
        } else {
            match instance.material_type {
                MaterialType::Opaque => !alpha.is_fully_opaque,
                MaterialType::Translucent => false,
                MaterialType::RayPortal => true,
            }
        };

        use_omm &= !instance.is_animated || settings.enable_animated_instances;
        use_omm &= !alpha.is_particle || settings.enable_particles;
        if settings.split_billboard_geometry {
            use_omm &=
                instance.billboard_count() <= settings.max_allowed_billboards_per_instance_to_split;
        }

        if use_omm {
            // Alpha driven purely by the texture factor register is a
            // constant; below the transparency threshold nothing survives
            // resolve and the micromap would mark everything transparent.
            let selects_t_factor = match surface.texture_alpha_operation {
                TextureOperation::SelectArg1 => {
                    surface.texture_alpha_arg1_source == TextureArgSource::TFactor
                }
                TextureOperation::SelectArg2 => {
                    surface.texture_alpha_arg2_source == TextureArgSource::TFactor
                }
                _ => false,
            };
            if selects_t_factor {
                let t_factor_alpha = ((surface.t_factor >> 24) & 0xff) as f32 / 255.0;
                use_omm &= t_factor_alpha > settings.resolve_transparency_threshold;
            }
        }
        use_omm
    }

    // ---------------------------------------------------------------------
    // Instance lifecycle
    // ---------------------------------------------------------------------

    /// Severs the destroyed instance's links. Items without GPU progress are
    /// dropped; items mid-bake stay, orphaned, keeping their partial bake
    /// until matching content registers again.
    pub fn on_instance_destroyed(&mut self, instance: &RtInstance) {
        self.destroy_instance_requests(instance.opacity_micromap_source_hash(), false);
    }

    fn destroy_instance_requests(&mut self, compound_hash: u64, force: bool) {
        if compound_hash == EMPTY_HASH {
            return;
        }
        let Some(container) = self.instance_omm_requests.remove(&compound_hash) else {
            return;
        };
        for request in &container.requests {
            self.destroy_cached_data_for_request(request.source_hash, force);
        }
    }

    fn destroy_cached_data_for_request(&mut self, hash: u64, force: bool) {
        let Some(item) = self.cache.get(&hash) else {
            return;
        };
        if !force {
            match item.state {
                // Nothing invested yet; cheaper to re-admit than to track.
                CacheState::Unprocessed => {}
                CacheState::Baking => {
                    // Keep the partial bake. Orphan the item; a matching
                    // re-registration re-attaches and resumes.
                    if let Some(data) = self.cached_source_data.get_mut(&hash) {
                        data.detach(&mut self.instance_omm_requests, false);
                    }
                    return;
                }
                // Baked and later no longer depend on the instance.
                _ => return,
            }
        }
        self.destroy_omm_data(hash, false);
    }

    // ---------------------------------------------------------------------
    // Item teardown
    // ---------------------------------------------------------------------

    fn stage_list_mut(&mut self, state: CacheState) -> &mut OrderList {
        match state {
            CacheState::Unprocessed | CacheState::Baking => &mut self.unprocessed_list,
            CacheState::Baked => &mut self.baked_list,
            CacheState::Built => &mut self.built_list,
            CacheState::Ready => &mut self.ready_list,
        }
    }

    fn delete_cached_source_data(
        &mut self,
        hash: u64,
        state: CacheState,
        remove_empty_container: bool,
    ) {
        if let Some(mut data) = self.cached_source_data.remove(&hash) {
            // Only pre-bake-completion items still hold an instance link.
            if state <= CacheState::Baking {
                data.detach(&mut self.instance_omm_requests, remove_empty_container);
            }
        }
    }

    fn destroy_omm_data(&mut self, hash: u64, remove_empty_container: bool) {
        let Some(item) = self.cache.remove(&hash) else {
            return;
        };
        if let Some(stage_token) = item.stage_token {
            self.stage_list_mut(item.state).remove(stage_token);
        }
        if item.state <= CacheState::Baked {
            self.delete_cached_source_data(hash, item.state, remove_empty_container);
        }
        self.lru_list.remove(item.lru_token);
        let size = item.device_size();
        if size > 0 {
            self.memory.release(size);
        }
    }

    // ---------------------------------------------------------------------
    // Per-frame baking and building
    // ---------------------------------------------------------------------

    /// Records this frame's bake dispatches and micromap builds, bounded by
    /// throughput budgets derived from the frame time.
    pub fn build_opacity_micromaps(
        &mut self,
        cmd: &mut dyn CommandList,
        textures: &[TextureRef],
        instances: &dyn InstanceRegistry,
        last_camera_cut_frame_index: u32,
        frame_time_secs: f32,
        settings: &OpacityMicromapSettings,
    ) {
        if !settings.enable || !self.device.supports_opacity_micromaps() {
            return;
        }

        let frames_since_cut = self
            .current_frame_index
            .saturating_sub(last_camera_cut_frame_index);
        let high_workload =
            frames_since_cut < settings.num_frames_at_start_to_build_with_high_workload;
        let multiplier = if high_workload {
            settings.workload_high_workload_multiplier as f32
        } else {
            1.0
        };

        let mut max_micro_triangles_to_bake = micro_triangle_frame_budget(
            settings.max_micro_triangles_to_bake_million_per_second,
            multiplier,
            frame_time_secs,
        );
        let mut max_micro_triangles_to_build = micro_triangle_frame_budget(
            settings.max_micro_triangles_to_build_million_per_second,
            multiplier,
            frame_time_secs,
        );

        self.bake_opacity_micromap_arrays(
            cmd,
            textures,
            instances,
            &mut max_micro_triangles_to_bake,
            settings,
        );
        self.build_baked_micromaps(cmd, &mut max_micro_triangles_to_build);

        log::trace!(
            "[OpacityMicromapManager::build_opacity_micromaps] frame {}: baked {} and built {} micro-triangles; {} unprocessed, {} baked, {} built, {} ready",
            self.current_frame_index,
            self.num_micro_triangles_baked,
            self.num_micro_triangles_built,
            self.unprocessed_list.len(),
            self.baked_list.len(),
            self.built_list.len(),
            self.ready_list.len()
        );
    }

    fn bake_opacity_micromap_arrays(
        &mut self,
        cmd: &mut dyn CommandList,
        textures: &[TextureRef],
        instances: &dyn InstanceRegistry,
        max_micro_triangles: &mut u32,
        settings: &OpacityMicromapSettings,
    ) {
        let mut cursor = self.unprocessed_list.front_token();
        while *max_micro_triangles > 0 {
            let Some(token) = cursor else { break };
            let next = self.unprocessed_list.next_token(token);
            let Some(hash) = self.unprocessed_list.value(token) else {
                cursor = next;
                continue;
            };

            let result =
                self.bake_one(cmd, textures, instances, hash, *max_micro_triangles, settings);
            match result {
                OmmResult::Success => {
                    let (baked_in_dispatch, complete) = self
                        .cache
                        .get(&hash)
                        .map(|item| {
                            (
                                item.baking.micro_triangles_baked_in_last_dispatch,
                                item.baking.is_complete(),
                            )
                        })
                        .unwrap_or((0, false));
                    self.num_micro_triangles_baked += baked_in_dispatch;
                    *max_micro_triangles = max_micro_triangles.saturating_sub(baked_in_dispatch);
                    if complete {
                        // The instance link is only needed while baking.
                        if let Some(data) = self.cached_source_data.get_mut(&hash) {
                            data.detach(&mut self.instance_omm_requests, true);
                        }
                        if let Some(item) = self.cache.get_mut(&hash) {
                            item.state = CacheState::Baked;
                            if let Some(stage_token) = item.stage_token.take() {
                                self.unprocessed_list.remove(stage_token);
                            }
                            item.stage_token = Some(self.baked_list.push_back(hash));
                        }
                        cursor = next;
                    } else if baked_in_dispatch == 0 {
                        // Backend made no progress; do not spin on it.
                        cursor = next;
                    }
                    // Otherwise stay on this item and keep dispatching until
                    // it completes or the budget runs out.
                }
                OmmResult::Failure => {
                    log_once!(
                        warn,
                        "[OpacityMicromapManager::bake_opacity_micromap_arrays] Baking failed permanently. The source hash is black-listed."
                    );
                    let parent_compound = self
                        .cached_source_data
                        .get(&hash)
                        .and_then(|data| data.instance_compound_hash());
                    self.black_list.insert(hash);
                    match parent_compound {
                        Some(compound_hash) => self.destroy_instance_requests(compound_hash, true),
                        None => self.destroy_omm_data(hash, true),
                    }
                    cursor = next;
                }
                OmmResult::OutOfMemory
                | OmmResult::OutOfBudget
                | OmmResult::DependenciesUnavailable => {
                    cursor = next;
                }
            }
        }
    }

    fn bake_one(
        &mut self,
        cmd: &mut dyn CommandList,
        textures: &[TextureRef],
        instances: &dyn InstanceRegistry,
        hash: u64,
        max_micro_triangles: u32,
        settings: &OpacityMicromapSettings,
    ) -> OmmResult {
        let (num_triangles, triangle_offset, instance_id) =
            match self.cached_source_data.get(&hash) {
                Some(data) => (data.num_triangles, data.triangle_offset, data.instance_id()),
                None => {
                    log_once!(
                        error,
                        "[OpacityMicromapManager::bake_one] Unprocessed item without source data."
                    );
                    return OmmResult::Failure;
                }
            };
        // Orphaned mid-bake items wait for a matching re-registration.
        let Some(instance_id) = instance_id else {
            return OmmResult::DependenciesUnavailable;
        };
        let Some(instance) = instances.instance(instance_id) else {
            // The registry lost the instance without a destroy notification.
            if let Some(data) = self.cached_source_data.get_mut(&hash) {
                data.detach(&mut self.instance_omm_requests, false);
            }
            return OmmResult::DependenciesUnavailable;
        };
        if !are_instance_textures_resident(instance, textures) {
            return OmmResult::DependenciesUnavailable;
        }
        let Some(albedo_index) = instance.albedo_opacity_texture_index else {
            return OmmResult::DependenciesUnavailable;
        };
        let Some(opacity_texture) = textures.get(albedo_index as usize) else {
            return OmmResult::DependenciesUnavailable;
        };
        let secondary_opacity_texture = instance
            .secondary_opacity_texture_index
            .and_then(|index| textures.get(index as usize));

        let Some(item) = self.cache.get_mut(&hash) else {
            return OmmResult::Failure;
        };

        let micro_triangles_per_triangle = 1u32 << (2 * item.subdivision_level as u32);
        let total_micro_triangles =
            (num_triangles as u64 * micro_triangles_per_triangle as u64).min(u32::MAX as u64)
                as u32;

        if item.array_buffer.is_none() {
            let bits = total_micro_triangles as u64 * item.format.bits_per_micro_triangle();
            let size = align_up(ceil_divide(bits, 8), OMM_BUFFER_ALIGNMENT);
            if size > self.memory.available() {
                self.amount_of_memory_missing += size;
                return OmmResult::OutOfBudget;
            }
            let buffer = match self.device.create_buffer(&BufferDesc {
                label: "omm array buffer",
                size,
                alignment: OMM_BUFFER_ALIGNMENT,
                usage: BufferUsage::OpacityArray,
            }) {
                Ok(buffer) => buffer,
                Err(err) => {
                    log_once!(
                        warn,
                        "[OpacityMicromapManager::bake_one] Array buffer allocation failed: {err}"
                    );
                    self.amount_of_memory_missing += size;
                    return OmmResult::OutOfMemory;
                }
            };
            let charged = self.memory.allocate(size);
            debug_assert!(charged);
            item.array_buffer = Some(buffer);
            item.array_buffer_device_size = size;
            item.baking.micro_triangles_to_bake = total_micro_triangles;
        }

        item.state = CacheState::Baking;

        let resolve_transparency_threshold = if instance.surface.alpha_state.is_decal {
            settings
                .resolve_transparency_threshold
                .max(settings.decal_min_resolve_transparency_threshold)
        } else {
            settings.resolve_transparency_threshold
        };
        let desc = BakeDispatchDesc {
            subdivision_level: item.subdivision_level,
            micro_triangles_per_triangle,
            format: item.format,
            material_type: instance.material_type,
            apply_vertex_and_texture_operations: settings.enable_vertex_and_texture_operations,
            use_conservative_estimation: settings.enable_conservative_estimation,
            conservative_estimation_max_texel_taps: settings
                .conservative_estimation_max_texel_taps,
            max_micro_triangles_to_bake: max_micro_triangles,
            num_triangles,
            triangle_offset,
            resolve_transparency_threshold,
            resolve_opaqueness_threshold: settings.resolve_opaqueness_threshold,
            opacity_texture,
            secondary_opacity_texture,
        };
        let Some(target) = item.array_buffer.as_ref() else {
            return OmmResult::Failure;
        };
        cmd.track_buffer(target, ResourceAccess::Write);
        cmd.dispatch_bake(&desc, &mut item.baking, target);
        OmmResult::Success
    }

    fn build_baked_micromaps(&mut self, cmd: &mut dyn CommandList, max_micro_triangles: &mut u32) {
        let mut builds: Vec<MicromapBuildInfo> = Vec::new();
        // Build at least one item per frame so a tiny budget still drains
        // the queue.
        let mut force_build = true;
        let mut cursor = self.baked_list.front_token();
        while let Some(token) = cursor {
            if *max_micro_triangles == 0 && !force_build {
                break;
            }
            let next = self.baked_list.next_token(token);
            let Some(hash) = self.baked_list.value(token) else {
                cursor = next;
                continue;
            };

            let result = self.build_one(cmd, hash, *max_micro_triangles, force_build, &mut builds);
            match result {
                OmmResult::Success => {
                    let micro_triangles = self
                        .cache
                        .get(&hash)
                        .map(|item| {
                            (item.num_triangles as u64)
                                .saturating_mul(1u64 << (2 * item.subdivision_level as u64))
                                .min(u32::MAX as u64) as u32
                        })
                        .unwrap_or(0);
                    self.num_micro_triangles_built += micro_triangles;
                    *max_micro_triangles = max_micro_triangles.saturating_sub(micro_triangles);
                    if let Some(item) = self.cache.get_mut(&hash) {
                        item.state = CacheState::Built;
                        if let Some(stage_token) = item.stage_token.take() {
                            self.baked_list.remove(stage_token);
                        }
                        item.stage_token = Some(self.built_list.push_back(hash));
                    }
                    self.delete_cached_source_data(hash, CacheState::Baked, true);
                    force_build = false;
                }
                OmmResult::Failure => {
                    log_once!(
                        warn,
                        "[OpacityMicromapManager::build_baked_micromaps] Micromap build failed permanently. The source hash is black-listed."
                    );
                    self.black_list.insert(hash);
                    self.destroy_omm_data(hash, true);
                }
                OmmResult::OutOfMemory
                | OmmResult::OutOfBudget
                | OmmResult::DependenciesUnavailable => {}
            }
            cursor = next;
        }

        if !builds.is_empty() {
            // Triangle descriptor and index uploads must land before the
            // builds read them.
            cmd.memory_barrier(BarrierKind::TransferToMicromapBuild);
            cmd.build_micromaps(&builds);
        }
    }

    fn build_one(
        &mut self,
        cmd: &mut dyn CommandList,
        hash: u64,
        max_micro_triangles: u32,
        force_build: bool,
        builds: &mut Vec<MicromapBuildInfo>,
    ) -> OmmResult {
        let Some(item) = self.cache.get_mut(&hash) else {
            return OmmResult::Failure;
        };
        let micro_triangles_per_triangle = 1u64 << (2 * item.subdivision_level as u64);
        let total_micro_triangles =
            (item.num_triangles as u64 * micro_triangles_per_triangle).min(u32::MAX as u64) as u32;
        if total_micro_triangles > max_micro_triangles && !force_build {
            return OmmResult::OutOfBudget;
        }

        let usage = MicromapUsage {
            count: item.num_triangles,
            subdivision_level: item.subdivision_level,
            format: item.format,
        };
        let sizes = self.device.micromap_build_sizes(&usage);
        let micromap_buffer_size = align_up(sizes.micromap_size, MICROMAP_BUFFER_ALIGNMENT);
        let index_type = if item.num_triangles <= u16::MAX as u32 {
            IndexType::U16
        } else {
            IndexType::U32
        };
        let index_buffer_size = item.num_triangles as u64 * index_type.stride() as u64;
        let required = micromap_buffer_size + index_buffer_size;

        if required > self.memory.available() {
            self.amount_of_memory_missing += required;
            return OmmResult::OutOfBudget;
        }

        let triangle_buffer_size =
            item.num_triangles as u64 * std::mem::size_of::<MicromapTriangleDesc>() as u64;
        let create = |label, size, usage| {
            self.device.create_buffer(&BufferDesc {
                label,
                size,
                alignment: OMM_BUFFER_ALIGNMENT,
                usage,
            })
        };
        let buffers = (|| -> Result<(GpuBuffer, GpuBuffer, GpuBuffer, MicromapHandle), GpuError> {
            let micromap_buffer = self.device.create_buffer(&BufferDesc {
                label: "micromap storage",
                size: micromap_buffer_size,
                alignment: MICROMAP_BUFFER_ALIGNMENT,
                usage: BufferUsage::MicromapStorage,
            })?;
            let triangle_index_buffer = create(
                "micromap triangle index buffer",
                index_buffer_size,
                BufferUsage::MicromapBuildInput,
            )?;
            let triangle_desc_buffer = create(
                "micromap triangle desc buffer",
                triangle_buffer_size,
                BufferUsage::MicromapBuildInput,
            )?;
            let micromap = self
                .device
                .create_micromap(&micromap_buffer, sizes.micromap_size)?;
            Ok((micromap_buffer, triangle_index_buffer, triangle_desc_buffer, micromap))
        })();
        let (micromap_buffer, triangle_index_buffer, triangle_desc_buffer, micromap) =
            match buffers {
                Ok(buffers) => buffers,
                Err(err) => {
                    log_once!(
                        warn,
                        "[OpacityMicromapManager::build_one] Micromap allocation failed: {err}"
                    );
                    self.amount_of_memory_missing += required;
                    return OmmResult::OutOfMemory;
                }
            };

        // Per-triangle descriptors: one uniform usage group, data packed
        // back to back in the array buffer.
        let bits_per_triangle =
            micro_triangles_per_triangle * item.format.bits_per_micro_triangle();
        let bytes_per_triangle = ceil_divide(bits_per_triangle, 8);
        let mut descs = Vec::with_capacity(item.num_triangles as usize);
        for triangle in 0..item.num_triangles {
            descs.push(MicromapTriangleDesc {
                data_offset: (triangle as u64 * bytes_per_triangle) as u32,
                subdivision_level: item.subdivision_level,
                format: item.format.wire_value(),
            });
        }
        cmd.write_buffer(&triangle_desc_buffer, 0, bytemuck::cast_slice(&descs));

        // Identity triangle-to-micromap-triangle mapping.
        let mut index_bytes = Vec::with_capacity(index_buffer_size as usize);
        match index_type {
            IndexType::U16 => {
                for triangle in 0..item.num_triangles {
                    index_bytes.extend_from_slice(&(triangle as u16).to_le_bytes());
                }
            }
            IndexType::U32 => {
                for triangle in 0..item.num_triangles {
                    index_bytes.extend_from_slice(&triangle.to_le_bytes());
                }
            }
        }
        cmd.write_buffer(&triangle_index_buffer, 0, &index_bytes);

        cmd.track_buffer(&triangle_desc_buffer, ResourceAccess::Read);
        cmd.track_buffer(&micromap_buffer, ResourceAccess::Write);

        // The build consumes the baked array; its bytes go back to the pool
        // once in-flight frames drain, the command list keeps it alive.
        let Some(array_buffer) = item.array_buffer.take() else {
            return OmmResult::Failure;
        };
        cmd.track_buffer(&array_buffer, ResourceAccess::Read);
        self.memory.release(item.array_buffer_device_size);
        item.array_buffer_device_size = 0;

        let charged = self.memory.allocate(required);
        debug_assert!(charged);
        item.blas_buffers = Some(Arc::new(BlasOmmBuffers {
            micromap,
            micromap_buffer,
            triangle_index_buffer,
            attachment: BlasOmmAttachment {
                micromap,
                index_type,
                index_stride: index_type.stride(),
                base_triangle: 0,
            },
        }));
        item.blas_buffers_device_size = required;

        builds.push(MicromapBuildInfo {
            usage,
            dst_micromap: micromap,
            array_buffer,
            triangle_array_buffer: triangle_desc_buffer,
            scratch_size: sizes.build_scratch_size,
        });
        OmmResult::Success
    }

    // ---------------------------------------------------------------------
    // Binding
    // ---------------------------------------------------------------------

    /// Attaches a finished micromap to `geometry` if one is available for the
    /// instance's content and returns its source hash. Touches the LRU order
    /// on success.
    pub fn try_bind_opacity_micromap(
        &mut self,
        cmd: &mut dyn CommandList,
        instance: &RtInstance,
        billboard_index: u32,
        geometry: &mut GeometryDesc,
        settings: &OpacityMicromapSettings,
    ) -> Option<u64> {
        self.num_requested_omm_bindings += 1;
        if !settings.enable || !self.device.supports_opacity_micromaps() {
            return None;
        }
        if !self.does_instance_use_opacity_micromap(instance, settings) {
            return None;
        }

        let request = if settings.split_billboard_geometry && instance.billboard_count() > 0 {
            if billboard_index >= instance.billboard_count() {
                return None;
            }
            OmmRequest::for_sub_slice(instance, settings, billboard_index)
        } else {
            OmmRequest::new(instance, settings)
        };
        let item = self.cache.get_mut(&request.source_hash)?;
        if item.state < CacheState::Built || !item.is_compatible_with(&request) {
            return None;
        }
        let buffers = item.blas_buffers.clone()?;

        item.last_use_frame_index = self.current_frame_index;
        if item.state == CacheState::Built {
            // The acceleration structure build must wait on the micromap
            // build; recorded at the BLAS build hook.
            self.bound_omms_require_synchronization = true;
        }
        self.lru_list.move_to_back(item.lru_token);

        cmd.track_omm_buffers(&buffers, ResourceAccess::Read);
        geometry.opacity_micromap = Some(buffers.clone());
        self.bound_omms.push(buffers);
        self.num_bound_omms += 1;
        Some(request.source_hash)
    }

    /// Called once per frame right before acceleration structure builds.
    /// Synchronizes freshly built micromaps and promotes them to `Ready`.
    pub fn on_blas_build(&mut self, cmd: &mut dyn CommandList) {
        if !self.bound_omms_require_synchronization {
            return;
        }
        cmd.memory_barrier(BarrierKind::MicromapBuildToAccelStructBuild);
        while let Some(hash) = self.built_list.pop_front() {
            if let Some(item) = self.cache.get_mut(&hash) {
                item.state = CacheState::Ready;
                item.stage_token = Some(self.ready_list.push_back(hash));
            }
        }
        self.bound_omms_require_synchronization = false;
    }

    // ---------------------------------------------------------------------
    // Sizing
    // ---------------------------------------------------------------------

    /// Worst-case device memory one micromap occupies while being produced:
    /// the baked array plus the built buffers, which briefly coexist.
    pub fn estimate_required_vram_size(
        &self,
        num_triangles: u32,
        format: OmmFormat,
        subdivision_level: u16,
    ) -> DeviceSize {
        let level = subdivision_level.min(self.device.max_subdivision_level(format));
        let micro_triangles = num_triangles as u64 * (1u64 << (2 * level as u64));
        let array_size = align_up(
            ceil_divide(micro_triangles * format.bits_per_micro_triangle(), 8),
            OMM_BUFFER_ALIGNMENT,
        );
        let sizes = self.device.micromap_build_sizes(&MicromapUsage {
            count: num_triangles,
            subdivision_level: level,
            format,
        });
        let index_stride = if num_triangles <= u16::MAX as u32 { 2 } else { 4 };
        array_size
            + align_up(sizes.micromap_size, MICROMAP_BUFFER_ALIGNMENT)
            + num_triangles as u64 * index_stride
    }
}

/// Workload scale relative to a 60 Hz frame. Around the 25-200 FPS band the
/// scale grows superlinearly with frame time so slow frames catch up faster;
/// outside the band it continues linearly from the band edges.
fn workload_scale_per_second(frame_time_secs: f32) -> f32 {
    let relative_frame_time = frame_time_secs * 60.0;
    if frame_time_secs > 1.0 / 25.0 {
        relative_frame_time * 1.549
    } else if frame_time_secs < 1.0 / 200.0 {
        relative_frame_time * 0.547
    } else {
        relative_frame_time.powf(1.5)
    }
}

/// Converts a million-micro-triangles-per-second ceiling into this frame's
/// micro-triangle budget.
fn micro_triangle_frame_budget(million_per_second: f32, multiplier: f32, frame_time_secs: f32) -> u32 {
    let per_second = million_per_second.max(0.0) * 1.0e6 * multiplier;
    let second_to_frame_scale = workload_scale_per_second(frame_time_secs) * frame_time_secs;
    (per_second * second_to_frame_scale).min(u32::MAX as f32) as u32
}

fn are_instance_textures_resident(instance: &RtInstance, textures: &[TextureRef]) -> bool {
    let Some(albedo_index) = instance.albedo_opacity_texture_index else {
        return false;
    };
    let Some(albedo) = textures.get(albedo_index as usize) else {
        return false;
    };
    if !albedo.fully_resident {
        return false;
    }
    match instance.secondary_opacity_texture_index {
        Some(index) => textures
            .get(index as usize)
            .map(|texture| texture.fully_resident)
            .unwrap_or(false),
        None => true,
    }
}
