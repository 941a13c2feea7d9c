//! Scene-side inputs to opacity micromap requests.
//!
//! The renderer owns instances; the cache only reads them. An instance
//! carries the content hashes and fixed-function surface state that determine
//! a micromap's identity, plus the flags the admission filters consume. The
//! one field the cache writes back is the derived source hash, kept on the
//! instance so repeat frames skip re-derivation bookkeeping.

use std::cell::Cell;

use crate::hash::EMPTY_HASH;

/// Stable identity of a renderer instance across frames.
pub type InstanceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialType {
    Opaque,
    Translucent,
    RayPortal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlphaTestType {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendType {
    Alpha,
    AlphaEmissive,
    Reverse,
    ReverseEmissive,
    Color,
    ColorEmissive,
    Emissive,
    Multiplicative,
    DoubleMultiplicative,
}

/// Resolved alpha pipeline state of an instance's material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaState {
    pub is_fully_opaque: bool,
    pub is_particle: bool,
    pub is_decal: bool,
    pub is_blending_disabled: bool,
    pub emissive_blend: bool,
    pub alpha_test_type: AlphaTestType,
    pub alpha_test_reference_value: u8,
    pub blend_type: BlendType,
    pub inverted_blend: bool,
}

impl Default for AlphaState {
    fn default() -> Self {
        Self {
            is_fully_opaque: false,
            is_particle: false,
            is_decal: false,
            is_blending_disabled: true,
            emissive_blend: false,
            alpha_test_type: AlphaTestType::Always,
            alpha_test_reference_value: 0,
            blend_type: BlendType::Alpha,
            inverted_blend: false,
        }
    }
}

/// Where a fixed-function texture stage argument comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureArgSource {
    Diffuse,
    Specular,
    Texture,
    TFactor,
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureOperation {
    Disable,
    SelectArg1,
    SelectArg2,
    Modulate,
    Modulate2x,
    Modulate4x,
    Add,
}

/// Fixed-function surface state that feeds the bake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceState {
    pub alpha_state: AlphaState,
    pub texture_color_arg1_source: TextureArgSource,
    pub texture_color_arg2_source: TextureArgSource,
    pub texture_color_operation: TextureOperation,
    pub texture_alpha_arg1_source: TextureArgSource,
    pub texture_alpha_arg2_source: TextureArgSource,
    pub texture_alpha_operation: TextureOperation,
    /// Packed ARGB texture factor register.
    pub t_factor: u32,
    pub texture_transform_hash: u64,
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self {
            alpha_state: AlphaState::default(),
            texture_color_arg1_source: TextureArgSource::Texture,
            texture_color_arg2_source: TextureArgSource::Current,
            texture_color_operation: TextureOperation::Modulate,
            texture_alpha_arg1_source: TextureArgSource::Texture,
            texture_alpha_arg2_source: TextureArgSource::Current,
            texture_alpha_operation: TextureOperation::SelectArg1,
            t_factor: 0xffff_ffff,
            texture_transform_hash: EMPTY_HASH,
        }
    }
}

/// One camera-facing quad within a billboard instance.
#[derive(Debug, Clone, Copy)]
pub struct Billboard {
    pub texcoord_hash: u64,
    pub vertex_opacity_hash: u64,
}

/// Opacity-relevant view of a renderer instance.
#[derive(Debug, Clone)]
pub struct RtInstance {
    pub id: InstanceId,
    pub material_hash: u64,
    /// Hash of the sampled material content (texture data, constants).
    pub material_data_hash: u64,
    pub texcoord_hash: u64,
    pub surface: SurfaceState,
    pub material_type: MaterialType,
    pub num_triangles: u32,
    pub billboards: Vec<Billboard>,
    pub is_animated: bool,
    /// View-model instances replicated per-portal; only the reference copy
    /// may request micromaps.
    pub is_view_model_non_reference: bool,
    pub created_frame_index: u32,
    /// Index into the frame's texture table, when sampled during resolve.
    pub albedo_opacity_texture_index: Option<u32>,
    pub secondary_opacity_texture_index: Option<u32>,
    /// Derived micromap source hash; written by the cache, cleared when the
    /// inputs change.
    omm_source_hash: Cell<u64>,
}

impl RtInstance {
    pub fn new(id: InstanceId, created_frame_index: u32) -> Self {
        Self {
            id,
            material_hash: EMPTY_HASH,
            material_data_hash: EMPTY_HASH,
            texcoord_hash: EMPTY_HASH,
            surface: SurfaceState::default(),
            material_type: MaterialType::Opaque,
            num_triangles: 0,
            billboards: Vec::new(),
            is_animated: false,
            is_view_model_non_reference: false,
            created_frame_index,
            albedo_opacity_texture_index: None,
            secondary_opacity_texture_index: None,
            omm_source_hash: Cell::new(EMPTY_HASH),
        }
    }

    pub fn billboard_count(&self) -> u32 {
        self.billboards.len() as u32
    }

    pub fn frame_age(&self, current_frame_index: u32) -> u32 {
        current_frame_index.saturating_sub(self.created_frame_index)
    }

    pub fn opacity_micromap_source_hash(&self) -> u64 {
        self.omm_source_hash.get()
    }

    pub fn set_opacity_micromap_source_hash(&self, hash: u64) {
        self.omm_source_hash.set(hash);
    }
}

/// View of a texture the bake samples. Bakes stall until the texture is
/// fully resident so partially streamed mips never leak into baked opacity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureRef {
    pub fully_resident: bool,
}

/// Lookup of live instances by id, implemented by the renderer's instance
/// container. The cache holds ids, never references, so a destroyed instance
/// simply stops resolving.
pub trait InstanceRegistry {
    fn instance(&self, id: InstanceId) -> Option<&RtInstance>;
}

impl InstanceRegistry for &[RtInstance] {
    fn instance(&self, id: InstanceId) -> Option<&RtInstance> {
        self.iter().find(|instance| instance.id == id)
    }
}

impl InstanceRegistry for Vec<RtInstance> {
    fn instance(&self, id: InstanceId) -> Option<&RtInstance> {
        self.iter().find(|instance| instance.id == id)
    }
}
