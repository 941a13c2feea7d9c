//! Derivation of opacity micromap build requests from instances.
//!
//! A request captures everything that identifies one micromap: the combined
//! source hash, the triangle range it covers and the opacity format it bakes
//! to. Instances with split billboard geometry produce one request per
//! distinct quad; everything else produces a single whole-instance request.

use crate::gpu::OmmFormat;
use crate::hash::{self, EMPTY_HASH};
use crate::instance::RtInstance;
use crate::settings::OpacityMicromapSettings;

/// Triangles per billboard quad.
pub const TRIANGLES_PER_BILLBOARD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmmRequest {
    /// Cache key. Identical content on different instances produces the same
    /// hash and shares one cache item.
    pub source_hash: u64,
    pub num_triangles: u32,
    pub triangle_offset: u32,
    pub format: OmmFormat,
    /// Which billboard quad this covers, for sub-slice requests.
    pub sub_slice_index: Option<u32>,
}

impl OmmRequest {
    /// Request covering the whole instance.
    pub fn new(instance: &RtInstance, settings: &OpacityMicromapSettings) -> Self {
        Self::build(instance, settings, None)
    }

    /// Request covering one billboard quad of the instance.
    pub fn for_sub_slice(
        instance: &RtInstance,
        settings: &OpacityMicromapSettings,
        sub_slice_index: u32,
    ) -> Self {
        Self::build(instance, settings, Some(sub_slice_index))
    }

    fn build(
        instance: &RtInstance,
        settings: &OpacityMicromapSettings,
        sub_slice_index: Option<u32>,
    ) -> Self {
        let (num_triangles, triangle_offset) = match sub_slice_index {
            Some(index) => (TRIANGLES_PER_BILLBOARD, TRIANGLES_PER_BILLBOARD * index),
            None => (instance.num_triangles, 0),
        };
        let format = Self::select_format(instance, settings, sub_slice_index.is_some());
        let source_hash = Self::derive_source_hash(instance, sub_slice_index, num_triangles, format);
        Self {
            source_hash,
            num_triangles,
            triangle_offset,
            format,
            sub_slice_index,
        }
    }

    pub fn is_sub_slice(&self) -> bool {
        self.sub_slice_index.is_some()
    }

    /// Combines every input that affects the baked opacity bits. Two requests
    /// with equal hashes bake byte-identical micromaps.
    fn derive_source_hash(
        instance: &RtInstance,
        sub_slice_index: Option<u32>,
        num_triangles: u32,
        format: OmmFormat,
    ) -> u64 {
        let surface = &instance.surface;
        let mut h = hash::combine(EMPTY_HASH, &instance.material_data_hash);
        h = hash::combine(h, &surface.alpha_state);
        h = hash::combine(h, &surface.texture_color_arg1_source);
        h = hash::combine(h, &surface.texture_color_arg2_source);
        h = hash::combine(h, &surface.texture_color_operation);
        h = hash::combine(h, &surface.texture_alpha_arg1_source);
        h = hash::combine(h, &surface.texture_alpha_arg2_source);
        h = hash::combine(h, &surface.texture_alpha_operation);
        h = hash::combine(h, &surface.t_factor);
        match sub_slice_index {
            Some(index) => {
                // Quads dedupe on their own texture coordinates and vertex
                // opacity, independent of position within the instance.
                let billboard = &instance.billboards[index as usize];
                h = hash::combine(h, &billboard.texcoord_hash);
                h = hash::combine(h, &billboard.vertex_opacity_hash);
            }
            None => {
                h = hash::combine(h, &instance.texcoord_hash);
                h = hash::combine(h, &surface.texture_transform_hash);
            }
        }
        h = hash::combine(h, &num_triangles);
        hash::combine(h, &format)
    }

    fn select_format(
        instance: &RtInstance,
        settings: &OpacityMicromapSettings,
        is_sub_slice: bool,
    ) -> OmmFormat {
        if settings.force_2_state_omm_format {
            return OmmFormat::TwoState;
        }
        let alpha = &instance.surface.alpha_state;
        // Billboards resolve crisply, and additive or cutout-style content
        // never benefits from the unknown states.
        let two_state_suffices = is_sub_slice
            || (!alpha.is_fully_opaque && (alpha.is_particle || alpha.is_decal))
            || alpha.emissive_blend;
        if settings.allow_2_state_omm_format && two_state_suffices {
            OmmFormat::TwoState
        } else {
            OmmFormat::FourState
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Billboard;

    fn test_instance() -> RtInstance {
        let mut instance = RtInstance::new(1, 0);
        instance.material_data_hash = 0x1111;
        instance.texcoord_hash = 0x2222;
        instance.num_triangles = 12;
        instance
    }

    fn settings() -> OpacityMicromapSettings {
        OpacityMicromapSettings::default()
    }

    #[test]
    fn identical_instances_share_a_hash() {
        let a = test_instance();
        let mut b = test_instance();
        b.id = 2;
        b.created_frame_index = 40;
        assert_eq!(
            OmmRequest::new(&a, &settings()).source_hash,
            OmmRequest::new(&b, &settings()).source_hash
        );
    }

    #[test]
    fn content_changes_change_the_hash() {
        let a = test_instance();
        let mut b = test_instance();
        b.material_data_hash = 0x9999;
        let mut c = test_instance();
        c.surface.t_factor = 0x80ff_ffff;
        let base = OmmRequest::new(&a, &settings()).source_hash;
        assert_ne!(base, OmmRequest::new(&b, &settings()).source_hash);
        assert_ne!(base, OmmRequest::new(&c, &settings()).source_hash);
    }

    #[test]
    fn sub_slice_requests_cover_quads() {
        let mut instance = test_instance();
        instance.num_triangles = 4;
        instance.billboards = vec![
            Billboard {
                texcoord_hash: 0xaa,
                vertex_opacity_hash: 0xbb,
            },
            Billboard {
                texcoord_hash: 0xcc,
                vertex_opacity_hash: 0xdd,
            },
        ];
        let first = OmmRequest::for_sub_slice(&instance, &settings(), 0);
        let second = OmmRequest::for_sub_slice(&instance, &settings(), 1);
        assert_eq!(first.num_triangles, 2);
        assert_eq!(first.triangle_offset, 0);
        assert_eq!(second.triangle_offset, 2);
        assert_ne!(first.source_hash, second.source_hash);
        assert!(first.is_sub_slice());
    }

    #[test]
    fn identical_quads_dedupe() {
        let mut instance = test_instance();
        instance.billboards = vec![
            Billboard {
                texcoord_hash: 0xaa,
                vertex_opacity_hash: 0xbb,
            };
            3
        ];
        let a = OmmRequest::for_sub_slice(&instance, &settings(), 0);
        let b = OmmRequest::for_sub_slice(&instance, &settings(), 2);
        assert_eq!(a.source_hash, b.source_hash);
    }

    #[test]
    fn format_selection() {
        let mut s = settings();
        let mut instance = test_instance();
        assert_eq!(OmmRequest::new(&instance, &s).format, OmmFormat::FourState);

        instance.surface.alpha_state.is_particle = true;
        assert_eq!(OmmRequest::new(&instance, &s).format, OmmFormat::TwoState);

        // Fully opaque particles keep the richer format.
        instance.surface.alpha_state.is_fully_opaque = true;
        assert_eq!(OmmRequest::new(&instance, &s).format, OmmFormat::FourState);

        s.force_2_state_omm_format = true;
        assert_eq!(OmmRequest::new(&instance, &s).format, OmmFormat::TwoState);

        s.force_2_state_omm_format = false;
        s.allow_2_state_omm_format = false;
        instance.surface.alpha_state.is_fully_opaque = false;
        assert_eq!(OmmRequest::new(&instance, &s).format, OmmFormat::FourState);
    }

    #[test]
    fn format_feeds_the_hash() {
        let mut s = settings();
        let instance = test_instance();
        let four = OmmRequest::new(&instance, &s).source_hash;
        s.force_2_state_omm_format = true;
        let two = OmmRequest::new(&instance, &s).source_hash;
        assert_ne!(four, two);
    }
}
