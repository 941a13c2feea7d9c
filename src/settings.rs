//! Runtime-tunable opacity micromap settings.
//!
//! Every per-frame entry point on the manager takes a settings snapshot, so a
//! caller can flip values between frames (from a config file, console or UI)
//! without the manager holding global state. The manager detects the changes
//! that require a cache rebuild and handles them itself.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

fn default_max_omm_build_requests() -> u32 {
    5000
}
fn default_min_instance_frame_age() -> u32 {
    1
}
fn default_min_num_requests() -> u32 {
    10
}
fn default_min_num_frames_requested() -> u32 {
    5
}
fn default_max_request_frame_age() -> u32 {
    300
}
fn default_subdivision_level() -> u16 {
    8
}
fn default_enable_vertex_and_texture_operations() -> bool {
    true
}
fn default_enable_particles() -> bool {
    true
}
fn default_enable_animated_instances() -> bool {
    false
}
fn default_split_billboard_geometry() -> bool {
    true
}
fn default_max_allowed_billboards_per_instance_to_split() -> u32 {
    16
}
fn default_enable_conservative_estimation() -> bool {
    true
}
fn default_conservative_estimation_max_texel_taps() -> u32 {
    64
}
fn default_max_vidmem_size_percentage() -> f32 {
    0.15
}
fn default_min_budget_size_mb() -> u64 {
    512
}
fn default_max_budget_size_mb() -> u64 {
    1536
}
fn default_min_free_vidmem_mb_to_not_allocate() -> u64 {
    2560
}
fn default_min_usage_frame_age_before_eviction() -> u32 {
    // 15 seconds at 60 Hz.
    60 * 15
}
fn default_max_micro_triangles_to_bake_million_per_second() -> f32 {
    60.0
}
fn default_max_micro_triangles_to_build_million_per_second() -> f32 {
    300.0
}
fn default_num_frames_at_start_to_build_with_high_workload() -> u32 {
    0
}
fn default_workload_high_workload_multiplier() -> u32 {
    20
}
fn default_resolve_transparency_threshold() -> f32 {
    1.0 / 255.0
}
fn default_decal_min_resolve_transparency_threshold() -> f32 {
    0.0
}
fn default_resolve_opaqueness_threshold() -> f32 {
    254.0 / 255.0
}
fn default_true() -> bool {
    true
}

/// Snapshot of every tunable the opacity micromap subsystem consumes.
///
/// All fields have sensible defaults; a partial TOML table deserializes with
/// the missing fields defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpacityMicromapSettings {
    /// Master toggle. When off, the cache is torn down on the next frame
    /// start and no new requests are admitted.
    pub enable: bool,

    /// Hard cap on the number of request-statistics entries tracked at once.
    pub max_omm_build_requests: u32,
    /// An instance must have existed at least this many frames before its
    /// requests count toward admission.
    pub min_instance_frame_age: u32,
    /// A source hash must be requested at least this many times before it is
    /// admitted to the cache.
    pub min_num_requests: u32,
    /// A source hash must be requested on at least this many distinct frames
    /// before it is admitted.
    pub min_num_frames_requested: u32,
    /// Request statistics untouched for this many frames are purged.
    pub max_request_frame_age: u32,

    /// Target micromap subdivision level, clamped to the device maximum.
    pub subdivision_level: u16,
    /// Bake with full fixed-function texture stage and vertex opacity
    /// evaluation. Changing this invalidates all cached data.
    pub enable_vertex_and_texture_operations: bool,
    /// Admit instances classified as particles.
    pub enable_particles: bool,
    /// Admit animated instances. Off by default since the baked opacity of
    /// deforming geometry goes stale.
    pub enable_animated_instances: bool,
    /// Bake billboard quads as independent sub-slices so identical quads
    /// dedupe to one micromap.
    pub split_billboard_geometry: bool,
    /// Instances with more billboards than this are rejected outright when
    /// splitting is on.
    pub max_allowed_billboards_per_instance_to_split: u32,

    /// Resolve "unknown" micro-triangles by sampling the opacity texture up
    /// to `conservative_estimation_max_texel_taps` times.
    pub enable_conservative_estimation: bool,
    pub conservative_estimation_max_texel_taps: u32,

    /// Force all micromaps to the 2-state format.
    pub force_2_state_omm_format: bool,
    /// Allow the 2-state format where the 4-state one adds nothing.
    pub allow_2_state_omm_format: bool,

    /// Fraction of total device-local memory the cache may occupy.
    pub max_vidmem_size_percentage: f32,
    /// Budgets below this collapse to zero (an undersized cache just churns).
    pub min_budget_size_mb: u64,
    pub max_budget_size_mb: u64,
    /// Keep at least this much device-local memory free for everyone else.
    pub min_free_vidmem_mb_to_not_allocate: u64,
    /// Items used within this many frames are not evicted, unless the budget
    /// itself shrank.
    pub min_usage_frame_age_before_eviction: u32,

    /// Baking throughput ceiling, in millions of micro-triangles per second.
    pub max_micro_triangles_to_bake_million_per_second: f32,
    /// Build throughput ceiling, in millions of micro-triangles per second.
    pub max_micro_triangles_to_build_million_per_second: f32,
    /// For this many frames after a camera cut, scale workloads up to fill
    /// the cache quickly.
    pub num_frames_at_start_to_build_with_high_workload: u32,
    pub workload_high_workload_multiplier: u32,

    /// Texture alpha at or below this resolves to transparent.
    pub resolve_transparency_threshold: f32,
    /// Texture alpha at or above this resolves to opaque.
    pub resolve_opaqueness_threshold: f32,
    /// Floor on the transparency threshold for decals, which tend to carry
    /// wide soft edges that should not all resolve to unknown.
    pub decal_min_resolve_transparency_threshold: f32,

    /// Debug toggle: tear the cache down every frame so each bake runs from
    /// scratch.
    pub reset_cache_every_frame: bool,
}

impl Default for OpacityMicromapSettings {
    fn default() -> Self {
        Self {
            enable: default_true(),
            max_omm_build_requests: default_max_omm_build_requests(),
            min_instance_frame_age: default_min_instance_frame_age(),
            min_num_requests: default_min_num_requests(),
            min_num_frames_requested: default_min_num_frames_requested(),
            max_request_frame_age: default_max_request_frame_age(),
            subdivision_level: default_subdivision_level(),
            enable_vertex_and_texture_operations: default_enable_vertex_and_texture_operations(),
            enable_particles: default_enable_particles(),
            enable_animated_instances: default_enable_animated_instances(),
            split_billboard_geometry: default_split_billboard_geometry(),
            max_allowed_billboards_per_instance_to_split:
                default_max_allowed_billboards_per_instance_to_split(),
            enable_conservative_estimation: default_enable_conservative_estimation(),
            conservative_estimation_max_texel_taps: default_conservative_estimation_max_texel_taps(
            ),
            force_2_state_omm_format: false,
            allow_2_state_omm_format: true,
            max_vidmem_size_percentage: default_max_vidmem_size_percentage(),
            min_budget_size_mb: default_min_budget_size_mb(),
            max_budget_size_mb: default_max_budget_size_mb(),
            min_free_vidmem_mb_to_not_allocate: default_min_free_vidmem_mb_to_not_allocate(),
            min_usage_frame_age_before_eviction: default_min_usage_frame_age_before_eviction(),
            max_micro_triangles_to_bake_million_per_second:
                default_max_micro_triangles_to_bake_million_per_second(),
            max_micro_triangles_to_build_million_per_second:
                default_max_micro_triangles_to_build_million_per_second(),
            num_frames_at_start_to_build_with_high_workload:
                default_num_frames_at_start_to_build_with_high_workload(),
            workload_high_workload_multiplier: default_workload_high_workload_multiplier(),
            resolve_transparency_threshold: default_resolve_transparency_threshold(),
            resolve_opaqueness_threshold: default_resolve_opaqueness_threshold(),
            decal_min_resolve_transparency_threshold:
                default_decal_min_resolve_transparency_threshold(),
            reset_cache_every_frame: false,
        }
    }
}

impl OpacityMicromapSettings {
    /// Parses a settings snapshot from a TOML string. Missing fields take
    /// their defaults; the result is validated.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: Self = toml::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Sanity-checks field ranges that would otherwise misbehave silently.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.max_vidmem_size_percentage) {
            bail!(
                "max_vidmem_size_percentage must be within [0, 1], got {}",
                self.max_vidmem_size_percentage
            );
        }
        if self.min_budget_size_mb > self.max_budget_size_mb {
            bail!(
                "min_budget_size_mb ({}) exceeds max_budget_size_mb ({})",
                self.min_budget_size_mb,
                self.max_budget_size_mb
            );
        }
        if self.resolve_transparency_threshold > self.resolve_opaqueness_threshold {
            bail!(
                "resolve_transparency_threshold ({}) exceeds resolve_opaqueness_threshold ({})",
                self.resolve_transparency_threshold,
                self.resolve_opaqueness_threshold
            );
        }
        if self.max_micro_triangles_to_bake_million_per_second < 0.0
            || self.max_micro_triangles_to_build_million_per_second < 0.0
        {
            bail!("micro-triangle throughput ceilings must be non-negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        OpacityMicromapSettings::default()
            .validate()
            .expect("defaults must be valid");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let s = OpacityMicromapSettings::from_toml_str(
            "min_num_requests = 1\nsubdivision_level = 4\n",
        )
        .expect("parse");
        assert_eq!(s.min_num_requests, 1);
        assert_eq!(s.subdivision_level, 4);
        assert_eq!(s.max_omm_build_requests, 5000);
        // High-workload filling is opt-in.
        assert_eq!(s.num_frames_at_start_to_build_with_high_workload, 0);
        assert!(s.enable);
    }

    #[test]
    fn invalid_percentage_rejected() {
        let err = OpacityMicromapSettings::from_toml_str("max_vidmem_size_percentage = 1.5\n");
        assert!(err.is_err());
    }

    #[test]
    fn inverted_budget_bounds_rejected() {
        let err = OpacityMicromapSettings::from_toml_str(
            "min_budget_size_mb = 2048\nmax_budget_size_mb = 1024\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "enable_animated_instances = true").expect("write");
        let text = std::fs::read_to_string(file.path()).expect("read");
        let s = OpacityMicromapSettings::from_toml_str(&text).expect("parse");
        assert!(s.enable_animated_instances);
    }
}
