//! Byte-accurate budget accounting for the opacity micromap cache.
//!
//! Two twists over a plain counter. First, the budget is recomputed every
//! frame from live device memory numbers, so it can shrink while memory is
//! still allocated. Second, releases are deferred through a ring one slot
//! deeper than the number of frames in flight: a released buffer may still be
//! referenced by in-flight GPU work, so its bytes only return to the pool
//! once that work is guaranteed complete.

use std::collections::VecDeque;

use crate::gpu::{DeviceMemoryStats, DeviceSize, MAX_FRAMES_IN_FLIGHT};
use crate::settings::OpacityMicromapSettings;
use crate::utils::log_once;

const MB: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct OpacityMicromapMemoryManager {
    budget: DeviceSize,
    used: DeviceSize,
    /// `pending_release[0]` frees next frame start; the back slot collects
    /// this frame's releases.
    pending_release: VecDeque<DeviceSize>,
}

impl Default for OpacityMicromapMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OpacityMicromapMemoryManager {
    pub fn new() -> Self {
        let ring_depth = (MAX_FRAMES_IN_FLIGHT + 1) as usize;
        Self {
            budget: 0,
            used: 0,
            pending_release: std::iter::repeat(0).take(ring_depth).collect(),
        }
    }

    pub fn budget(&self) -> DeviceSize {
        self.budget
    }

    pub fn used(&self) -> DeviceSize {
        self.used
    }

    /// Budget minus current use. The budget can shrink below use, so this
    /// clamps at zero.
    pub fn available(&self) -> DeviceSize {
        self.budget - self.used.min(self.budget)
    }

    /// Bytes sitting in the release ring, not yet returned.
    pub fn pending_released(&self) -> DeviceSize {
        self.pending_release.iter().sum()
    }

    /// Upper bound on what will be available once all pending releases
    /// settle. Eviction decisions compare against this rather than
    /// `available` so they do not over-evict while releases drain.
    pub fn pending_available(&self) -> DeviceSize {
        (self.available() + self.pending_released()).min(self.budget)
    }

    /// Claims `size` bytes from the budget. Fails without side effects when
    /// the immediate headroom is too small.
    pub fn allocate(&mut self, size: DeviceSize) -> bool {
        if size > self.available() {
            log_once!(
                info,
                "[OpacityMicromapMemoryManager::allocate] Out of budget. Requests will be retried once memory frees up."
            );
            return false;
        }
        self.used += size;
        true
    }

    /// Schedules `size` bytes for return to the pool once in-flight frames
    /// that may reference them complete.
    pub fn release(&mut self, size: DeviceSize) {
        if let Some(slot) = self.pending_release.back_mut() {
            *slot += size;
        }
    }

    /// Releases everything currently accounted as used.
    pub fn release_all(&mut self) {
        let used = self.used;
        self.release(used);
    }

    /// Advances the release ring: frees the oldest slot and opens a new one.
    pub fn on_frame_start(&mut self) {
        let matured = self.pending_release.pop_front().unwrap_or(0);
        self.used -= matured.min(self.used);
        self.pending_release.push_back(0);
    }

    /// Recomputes the budget from device memory numbers and settings clamps.
    pub fn update_memory_budget(
        &mut self,
        stats: &DeviceMemoryStats,
        settings: &OpacityMicromapSettings,
    ) {
        let vidmem_size = stats.allocatable_size();
        // Treat the reserved floor as already-used so the cache backs off
        // before starving other allocators.
        let reserved = settings.min_free_vidmem_mb_to_not_allocate * MB;
        let vidmem_used = stats.device_local_used.saturating_add(reserved);
        let free = vidmem_size - vidmem_used.min(vidmem_size);

        let percentage_cap =
            (settings.max_vidmem_size_percentage as f64 * vidmem_size as f64) as DeviceSize;
        let max_allowed = percentage_cap.min(settings.max_budget_size_mb * MB);

        let mut new_budget = free.min(max_allowed);
        if new_budget < settings.min_budget_size_mb * MB {
            // A cache too small to hold a working set just churns.
            new_budget = 0;
        }

        if new_budget == 0 && self.budget != 0 {
            log_once!(
                info,
                "[OpacityMicromapMemoryManager::update_memory_budget] Budget dropped to zero; cached opacity micromaps will be destroyed."
            );
        }
        self.budget = new_budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OpacityMicromapSettings {
        OpacityMicromapSettings {
            min_budget_size_mb: 0,
            min_free_vidmem_mb_to_not_allocate: 0,
            ..OpacityMicromapSettings::default()
        }
    }

    fn manager_with_budget(budget: DeviceSize) -> OpacityMicromapMemoryManager {
        let mut memory = OpacityMicromapMemoryManager::new();
        let stats = DeviceMemoryStats {
            device_local_size: budget * 8,
            device_local_budget: budget * 8,
            device_local_used: 0,
        };
        let settings = OpacityMicromapSettings {
            max_vidmem_size_percentage: 0.125,
            max_budget_size_mb: budget / MB,
            ..settings()
        };
        memory.update_memory_budget(&stats, &settings);
        assert_eq!(memory.budget(), budget);
        memory
    }

    #[test]
    fn allocate_respects_budget() {
        let mut memory = manager_with_budget(1000 * MB);
        assert!(memory.allocate(600 * MB));
        assert!(!memory.allocate(500 * MB));
        assert!(memory.allocate(400 * MB));
        assert_eq!(memory.available(), 0);
    }

    #[test]
    fn release_settles_after_ring_depth_frames() {
        let mut memory = manager_with_budget(1000 * MB);
        assert!(memory.allocate(900 * MB));
        memory.release(200 * MB);

        // Used stays put until the release slot reaches the front.
        assert_eq!(memory.used(), 900 * MB);
        assert_eq!(memory.pending_released(), 200 * MB);
        assert_eq!(memory.pending_available(), 300 * MB);

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            memory.on_frame_start();
            assert_eq!(memory.used(), 900 * MB);
        }
        memory.on_frame_start();
        assert_eq!(memory.used(), 700 * MB);
        assert_eq!(memory.pending_released(), 0);
        assert_eq!(memory.available(), 300 * MB);
    }

    #[test]
    fn budget_shrink_below_use_reports_zero_available() {
        let mut memory = manager_with_budget(1000 * MB);
        assert!(memory.allocate(800 * MB));
        let stats = DeviceMemoryStats {
            device_local_size: 4000 * MB,
            device_local_budget: 4000 * MB,
            device_local_used: 0,
        };
        let s = OpacityMicromapSettings {
            max_vidmem_size_percentage: 0.125,
            max_budget_size_mb: 500,
            ..settings()
        };
        memory.update_memory_budget(&stats, &s);
        assert_eq!(memory.budget(), 500 * MB);
        assert_eq!(memory.used(), 800 * MB);
        assert_eq!(memory.available(), 0);
        assert!(!memory.allocate(1));
    }

    #[test]
    fn budget_below_minimum_collapses_to_zero() {
        let mut memory = OpacityMicromapMemoryManager::new();
        let stats = DeviceMemoryStats {
            device_local_size: 4096 * MB,
            device_local_budget: 4096 * MB,
            device_local_used: 0,
        };
        let s = OpacityMicromapSettings {
            max_vidmem_size_percentage: 0.05,
            min_budget_size_mb: 512,
            min_free_vidmem_mb_to_not_allocate: 0,
            ..OpacityMicromapSettings::default()
        };
        // 5% of 4 GiB is under the 512 MB floor.
        memory.update_memory_budget(&stats, &s);
        assert_eq!(memory.budget(), 0);
    }

    #[test]
    fn reserved_floor_shrinks_the_budget() {
        let mut memory = OpacityMicromapMemoryManager::new();
        let stats = DeviceMemoryStats {
            device_local_size: 8192 * MB,
            device_local_budget: 8192 * MB,
            device_local_used: 5000 * MB,
        };
        let s = OpacityMicromapSettings {
            max_vidmem_size_percentage: 1.0,
            max_budget_size_mb: 8192,
            min_budget_size_mb: 0,
            min_free_vidmem_mb_to_not_allocate: 2560,
            ..OpacityMicromapSettings::default()
        };
        memory.update_memory_budget(&stats, &s);
        // 8192 total - 5000 used - 2560 reserved.
        assert_eq!(memory.budget(), 632 * MB);
    }

    #[test]
    fn release_all_drains_through_the_ring() {
        let mut memory = manager_with_budget(1000 * MB);
        assert!(memory.allocate(400 * MB));
        memory.release_all();
        assert_eq!(memory.used(), 400 * MB);
        for _ in 0..=MAX_FRAMES_IN_FLIGHT {
            memory.on_frame_start();
        }
        assert_eq!(memory.used(), 0);
    }
}
