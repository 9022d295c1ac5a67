// Copyright 2025 SpanVault (https://github.com/spanvault)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Buffer sizing and threshold configuration
//!
//! Immutable after a successful [`BufferProperties::validate`]. The
//! expansion rate is the safety margin added to every size estimate:
//! small buffers have higher relative estimate variance and get the
//! maximum rate, large buffers the minimum, with linear interpolation
//! between the two breakpoints.

use serde::{Deserialize, Serialize};
use spanvault_core::{Result, VaultError};
use spanvault_index::DEFAULT_TIME_BUCKET_US;

/// Sizing and threshold configuration of an evicting buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferProperties {
    /// Buffer capacity in bytes; the denominator of occupancy.
    pub initial_capacity: u64,
    /// Occupancy above which eviction starts.
    pub eviction_occupancy_threshold: f64,
    /// Fraction of the capacity one eviction pass tries to free.
    pub eviction_fragment: f64,
    /// Fraction of the capacity that, once newly accumulated, triggers a
    /// tree-maintenance pass.
    pub maintenance_fraction: f64,
    /// Safety margin applied to size estimates of large buffers.
    pub min_expansion_rate: f64,
    /// Safety margin applied to size estimates of small buffers.
    pub max_expansion_rate: f64,
    /// Buffer sizes up to this many bytes use `max_expansion_rate`.
    pub max_rate_active_till: u64,
    /// Buffer sizes from this many bytes on use `min_expansion_rate`.
    pub min_rate_active_from: u64,
    /// Worker threads used by the maintenance cleanup pass.
    pub cleanup_threads: usize,
    /// Width of the live tree's time-bucket dimension.
    pub time_bucket_us: u64,
    /// Bounded wait of the background workers when idle, in milliseconds.
    pub worker_poll_ms: u64,
}

impl Default for BufferProperties {
    fn default() -> Self {
        Self {
            initial_capacity: 128 * 1024 * 1024,
            eviction_occupancy_threshold: 0.95,
            eviction_fragment: 0.25,
            maintenance_fraction: 0.1,
            min_expansion_rate: 0.05,
            max_expansion_rate: 0.25,
            max_rate_active_till: 64 * 1024 * 1024,
            min_rate_active_from: 1024 * 1024 * 1024,
            cleanup_threads: 2,
            time_bucket_us: DEFAULT_TIME_BUCKET_US,
            worker_poll_ms: 200,
        }
    }
}

impl BufferProperties {
    /// Check threshold ordering and ranges; call before constructing a
    /// buffer. Inconsistent configuration fails here, not at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.initial_capacity == 0 {
            return Err(VaultError::InvalidConfig(
                "initial_capacity must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.eviction_occupancy_threshold)
            || self.eviction_occupancy_threshold == 0.0
        {
            return Err(VaultError::InvalidConfig(format!(
                "eviction_occupancy_threshold {} outside (0, 1]",
                self.eviction_occupancy_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.eviction_fragment) || self.eviction_fragment == 0.0 {
            return Err(VaultError::InvalidConfig(format!(
                "eviction_fragment {} outside (0, 1]",
                self.eviction_fragment
            )));
        }
        if self.maintenance_fraction <= 0.0 {
            return Err(VaultError::InvalidConfig(
                "maintenance_fraction must be positive".to_string(),
            ));
        }
        if self.min_expansion_rate < 0.0 || self.min_expansion_rate > self.max_expansion_rate {
            return Err(VaultError::InvalidConfig(format!(
                "expansion rates inverted: min {} > max {}",
                self.min_expansion_rate, self.max_expansion_rate
            )));
        }
        if self.max_rate_active_till > self.min_rate_active_from {
            return Err(VaultError::InvalidConfig(format!(
                "expansion breakpoints inverted: {} > {}",
                self.max_rate_active_till, self.min_rate_active_from
            )));
        }
        if self.cleanup_threads == 0 {
            return Err(VaultError::InvalidConfig(
                "cleanup_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Safety margin for a buffer of `buffer_size` bytes.
    pub fn expansion_rate(&self, buffer_size: u64) -> f64 {
        if buffer_size <= self.max_rate_active_till {
            return self.max_expansion_rate;
        }
        if buffer_size >= self.min_rate_active_from {
            return self.min_expansion_rate;
        }
        let span = (self.min_rate_active_from - self.max_rate_active_till) as f64;
        let progress = (buffer_size - self.max_rate_active_till) as f64 / span;
        self.max_expansion_rate - progress * (self.max_expansion_rate - self.min_expansion_rate)
    }

    /// Bytes one eviction pass tries to free.
    pub fn eviction_target_bytes(&self) -> u64 {
        (self.initial_capacity as f64 * self.eviction_fragment) as u64
    }

    /// Newly accumulated bytes that trigger a maintenance pass.
    pub fn maintenance_threshold_bytes(&self) -> u64 {
        (self.initial_capacity as f64 * self.maintenance_fraction) as u64
    }
}
