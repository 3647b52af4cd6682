// SPDX-License-Identifier: CEPL-1.0
//! Adapter selection for the Device Context.
//!
//! The backend exposes its instance + surface pair as an [`AdapterSource`];
//! [`select_device`] applies the suitability rules without touching any
//! backend-specific type, so the same policy runs against real drivers and
//! the simulator.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::{RenderError, RenderResult};
use crate::gpu::SurfaceSupport;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Families to request queues from; one entry when graphics == present.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// An enumerable set of adapters bound to one surface.
pub trait AdapterSource {
    type Adapter: Copy;

    fn adapters(&self) -> RenderResult<Vec<Self::Adapter>>;
    fn adapter_name(&self, adapter: Self::Adapter) -> String;
    /// Graphics capability of each queue family, indexed by family.
    fn graphics_families(&self, adapter: Self::Adapter) -> Vec<bool>;
    fn supports_present(&self, adapter: Self::Adapter, family: u32) -> RenderResult<bool>;
    fn extensions(&self, adapter: Self::Adapter) -> RenderResult<Vec<String>>;
    fn surface_support(&self, adapter: Self::Adapter) -> RenderResult<SurfaceSupport>;
}

#[derive(Clone, Copy, Debug)]
pub struct SelectedAdapter<A> {
    pub adapter: A,
    pub families: QueueFamilyIndices,
}

/// Scans families in order, recording graphics and present support as it
/// goes, and stops as soon as both are known.
pub fn find_queue_families<S: AdapterSource>(
    source: &S,
    adapter: S::Adapter,
) -> RenderResult<Option<QueueFamilyIndices>> {
    let mut graphics = None;
    let mut present = None;
    for (i, has_graphics) in source.graphics_families(adapter).into_iter().enumerate() {
        if graphics.is_some() && present.is_some() {
            break;
        }
        let i = i as u32;
        if has_graphics {
            graphics = Some(i);
        }
        if source.supports_present(adapter, i)? {
            present = Some(i);
        }
    }
    Ok(graphics
        .zip(present)
        .map(|(graphics, present)| QueueFamilyIndices { graphics, present }))
}

fn missing_extensions(available: &[String], required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|r| !available.iter().any(|a| a == *r))
        .cloned()
        .collect()
}

/// First adapter that satisfies every requirement wins; no ranking.
pub fn select_device<S: AdapterSource>(
    source: &S,
    required_extensions: &[String],
) -> RenderResult<SelectedAdapter<S::Adapter>> {
    let adapters = source.adapters()?;
    for adapter in adapters.iter().copied() {
        let name = source.adapter_name(adapter);

        let Some(families) = find_queue_families(source, adapter)? else {
            debug!("{name}: no graphics+present queue families");
            continue;
        };
        let missing = missing_extensions(&source.extensions(adapter)?, required_extensions);
        if !missing.is_empty() {
            debug!("{name}: missing extensions {missing:?}");
            continue;
        }
        if !source.surface_support(adapter)?.is_adequate() {
            debug!("{name}: surface reports no formats or present modes");
            continue;
        }

        info!(
            "selected adapter {name} (graphics family {}, present family {})",
            families.graphics, families.present
        );
        return Ok(SelectedAdapter { adapter, families });
    }

    Err(RenderError::NoSuitableDevice(format!(
        "{} adapter(s) enumerated, none supports graphics+present with {:?}",
        adapters.len(),
        required_extensions
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAdapter, SimAdapters};

    fn ext() -> Vec<String> {
        vec!["VK_KHR_swapchain".to_owned()]
    }

    #[test]
    fn unique_dedups_shared_family() {
        let shared = QueueFamilyIndices { graphics: 0, present: 0 };
        assert_eq!(shared.unique(), vec![0]);
        let split = QueueFamilyIndices { graphics: 2, present: 1 };
        assert_eq!(split.unique(), vec![1, 2]);
        assert!(!split.is_shared());
    }

    #[test]
    fn first_suitable_adapter_wins() {
        let source = SimAdapters::new(vec![
            SimAdapter::capable("no-present").with_present(vec![false]),
            SimAdapter::capable("first-ok"),
            SimAdapter::capable("second-ok"),
        ]);
        let picked = select_device(&source, &ext()).unwrap();
        assert_eq!(source.adapter_name(picked.adapter), "first-ok");
    }

    #[test]
    fn adapter_without_extension_is_skipped() {
        let source = SimAdapters::new(vec![
            SimAdapter::capable("bare").with_extensions(vec![]),
            SimAdapter::capable("swapchain"),
        ]);
        let picked = select_device(&source, &ext()).unwrap();
        assert_eq!(source.adapter_name(picked.adapter), "swapchain");
    }

    #[test]
    fn adapter_without_present_modes_is_skipped() {
        let mut only = SimAdapter::capable("no-modes");
        only.surface.present_modes.clear();
        let source = SimAdapters::new(vec![only]);
        assert!(matches!(
            select_device(&source, &ext()),
            Err(RenderError::NoSuitableDevice(_))
        ));
    }

    #[test]
    fn split_families_are_found() {
        let adapter = SimAdapter::capable("split")
            .with_graphics(vec![true, false])
            .with_present(vec![false, true]);
        let source = SimAdapters::new(vec![adapter]);
        let picked = select_device(&source, &ext()).unwrap();
        assert_eq!(picked.families, QueueFamilyIndices { graphics: 0, present: 1 });
    }

    #[test]
    fn scan_stops_once_both_roles_are_known() {
        // family 0 is graphics-only, family 1 does both, family 2 does both
        let adapter = SimAdapter::capable("three")
            .with_graphics(vec![true, true, true])
            .with_present(vec![false, true, true]);
        let source = SimAdapters::new(vec![adapter]);
        let families = find_queue_families(&source, 0).unwrap().unwrap();
        assert_eq!(families, QueueFamilyIndices { graphics: 1, present: 1 });
    }

    #[test]
    fn empty_enumeration_fails() {
        let source = SimAdapters::new(vec![]);
        let err = select_device(&source, &ext()).unwrap_err();
        assert!(err.is_setup());
    }
}
