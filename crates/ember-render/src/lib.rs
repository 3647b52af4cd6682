// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Frame synchronization and swapchain lifecycle engine.
//!
//! Backend-agnostic: every GPU call goes through [`gpu::Gpu`]. `ember-render-vk`
//! provides the Vulkan implementation, [`sim`] a timeline simulator.

pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod ledger;
pub mod mesh;
pub mod render_loop;
pub mod sim;
pub mod swapchain;
pub mod upload;

pub use ash::vk;

pub use config::RenderConfig;
pub use device::{select_device, AdapterSource, QueueFamilyIndices, SelectedAdapter};
pub use error::{RenderError, RenderResult};
pub use frame::{FrameSynchronizer, SlotState};
pub use gpu::{AcquireOutcome, Gpu, PresentOutcome};
pub use mesh::GeometryBuffer;
pub use render_loop::{FrameRecorder, LoopStats, RenderLoop, RenderTarget, TickInput, TickOutcome};
pub use swapchain::{ExtentSource, SwapchainManager, SwapchainState};
pub use upload::{StagedUploader, UploadSource};
