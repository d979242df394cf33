//! Common types and descriptors shared by the frame components.
//!
//! This module contains format enums, usage flags, and the small value
//! structs used to describe targets, viewports and clears.

mod common;
mod texture;

pub use common::{ClearValues, Extent2d, ScissorRect, Viewport};
pub use texture::{TextureDescriptor, TextureFormat, TextureUsage};
