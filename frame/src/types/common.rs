//! Common types shared across the frame system.

// ============================================================================
// Viewport
// ============================================================================

/// Viewport configuration for rendering.
///
/// Uses the `[0, 1]` depth range with the origin in the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// X coordinate of the viewport's top-left corner.
    pub x: f32,
    /// Y coordinate of the viewport's top-left corner.
    pub y: f32,
    /// Width of the viewport.
    pub width: f32,
    /// Height of the viewport.
    pub height: f32,
    /// Minimum depth value (default: 0.0).
    pub min_depth: f32,
    /// Maximum depth value (default: 1.0).
    pub max_depth: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

impl Viewport {
    /// Create a new viewport with standard `[0, 1]` depth range.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    /// Create a viewport covering the whole extent.
    pub fn from_extent(extent: Extent2d) -> Self {
        Self::new(0.0, 0.0, extent.width as f32, extent.height as f32)
    }
}

// ============================================================================
// Scissor Rectangle
// ============================================================================

/// Scissor rectangle for clipping rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorRect {
    /// X coordinate of the top-left corner.
    pub x: i32,
    /// Y coordinate of the top-left corner.
    pub y: i32,
    /// Width of the scissor rectangle.
    pub width: u32,
    /// Height of the scissor rectangle.
    pub height: u32,
}

impl ScissorRect {
    /// Create a new scissor rectangle.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a scissor rectangle covering the whole extent.
    pub fn from_extent(extent: Extent2d) -> Self {
        Self::new(0, 0, extent.width, extent.height)
    }
}

// ============================================================================
// Extent2d
// ============================================================================

/// 2D extent of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Extent2d {
    /// Create a new extent.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Extent2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Clear values applied when a pass begins.
///
/// `None` keeps the previous contents of the attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    /// RGBA clear color.
    pub color: Option<[f32; 4]>,
    /// Depth clear value.
    pub depth: Option<f32>,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: Some([0.0, 0.0, 0.0, 1.0]),
            depth: Some(1.0),
        }
    }
}

impl ClearValues {
    /// Clear color and depth with the given values.
    pub fn new(color: [f32; 4], depth: f32) -> Self {
        Self {
            color: Some(color),
            depth: Some(depth),
        }
    }

    /// Keep the previous attachment contents.
    pub fn load() -> Self {
        Self {
            color: None,
            depth: None,
        }
    }
}
