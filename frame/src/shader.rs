//! Shader compilation boundary.
//!
//! Pipelines consume [`ShaderBinary`]s produced by a [`ShaderCompiler`]
//! service. The default service, [`WgslCompiler`], parses WGSL with naga,
//! validates it, and writes SPIR-V for one entry point at a time.
//! Compilation failures surface as [`FrameError::ShaderCompilationFailed`]
//! and are fatal when they happen while building startup pipelines.

use std::borrow::Cow;
use std::fmt;

use crate::error::FrameError;

/// Shader pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex stage.
    Vertex,
    /// Fragment stage.
    Fragment,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            Self::Vertex => naga::ShaderStage::Vertex,
            Self::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

/// WGSL source text with a debug label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    label: Cow<'static, str>,
    wgsl: Cow<'static, str>,
}

impl ShaderSource {
    /// Wrap WGSL source.
    pub fn wgsl(label: impl Into<Cow<'static, str>>, wgsl: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            wgsl: wgsl.into(),
        }
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Source text.
    pub fn text(&self) -> &str {
        &self.wgsl
    }
}

/// Compiled SPIR-V for a single entry point.
#[derive(Clone, PartialEq, Eq)]
pub struct ShaderBinary {
    stage: ShaderStage,
    entry_point: String,
    words: Vec<u32>,
}

impl ShaderBinary {
    /// Stage the binary was compiled for.
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Entry point name.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// SPIR-V words.
    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

impl fmt::Debug for ShaderBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderBinary")
            .field("stage", &self.stage)
            .field("entry_point", &self.entry_point)
            .field("words", &self.words.len())
            .finish()
    }
}

/// Turns shader source into binaries for one stage and entry point.
pub trait ShaderCompiler: Send + Sync {
    /// Compile `entry_point` of `source` for `stage`.
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<ShaderBinary, FrameError>;
}

/// WGSL to SPIR-V compiler built on naga.
#[derive(Debug, Default, Clone, Copy)]
pub struct WgslCompiler;

impl WgslCompiler {
    /// Create a compiler.
    pub fn new() -> Self {
        Self
    }
}

impl ShaderCompiler for WgslCompiler {
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<ShaderBinary, FrameError> {
        let module = naga::front::wgsl::parse_str(source.text()).map_err(|e| {
            FrameError::ShaderCompilationFailed(format!(
                "{}: WGSL parse error: {}",
                source.label(),
                e.emit_to_string(source.text())
            ))
        })?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        let info = validator.validate(&module).map_err(|e| {
            FrameError::ShaderCompilationFailed(format!(
                "{}: validation error: {e}",
                source.label()
            ))
        })?;

        let naga_stage = stage.to_naga();
        if !module
            .entry_points
            .iter()
            .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
        {
            return Err(FrameError::ShaderCompilationFailed(format!(
                "{}: entry point '{entry_point}' not found for stage {stage:?}",
                source.label()
            )));
        }

        let options = naga::back::spv::Options {
            lang_version: (1, 3),
            flags: naga::back::spv::WriterFlags::empty(),
            capabilities: None,
            bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
            binding_map: Default::default(),
            debug_info: None,
            zero_initialize_workgroup_memory:
                naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
        };
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: naga_stage,
            entry_point: entry_point.to_string(),
        };

        let words = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
            .map_err(|e| {
                FrameError::ShaderCompilationFailed(format!(
                    "{}: SPIR-V generation error: {e}",
                    source.label()
                ))
            })?;

        log::trace!(
            "Compiled {}::{entry_point} ({stage:?}, {} words)",
            source.label(),
            words.len()
        );

        Ok(ShaderBinary {
            stage,
            entry_point: entry_point.to_string(),
            words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIANGLE: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(i32(index) - 1);
    let y = f32(i32(index & 1u) * 2 - 1);
    return vec4<f32>(x, y, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 0.0, 1.0);
}
"#;

    #[test]
    fn test_compile_both_stages() {
        let compiler = WgslCompiler::new();
        let source = ShaderSource::wgsl("triangle", TRIANGLE);

        let vertex = compiler
            .compile(&source, ShaderStage::Vertex, "vs_main")
            .unwrap();
        assert_eq!(vertex.stage(), ShaderStage::Vertex);
        assert_eq!(vertex.words()[0], 0x0723_0203);

        let fragment = compiler
            .compile(&source, ShaderStage::Fragment, "fs_main")
            .unwrap();
        assert_eq!(fragment.entry_point(), "fs_main");
    }

    #[test]
    fn test_missing_entry_point() {
        let compiler = WgslCompiler::new();
        let source = ShaderSource::wgsl("triangle", TRIANGLE);
        let result = compiler.compile(&source, ShaderStage::Fragment, "vs_main");
        assert!(matches!(result, Err(FrameError::ShaderCompilationFailed(_))));
    }

    #[test]
    fn test_parse_error() {
        let compiler = WgslCompiler::new();
        let source = ShaderSource::wgsl("broken", "fn main( {");
        let err = compiler
            .compile(&source, ShaderStage::Vertex, "main")
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
