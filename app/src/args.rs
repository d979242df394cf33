//! Command line arguments.

use clap::{Parser, ValueEnum};

use redlilium_frame::{
    BackendType, DepthFogEffect, PostEffect, PresentMode, ToneMapEffect, VignetteEffect,
};

/// Graphics backend selection for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliBackend {
    /// Vulkan when compiled in, otherwise the dummy backend.
    #[default]
    Auto,
    /// Native Vulkan via ash. Opens a window.
    Vulkan,
    /// Simulated GPU. Runs headless.
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Auto => BackendType::Auto,
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

/// Built-in post effects selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliEffect {
    /// Extended Reinhard tone mapping.
    Tonemap,
    /// Radial edge darkening.
    Vignette,
    /// Exponential fog from scene depth.
    Fog,
}

impl CliEffect {
    /// Build the effect.
    pub fn build(self) -> Box<dyn PostEffect> {
        match self {
            Self::Tonemap => Box::new(ToneMapEffect::new()),
            Self::Vignette => Box::new(VignetteEffect::new()),
            Self::Fog => Box::new(DepthFogEffect::new()),
        }
    }
}

/// RedLilium frame renderer demo.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "RedLilium App",
    about = "Drives the RedLilium frame renderer",
    long_about = "Renders an animated gradient into the offscreen target, runs it \
        through the post-process chain and presents it.\n\n\
        EXAMPLES:\n\
          # Open a window on Vulkan\n\
          ./redlilium-app --backend vulkan\n\
        \n\
          # Headless run on the simulated GPU\n\
          ./redlilium-app --backend dummy --max-frames 120 --gpu-latency-ms 4",
    version
)]
pub struct AppArgs {
    /// Graphics backend to use.
    #[arg(long, default_value = "auto", value_enum)]
    pub backend: CliBackend,

    /// Initial surface width in pixels.
    #[arg(long, default_value = "1280")]
    pub width: u32,

    /// Initial surface height in pixels.
    #[arg(long, default_value = "720")]
    pub height: u32,

    /// Frames the CPU may record ahead of the GPU (1-3).
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..=3))]
    pub frames_in_flight: u32,

    /// Exit after rendering N frames.
    #[arg(long)]
    pub max_frames: Option<u64>,

    /// Post effects in execution order.
    #[arg(long, value_enum, value_delimiter = ',', default_value = "tonemap,vignette")]
    pub effects: Vec<CliEffect>,

    /// Disable vertical sync.
    #[arg(long)]
    pub no_vsync: bool,

    /// Enable GPU validation layers.
    #[arg(long)]
    pub validation: bool,

    /// Simulated GPU time per frame on the dummy backend.
    #[arg(long, default_value = "0")]
    pub gpu_latency_ms: u64,
}

impl AppArgs {
    pub fn present_mode(&self) -> PresentMode {
        if self.no_vsync {
            PresentMode::Immediate
        } else {
            PresentMode::Fifo
        }
    }

    /// Whether this run opens a window.
    pub fn windowed(&self) -> bool {
        match self.backend {
            CliBackend::Dummy => false,
            CliBackend::Vulkan => true,
            CliBackend::Auto => cfg!(feature = "vulkan-backend"),
        }
    }
}
