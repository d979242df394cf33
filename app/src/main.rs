//! RedLilium frame renderer demo.
//!
//! Runs headless on the dummy backend, or in a window on Vulkan when built
//! with the `vulkan-backend` feature.

#[cfg(feature = "vulkan-backend")]
mod app;
mod args;
mod headless;
mod scene;

use std::process::ExitCode;

use clap::Parser;

use args::AppArgs;
use redlilium_frame::FrameError;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    redlilium_frame::init();

    let args = AppArgs::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "vulkan-backend")]
fn run(args: AppArgs) -> Result<(), FrameError> {
    if args.windowed() {
        app::App::run(args)
    } else {
        headless::run(&args)
    }
}

#[cfg(not(feature = "vulkan-backend"))]
fn run(args: AppArgs) -> Result<(), FrameError> {
    if args.backend == args::CliBackend::Vulkan {
        log::warn!("Built without `vulkan-backend`; running headless instead");
    }
    headless::run(&args)
}
