//! panocast: live 360° streaming from a dual-fisheye camera.
//!
//! # Architecture
//!
//! Frames move through three stages, strictly in capture order:
//!
//! 1. **Capture + stitch**: a `DualFisheyeFrame` from the camera is remapped
//!    into an equirectangular `PanoramaFrame` through a precomputed
//!    `RemapTable`, with per-lens brightness and color gains applied before the
//!    seam blend.
//! 2. **Handoff**: a small bounded `FrameChannel` that drops the oldest frame
//!    when the sink falls behind.
//! 3. **Send**: `StreamSink` pipes raw frames into an external encoder that
//!    publishes the stream.
//!
//! The remap table is an immutable snapshot behind `SharedTable`; interactive
//! calibration builds a new one and swaps it in without stalling the stages.
//!
//! # Module Structure
//!
//! - `frame`: frame containers and pixel layout
//! - `calibration`: lens parameters and their persistence
//! - `remap`: fisheye projection and the remap table
//! - `stitch`: per-frame remap, photometric correction, seam blending
//! - `channel`, `sink`: handoff and encoder process
//! - `session`: interactive calibration
//! - `ingest`: camera sources
//! - `pipeline`: stage threads and shutdown
//! - `config`, `ui`, `preview`: runtime configuration and operator output

pub mod calibration;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod preview;
pub mod remap;
pub mod session;
pub mod sink;
pub mod stitch;
pub mod ui;

pub use calibration::{CalibrationConfig, CalibrationStore, Lens, LensParams, OverlapWidth};
pub use channel::{ChannelStats, FrameChannel, OverflowObserver};
pub use config::{AppConfig, RestartPolicy};
pub use error::PipelineError;
pub use frame::{DualFisheyeFrame, PanoramaFrame, PixelFormat, Resolution};
pub use ingest::{CameraConfig, CameraSource};
pub use pipeline::{Pipeline, PipelineSettings};
pub use remap::{BlendCurve, RemapEntry, RemapTable, SharedTable, SourcePoint};
pub use session::{
    CalibrationCommand, CalibrationSession, InputProvider, KeyBindings, SessionOutcome, StdinInput,
};
pub use sink::{Delivery, EncoderSettings, StreamConfig, StreamSink};
pub use stitch::{BrightnessMode, StitchOptions, Stitcher};
