#[cfg(feature = "camera")]
pub mod camera;
mod routes;

pub mod app;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod frame;
pub mod server;
pub mod session;
pub mod telemetry;

pub use app::start_app;
pub use controller::{ControllerState, ResultSink, StreamingController, StreamingSettings};
pub use encoder::{FrameEncoder, JpegDataUrlEncoder, Payload, Resolution};
pub use frame::{Frame, FrameSource, LatestFrame};
pub use session::{InferenceResult, Transport, TransportError};
