use crate::frame::{Frame, FrameSource, LatestFrame};
use opencv::{core::Mat, imgproc, prelude::*, videoio};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera {0}: {1}")]
    OpenCameraFailed(i32, opencv::Error),
    #[error("Camera {0} is not available")]
    CameraUnavailable(i32),
    #[error("Capture thread exited before reporting")]
    CaptureThreadGone,
}

/// Webcam capture on a dedicated thread. Only the newest frame is kept;
/// readers never wait on the device.
pub struct Camera {
    latest: LatestFrame,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Camera {
    pub fn open(device_index: i32) -> Result<Self, CameraError> {
        let latest = LatestFrame::new();
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = {
            let latest = latest.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("camera-capture".into())
                .spawn(move || capture_loop(device_index, latest, running, ready_tx))
                .map_err(|_| CameraError::CaptureThreadGone)?
        };

        ready_rx
            .recv()
            .map_err(|_| CameraError::CaptureThreadGone)??;

        tracing::info!(device_index, "Camera opened");
        Ok(Self {
            latest,
            running,
            worker: Some(worker),
        })
    }
}

impl FrameSource for Camera {
    fn current_frame(&self) -> Option<Frame> {
        self.latest.current_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn capture_loop(
    device_index: i32,
    latest: LatestFrame,
    running: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), CameraError>>,
) {
    let mut capture = match videoio::VideoCapture::new(device_index, videoio::CAP_ANY) {
        Ok(capture) => capture,
        Err(e) => {
            let _ = ready.send(Err(CameraError::OpenCameraFailed(device_index, e)));
            return;
        }
    };
    if !capture.is_opened().unwrap_or(false) {
        let _ = ready.send(Err(CameraError::CameraUnavailable(device_index)));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut bgr = Mat::default();
    let mut rgb = Mat::default();
    while running.load(Ordering::Relaxed) {
        match capture.read(&mut bgr) {
            Ok(true) if !bgr.empty() => match to_frame(&bgr, &mut rgb) {
                Ok(frame) => latest.publish(frame),
                Err(e) => tracing::warn!(error = %e, "Failed to convert camera frame"),
            },
            Ok(_) => {
                latest.clear();
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read camera frame");
                latest.clear();
                thread::sleep(Duration::from_millis(250));
            }
        }
    }

    tracing::info!(device_index, "Camera capture stopped");
}

fn to_frame(bgr: &Mat, rgb: &mut Mat) -> opencv::Result<Frame> {
    imgproc::cvt_color_def(bgr, rgb, imgproc::COLOR_BGR2RGB)?;
    let width = rgb.cols().max(0) as u32;
    let height = rgb.rows().max(0) as u32;
    let data = rgb.data_bytes()?.to_vec();
    Ok(Frame::new(width, height, data))
}
