use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use kamera::Camera as KCamera;
use log::{debug, info, warn};
use slint::SharedPixelBuffer;

use super::{yuv, CameraInfo, Frame, FrameSink, LensFacing};

/// Highest device index probed when listing cameras.
const MAX_DEVICES: usize = 4;

/// Desktop webcams have no facing metadata; they are all reported external.
pub fn enumerate() -> Vec<CameraInfo> {
    (0..MAX_DEVICES)
        .filter(|index| KCamera::new_device(*index).is_some())
        .map(|index| CameraInfo {
            id: index.to_string(),
            lens_facing: LensFacing::External,
            sensor_orientation: 0,
            output_sizes: vec![],
            has_flash: false,
        })
        .collect()
}

pub struct Camera {
    camera_handle: Option<Arc<Mutex<bool>>>,
    camera_task: Option<std::thread::JoinHandle<Result<()>>>,
    sink: FrameSink,
}

impl Camera {
    pub fn new(sink: FrameSink) -> Self {
        Self {
            camera_handle: None,
            camera_task: None,
            sink,
        }
    }

    pub fn start_preview(&mut self, id: &str) -> Result<()> {
        let index: usize = id.parse().map_err(|_| anyhow!("invalid camera id {id}"))?;
        self.stop_preview();
        let camera_handle = Arc::new(Mutex::new(true));
        self.camera_handle = Some(camera_handle.clone());
        let sink = self.sink.clone();
        self.camera_task = Some(std::thread::spawn(move || {
            let camera = KCamera::new_device(index).ok_or(anyhow!("camera id not exist"))?;
            camera.start();
            let mut count = 0;
            let started = Instant::now();
            let mut timer = Instant::now();
            let mut rgba_buffer = vec![];
            loop {
                if let Ok(opened) = camera_handle.lock() {
                    if !*opened {
                        break;
                    }
                }

                let frame = match camera.wait_for_frame() {
                    Some(f) => f,
                    None => {
                        warn!("failed to capture a frame");
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                };

                let (width, height) = frame.size_u32();
                let frame_data = frame.data();
                yuv::bgra_to_rgba(frame_data.data_u8(), &mut rgba_buffer);

                let pixels = SharedPixelBuffer::clone_from_slice(&rgba_buffer, width, height);
                let timestamp_ns = started.elapsed().as_nanos() as i64;
                if sink.deliver(Frame::new(pixels, timestamp_ns)).is_err() {
                    // preview surface is gone
                    break;
                }

                count += 1;
                if count == 30 {
                    let time = timer.elapsed().as_millis();
                    debug!("30 frames in {time}ms, {width}x{height}");
                    count = 0;
                    timer = Instant::now();
                }
            }
            camera.stop();
            Ok(())
        }));
        info!("camera {index} started");
        Ok(())
    }

    pub fn stop_preview(&mut self) {
        let mut need_close = false;
        if let Some(handle) = self.camera_handle.as_ref() {
            if let Ok(mut handle) = handle.lock() {
                *handle = false;
                need_close = true;
            }
        }

        if need_close {
            if let Some(handle) = self.camera_task.take() {
                let res = handle.join();
                info!("stop preview: {:?}", res.map(|r| r.is_ok()));
            }
        }
        self.camera_handle = None;
    }
}
