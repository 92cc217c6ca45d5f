//! Camera provider, use cases and lifecycle binding.
//!
//! A [`CameraProvider`] is obtained asynchronously with
//! [`CameraProvider::get_instance`]. Once ready it binds a [`Preview`] and an
//! [`ImageAnalysis`] stage to one camera picked by a [`CameraSelector`]. The
//! bound device streams RGBA frames to the preview surface and offers them to
//! the analysis stage.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use log::{info, warn};
use slint::{Rgba8Pixel, SharedPixelBuffer};

mod analysis;
pub mod permission;
pub mod yuv;

#[cfg(target_os = "android")]
mod camera2;
#[cfg(target_os = "android")]
mod yuv_gpu;

#[cfg(target_os = "windows")]
mod pcam;

#[cfg(all(test, not(any(target_os = "android", target_os = "windows"))))]
pub(crate) mod loopback;

pub use analysis::{
    AnalysisExecutor, Analyzer, BackpressureStrategy, ImageAnalysis, ImageAnalysisBuilder,
};
pub(crate) use analysis::AnalysisInput;

/// Lock ignoring poisoning: a panicked analyzer must not stop the camera.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("no camera matches the {0:?} selector")]
    NoCameraFound(CameraSelector),
    #[error("camera permission not granted")]
    PermissionDenied,
    #[error("camera provider is unavailable")]
    ProviderUnavailable,
    #[error("{0} is not supported on this camera")]
    Unsupported(&'static str),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Which way the requested camera faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraSelector {
    #[default]
    Back,
    Front,
}

impl CameraSelector {
    pub fn toggled(self) -> Self {
        match self {
            CameraSelector::Back => CameraSelector::Front,
            CameraSelector::Front => CameraSelector::Back,
        }
    }

    pub fn lens_facing(self) -> LensFacing {
        match self {
            CameraSelector::Back => LensFacing::Back,
            CameraSelector::Front => LensFacing::Front,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensFacing {
    Front,
    Back,
    External,
}

impl LensFacing {
    /// Map an `ACAMERA_LENS_FACING` metadata value.
    pub fn from_metadata(value: u8) -> Self {
        match value {
            0 => LensFacing::Front,
            1 => LensFacing::Back,
            _ => LensFacing::External,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraInfo {
    pub id: String,
    pub lens_facing: LensFacing,
    /// Clockwise rotation in degrees needed to show frames upright.
    pub sensor_orientation: i32,
    /// YUV_420_888 output sizes, in sensor orientation.
    pub output_sizes: Vec<Resolution>,
    pub has_flash: bool,
}

/// An upright RGBA camera frame.
#[derive(Clone)]
pub struct Frame {
    pub pixels: SharedPixelBuffer<Rgba8Pixel>,
    pub timestamp_ns: i64,
}

impl Frame {
    pub fn new(pixels: SharedPixelBuffer<Rgba8Pixel>, timestamp_ns: i64) -> Self {
        Self {
            pixels,
            timestamp_ns,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Preview use case. Frames go to the surface set with
/// [`Preview::set_surface_provider`], usually drained by the UI thread.
#[derive(Default)]
pub struct Preview {
    surface: Option<Sender<SharedPixelBuffer<Rgba8Pixel>>>,
}

impl Preview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_surface_provider(&mut self, surface: Sender<SharedPixelBuffer<Rgba8Pixel>>) {
        self.surface = Some(surface);
    }

    pub fn has_surface(&self) -> bool {
        self.surface.is_some()
    }
}

/// Where a running device delivers its frames.
#[derive(Clone)]
pub(crate) struct FrameSink {
    preview: Option<Sender<SharedPixelBuffer<Rgba8Pixel>>>,
    analysis: AnalysisInput,
}

impl FrameSink {
    fn new(preview: &Preview, analysis: &ImageAnalysis) -> Self {
        Self {
            preview: preview.surface.clone(),
            analysis: analysis.input(),
        }
    }

    pub(crate) fn deliver(&self, frame: Frame) -> anyhow::Result<()> {
        self.analysis.offer(frame.clone());
        if let Some(preview) = self.preview.as_ref() {
            preview
                .send(frame.pixels)
                .map_err(|err| anyhow!("{:?}", err))?;
        }
        Ok(())
    }
}

/// Platform handle needed by the camera and permission APIs.
#[derive(Clone)]
pub struct PlatformContext {
    #[cfg(target_os = "android")]
    pub(crate) app: slint::android::AndroidApp,
}

impl PlatformContext {
    pub fn new(#[cfg(target_os = "android")] app: slint::android::AndroidApp) -> Self {
        Self {
            #[cfg(target_os = "android")]
            app,
        }
    }
}

/// Pick the camera for `selector`: the first one facing that way, otherwise
/// the first external camera.
pub fn select_camera(cameras: &[CameraInfo], selector: CameraSelector) -> Option<&CameraInfo> {
    let facing = selector.lens_facing();
    cameras
        .iter()
        .find(|c| c.lens_facing == facing)
        .or_else(|| cameras.iter().find(|c| c.lens_facing == LensFacing::External))
}

/// Choose the stream size for a viewfinder of `target` pixels (display
/// orientation) from the sizes a camera supports (sensor orientation).
///
/// The smallest size covering the target wins; if none covers it, the
/// largest one.
pub fn choose_resolution(
    supported: &[Resolution],
    target: Resolution,
    sensor_orientation: i32,
) -> Option<Resolution> {
    let target = if (sensor_orientation / 90) % 2 != 0 {
        target.transposed()
    } else {
        target
    };

    supported
        .iter()
        .filter(|s| s.width >= target.width && s.height >= target.height)
        .min_by_key(|s| s.area())
        .or_else(|| supported.iter().max_by_key(|s| s.area()))
        .copied()
}

/// Resolves to a [`CameraProvider`] once camera enumeration has finished on
/// its background thread.
pub struct ProviderFuture {
    context: PlatformContext,
    receiver: Receiver<anyhow::Result<Vec<CameraInfo>>>,
}

impl ProviderFuture {
    /// A future that is already resolved with `cameras`.
    pub fn ready(context: PlatformContext, cameras: anyhow::Result<Vec<CameraInfo>>) -> Self {
        let (sender, receiver) = channel();
        let _ = sender.send(cameras);
        Self { context, receiver }
    }

    /// Non-blocking. `None` while enumeration is still running.
    pub fn try_get(&mut self) -> Option<Result<CameraProvider, CameraError>> {
        match self.receiver.try_recv() {
            Ok(Ok(cameras)) => Some(Ok(CameraProvider::new(self.context.clone(), cameras))),
            Ok(Err(err)) => Some(Err(CameraError::Backend(err))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(CameraError::ProviderUnavailable)),
        }
    }
}

/// A camera bound to the screen, streaming to its use cases until unbound.
pub struct BoundCamera {
    info: CameraInfo,
    resolution: Resolution,
    torch: bool,
    device: Device,
}

impl BoundCamera {
    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn torch_enabled(&self) -> bool {
        self.torch
    }

    pub fn enable_torch(&mut self, on: bool) -> Result<(), CameraError> {
        if !self.info.has_flash {
            return Err(CameraError::Unsupported("torch"));
        }
        self.device.set_torch(on)?;
        self.torch = on;
        Ok(())
    }
}

#[cfg(all(test, not(any(target_os = "android", target_os = "windows"))))]
impl BoundCamera {
    /// Feed `frame` through the bound use cases as the device would.
    pub(crate) fn push_frame(&self, frame: Frame) -> anyhow::Result<()> {
        self.device.camera.push(frame)
    }
}

impl Drop for BoundCamera {
    fn drop(&mut self) {
        self.device.close();
        info!("camera {} unbound", self.info.id);
    }
}

struct Device {
    #[cfg(target_os = "android")]
    camera: Box<camera2::AndroidCamera>,
    #[cfg(target_os = "windows")]
    camera: pcam::Camera,
    #[cfg(all(test, not(any(target_os = "android", target_os = "windows"))))]
    camera: loopback::Loopback,
}

impl Device {
    #[allow(unused_variables)]
    fn open(info: &CameraInfo, resolution: Resolution, sink: FrameSink) -> anyhow::Result<Self> {
        #[cfg(target_os = "android")]
        {
            let mut camera = camera2::AndroidCamera::open(info.clone(), sink)?;
            camera.start_preview(resolution)?;
            Ok(Device { camera })
        }
        #[cfg(target_os = "windows")]
        {
            let mut camera = pcam::Camera::new(sink);
            camera.start_preview(&info.id)?;
            Ok(Device { camera })
        }
        #[cfg(all(test, not(any(target_os = "android", target_os = "windows"))))]
        {
            Ok(Device {
                camera: loopback::Loopback::open(info, sink),
            })
        }
        #[cfg(all(not(test), not(any(target_os = "android", target_os = "windows"))))]
        {
            Err(anyhow!("no camera backend for this platform"))
        }
    }

    #[allow(unused_variables)]
    fn set_torch(&mut self, on: bool) -> anyhow::Result<()> {
        #[cfg(target_os = "android")]
        {
            self.camera.set_torch(on)
        }
        #[cfg(all(test, not(any(target_os = "android", target_os = "windows"))))]
        {
            Ok(())
        }
        #[cfg(not(any(
            target_os = "android",
            all(test, not(target_os = "windows"))
        )))]
        {
            Err(anyhow!("torch control is only available on android"))
        }
    }

    fn close(&mut self) {
        #[cfg(any(
            target_os = "android",
            all(test, not(target_os = "windows"))
        ))]
        self.camera.close();
        #[cfg(target_os = "windows")]
        self.camera.stop_preview();
    }
}

fn enumerate_cameras() -> anyhow::Result<Vec<CameraInfo>> {
    #[cfg(target_os = "android")]
    let cameras = camera2::enumerate()?;
    #[cfg(target_os = "windows")]
    let cameras = pcam::enumerate();
    #[cfg(not(any(target_os = "android", target_os = "windows")))]
    let cameras = Vec::new();
    Ok(cameras)
}

/// Knows the available cameras and owns the one bound to the screen.
pub struct CameraProvider {
    context: PlatformContext,
    cameras: Vec<CameraInfo>,
    bound: Option<BoundCamera>,
}

impl CameraProvider {
    pub fn new(context: PlatformContext, cameras: Vec<CameraInfo>) -> Self {
        Self {
            context,
            cameras,
            bound: None,
        }
    }

    /// Start enumerating cameras on a background thread.
    pub fn get_instance(context: &PlatformContext) -> ProviderFuture {
        let (sender, receiver) = channel();
        let spawned = std::thread::Builder::new()
            .name("camera-provider".into())
            .spawn(move || {
                let cameras = enumerate_cameras();
                if let Ok(cameras) = cameras.as_ref() {
                    info!("found {} camera(s): {:?}", cameras.len(), cameras);
                }
                let _ = sender.send(cameras);
            });
        if let Err(err) = spawned {
            warn!("failed to spawn camera provider thread: {err}");
        }
        ProviderFuture {
            context: context.clone(),
            receiver,
        }
    }

    pub fn context(&self) -> &PlatformContext {
        &self.context
    }

    pub fn cameras(&self) -> &[CameraInfo] {
        &self.cameras
    }

    pub fn camera(&self) -> Option<&BoundCamera> {
        self.bound.as_ref()
    }

    pub fn camera_mut(&mut self) -> Option<&mut BoundCamera> {
        self.bound.as_mut()
    }

    pub fn unbind_all(&mut self) {
        self.bound = None;
    }

    /// Open the camera matching `selector` and stream into `preview` and
    /// `analysis`. Anything bound before is released first.
    pub fn bind_to_lifecycle(
        &mut self,
        selector: CameraSelector,
        analysis: &ImageAnalysis,
        preview: &Preview,
    ) -> Result<&mut BoundCamera, CameraError> {
        self.unbind_all();

        let info = select_camera(&self.cameras, selector)
            .ok_or(CameraError::NoCameraFound(selector))?
            .clone();

        let target = analysis.target_resolution();
        let resolution = choose_resolution(&info.output_sizes, target, info.sensor_orientation)
            .unwrap_or(target);

        info!(
            "binding camera {} ({:?}) at {}x{}",
            info.id, info.lens_facing, resolution.width, resolution.height
        );
        let device = Device::open(&info, resolution, FrameSink::new(preview, analysis))?;

        Ok(self.bound.insert(BoundCamera {
            info,
            resolution,
            torch: false,
            device,
        }))
    }
}

#[cfg(all(test, not(any(target_os = "android", target_os = "windows"))))]
mod tests {
    use std::sync::{mpsc::channel, Arc, Mutex};

    use super::*;

    fn camera(id: &str, lens_facing: LensFacing) -> CameraInfo {
        CameraInfo {
            id: id.into(),
            lens_facing,
            sensor_orientation: 90,
            output_sizes: vec![],
            has_flash: false,
        }
    }

    #[test]
    fn selects_by_lens_facing() {
        let cameras = vec![
            camera("0", LensFacing::Back),
            camera("1", LensFacing::Front),
        ];
        assert_eq!(select_camera(&cameras, CameraSelector::Back).unwrap().id, "0");
        assert_eq!(select_camera(&cameras, CameraSelector::Front).unwrap().id, "1");
    }

    #[test]
    fn falls_back_to_external_camera() {
        let cameras = vec![camera("usb", LensFacing::External)];
        assert_eq!(select_camera(&cameras, CameraSelector::Front).unwrap().id, "usb");

        let cameras = vec![camera("1", LensFacing::Front)];
        assert!(select_camera(&cameras, CameraSelector::Back).is_none());
    }

    #[test]
    fn selector_toggles() {
        assert_eq!(CameraSelector::default(), CameraSelector::Back);
        assert_eq!(CameraSelector::Back.toggled(), CameraSelector::Front);
        assert_eq!(CameraSelector::Front.toggled(), CameraSelector::Back);
    }

    #[test]
    fn lens_facing_metadata_values() {
        assert_eq!(LensFacing::from_metadata(0), LensFacing::Front);
        assert_eq!(LensFacing::from_metadata(1), LensFacing::Back);
        assert_eq!(LensFacing::from_metadata(2), LensFacing::External);
    }

    #[test]
    fn resolution_covers_rotated_viewfinder() {
        let sizes = [
            Resolution::new(640, 480),
            Resolution::new(1280, 720),
            Resolution::new(1920, 1080),
            Resolution::new(4032, 3024),
        ];
        // portrait viewfinder on a sensor mounted at 90 degrees
        assert_eq!(
            choose_resolution(&sizes, Resolution::new(1080, 1920), 90),
            Some(Resolution::new(1920, 1080))
        );
        assert_eq!(
            choose_resolution(&sizes, Resolution::new(600, 400), 0),
            Some(Resolution::new(640, 480))
        );
    }

    #[test]
    fn resolution_falls_back_to_largest() {
        let sizes = [Resolution::new(640, 480), Resolution::new(1280, 720)];
        assert_eq!(
            choose_resolution(&sizes, Resolution::new(3000, 3000), 0),
            Some(Resolution::new(1280, 720))
        );
        assert_eq!(choose_resolution(&[], Resolution::new(10, 10), 0), None);
    }

    #[test]
    fn ready_future_resolves_once() {
        let mut future = ProviderFuture::ready(
            PlatformContext::new(),
            Ok(vec![camera("0", LensFacing::Back)]),
        );
        let provider = future.try_get().unwrap().unwrap();
        assert_eq!(provider.cameras().len(), 1);
        assert!(provider.camera().is_none());
        assert!(matches!(
            future.try_get(),
            Some(Err(CameraError::ProviderUnavailable))
        ));
    }

    #[test]
    fn binding_without_matching_camera_fails() {
        let mut provider =
            CameraProvider::new(PlatformContext::new(), vec![camera("1", LensFacing::Front)]);
        let analysis = ImageAnalysis::builder()
            .target_resolution(Resolution::new(720, 1280))
            .build();
        let result = provider.bind_to_lifecycle(CameraSelector::Back, &analysis, &Preview::new());
        assert!(matches!(
            result,
            Err(CameraError::NoCameraFound(CameraSelector::Back))
        ));
        assert!(provider.camera().is_none());
    }

    #[test]
    fn bound_camera_feeds_preview_and_analysis() {
        let mut executor = AnalysisExecutor::single_thread("test-analysis").unwrap();
        let analysis = ImageAnalysis::builder()
            .target_resolution(Resolution::new(720, 1280))
            .build();
        let analyzed = Arc::new(Mutex::new(vec![]));
        let recorded = analyzed.clone();
        analysis.set_analyzer(&executor, move |frame: &Frame| {
            recorded.lock().unwrap().push(frame.timestamp_ns)
        });
        let (sender, receiver) = channel();
        let mut preview = Preview::new();
        preview.set_surface_provider(sender);

        let mut provider =
            CameraProvider::new(PlatformContext::new(), vec![camera("0", LensFacing::Back)]);
        let bound = provider
            .bind_to_lifecycle(CameraSelector::Back, &analysis, &preview)
            .unwrap();
        // no reported sizes: stream at the analysis target
        assert_eq!(bound.resolution(), Resolution::new(720, 1280));
        bound
            .push_frame(Frame::new(SharedPixelBuffer::new(4, 2), 42))
            .unwrap();

        let pixels = receiver.try_recv().unwrap();
        assert_eq!((pixels.width(), pixels.height()), (4, 2));
        executor.shutdown();
        assert_eq!(*analyzed.lock().unwrap(), vec![42]);
    }

    #[test]
    fn closed_preview_surface_is_reported() {
        let analysis = ImageAnalysis::builder().build();
        let (sender, receiver) = channel();
        let mut preview = Preview::new();
        preview.set_surface_provider(sender);
        drop(receiver);

        let mut provider =
            CameraProvider::new(PlatformContext::new(), vec![camera("0", LensFacing::Back)]);
        let bound = provider
            .bind_to_lifecycle(CameraSelector::Back, &analysis, &preview)
            .unwrap();
        assert!(bound
            .push_frame(Frame::new(SharedPixelBuffer::new(1, 1), 0))
            .is_err());
    }

    #[test]
    fn rebinding_closes_the_previous_camera_first() {
        let mut provider = CameraProvider::new(
            PlatformContext::new(),
            vec![camera("0", LensFacing::Back), camera("1", LensFacing::Front)],
        );
        let analysis = ImageAnalysis::builder().build();
        let preview = Preview::new();

        provider
            .bind_to_lifecycle(CameraSelector::Back, &analysis, &preview)
            .unwrap();
        provider
            .bind_to_lifecycle(CameraSelector::Front, &analysis, &preview)
            .unwrap();
        assert_eq!(provider.camera().unwrap().info().id, "1");
        provider.unbind_all();

        assert!(provider.camera().is_none());
        assert_eq!(loopback::events(), ["open 0", "close 0", "open 1", "close 1"]);
    }

    #[test]
    fn lock_survives_a_panicking_holder() {
        let shared = Arc::new(Mutex::new(1));
        let poisoner = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("analyzer failed");
        })
        .join();
        assert!(shared.is_poisoned());
        *lock(&shared) += 1;
        assert_eq!(*lock(&shared), 2);
    }

    #[test]
    fn torch_requires_a_flash() {
        let mut with_flash = camera("0", LensFacing::Back);
        with_flash.has_flash = true;
        let mut provider = CameraProvider::new(
            PlatformContext::new(),
            vec![with_flash, camera("1", LensFacing::Front)],
        );
        let analysis = ImageAnalysis::builder().build();
        let preview = Preview::new();

        let bound = provider
            .bind_to_lifecycle(CameraSelector::Back, &analysis, &preview)
            .unwrap();
        bound.enable_torch(true).unwrap();
        assert!(bound.torch_enabled());

        let bound = provider
            .bind_to_lifecycle(CameraSelector::Front, &analysis, &preview)
            .unwrap();
        assert!(matches!(
            bound.enable_torch(true),
            Err(CameraError::Unsupported("torch"))
        ));
        assert!(!bound.torch_enabled());
    }

    #[test]
    fn provider_enumerates_in_background() {
        let mut future = CameraProvider::get_instance(&PlatformContext::new());
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let result = loop {
            if let Some(result) = future.try_get() {
                break result;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        assert!(result.is_ok());
    }
}
