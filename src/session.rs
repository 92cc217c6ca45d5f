//! Camera session of the scanner screen.
//!
//! Holds the screen's camera state and drives setup: permission, provider
//! acquisition, use case construction and lifecycle binding. Setup failures
//! never reach the user; they are logged and the preview stays blank.

use std::sync::mpsc::Sender;
use std::time::Instant;

use log::{info, warn};
use slint::{Rgba8Pixel, SharedPixelBuffer};

use crate::camera::{
    permission, AnalysisExecutor, BackpressureStrategy, CameraError, CameraProvider,
    CameraSelector, ImageAnalysis, PlatformContext, Preview, ProviderFuture, Resolution,
};
use crate::config::ScannerConfig;

pub struct CameraSession {
    context: PlatformContext,
    config: ScannerConfig,
    has_camera_permission: bool,
    permission_requested: bool,
    last_permission_check: Instant,
    viewfinder: Option<Resolution>,
    provider_future: Option<ProviderFuture>,
    camera_provider: Option<CameraProvider>,
    preview: Option<Preview>,
    image_analysis: Option<ImageAnalysis>,
    camera_selector: CameraSelector,
    /// Reserved for frame analysis.
    camera_executor: Option<AnalysisExecutor>,
    preview_surface: Sender<SharedPixelBuffer<Rgba8Pixel>>,
}

impl CameraSession {
    pub fn new(
        context: PlatformContext,
        config: ScannerConfig,
        preview_surface: Sender<SharedPixelBuffer<Rgba8Pixel>>,
    ) -> Self {
        let granted = permission::has_camera_permission(&context).unwrap_or_else(|err| {
            warn!("camera permission check failed: {err:?}");
            false
        });
        Self::with_permission(context, config, preview_surface, granted)
    }

    fn with_permission(
        context: PlatformContext,
        config: ScannerConfig,
        preview_surface: Sender<SharedPixelBuffer<Rgba8Pixel>>,
        has_camera_permission: bool,
    ) -> Self {
        let camera_executor = match AnalysisExecutor::single_thread("camera-analysis") {
            Ok(executor) => Some(executor),
            Err(err) => {
                warn!("failed to start analysis executor: {err:?}");
                None
            }
        };
        Self {
            camera_selector: config.camera_selector,
            context,
            config,
            has_camera_permission,
            permission_requested: false,
            last_permission_check: Instant::now(),
            viewfinder: None,
            provider_future: None,
            camera_provider: None,
            preview: None,
            image_analysis: None,
            camera_executor,
            preview_surface,
        }
    }

    pub fn has_camera_permission(&self) -> bool {
        self.has_camera_permission
    }

    pub fn camera_selector(&self) -> CameraSelector {
        self.camera_selector
    }

    pub fn is_provider_pending(&self) -> bool {
        self.provider_future.is_some()
    }

    pub fn camera_provider(&self) -> Option<&CameraProvider> {
        self.camera_provider.as_ref()
    }

    pub fn image_analysis(&self) -> Option<&ImageAnalysis> {
        self.image_analysis.as_ref()
    }

    pub fn camera_executor(&self) -> Option<&AnalysisExecutor> {
        self.camera_executor.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.camera_provider
            .as_ref()
            .is_some_and(|provider| provider.camera().is_some())
    }

    pub fn torch_enabled(&self) -> bool {
        self.camera_provider
            .as_ref()
            .and_then(|provider| provider.camera())
            .is_some_and(|camera| camera.torch_enabled())
    }

    /// Begin setup for a viewfinder of `viewfinder` physical pixels. With a
    /// provider already at hand (after [`CameraSession::shutdown`]) the use
    /// cases are rebuilt and bound again.
    pub fn start(&mut self, viewfinder: Resolution) {
        self.viewfinder = Some(viewfinder);
        if !self.has_camera_permission {
            if !self.permission_requested {
                self.permission_requested = true;
                self.last_permission_check = Instant::now();
                if let Err(err) = permission::request_camera_permission(&self.context) {
                    warn!("camera permission request failed: {err:?}");
                }
            }
            return;
        }

        if self.camera_provider.is_some() {
            if let Err(err) = self.setup_use_cases() {
                warn!("camera setup failed: {err}");
            }
        } else {
            self.acquire_provider();
        }
    }

    /// Called from the UI thread timer: picks up the permission answer and
    /// the provider once they are available.
    pub fn poll(&mut self) {
        if !self.has_camera_permission
            && self.permission_requested
            && self.last_permission_check.elapsed() >= self.config.permission_poll_interval
        {
            self.last_permission_check = Instant::now();
            if let Ok(true) = permission::has_camera_permission(&self.context) {
                self.on_permission_result(true);
            }
        }

        let result = self.provider_future.as_mut().and_then(|f| f.try_get());
        if let Some(result) = result {
            self.provider_future = None;
            self.on_provider_ready(result);
        }
    }

    pub fn on_permission_result(&mut self, granted: bool) {
        self.has_camera_permission = granted;
        if !granted {
            warn!("{}", CameraError::PermissionDenied);
            return;
        }
        info!("camera permission granted");
        if self.viewfinder.is_some() {
            self.acquire_provider();
        }
    }

    fn acquire_provider(&mut self) {
        if self.camera_provider.is_none() && self.provider_future.is_none() {
            self.provider_future = Some(CameraProvider::get_instance(&self.context));
        }
    }

    pub fn on_provider_ready(&mut self, result: Result<CameraProvider, CameraError>) {
        match result {
            Ok(provider) => {
                self.camera_provider = Some(provider);
                if let Err(err) = self.setup_use_cases() {
                    warn!("camera setup failed: {err}");
                }
            }
            Err(err) => warn!("camera provider failed: {err}"),
        }
    }

    fn setup_use_cases(&mut self) -> Result<(), CameraError> {
        let viewfinder = self.viewfinder.unwrap_or(Resolution::new(
            self.config.preview_width,
            self.config.preview_height,
        ));

        let mut preview = Preview::new();
        preview.set_surface_provider(self.preview_surface.clone());
        let image_analysis = ImageAnalysis::builder()
            .target_resolution(viewfinder)
            .backpressure_strategy(BackpressureStrategy::KeepOnlyLatest)
            .build();
        // no analyzer yet: frames are dropped at the analysis stage

        self.preview = Some(preview);
        self.image_analysis = Some(image_analysis);
        self.rebind()
    }

    fn rebind(&mut self) -> Result<(), CameraError> {
        let (Some(provider), Some(preview), Some(analysis)) = (
            self.camera_provider.as_mut(),
            self.preview.as_ref(),
            self.image_analysis.as_ref(),
        ) else {
            return Err(CameraError::ProviderUnavailable);
        };
        provider.unbind_all();
        provider.bind_to_lifecycle(self.camera_selector, analysis, preview)?;
        Ok(())
    }

    /// Flip between the back and the front camera.
    pub fn switch_camera(&mut self) {
        self.camera_selector = self.camera_selector.toggled();
        info!("camera selector: {:?}", self.camera_selector);
        if self.camera_provider.is_some() {
            if let Err(err) = self.rebind() {
                warn!("camera rebind failed: {err}");
            }
        }
    }

    /// Returns the torch state after the call.
    pub fn set_torch(&mut self, on: bool) -> bool {
        let Some(camera) = self
            .camera_provider
            .as_mut()
            .and_then(|provider| provider.camera_mut())
        else {
            info!("torch ignored, no camera bound");
            return false;
        };
        if let Err(err) = camera.enable_torch(on) {
            info!("torch unavailable: {err}");
        }
        camera.torch_enabled()
    }

    /// Release the camera. The session can be started again afterwards.
    pub fn shutdown(&mut self) {
        if let Some(provider) = self.camera_provider.as_mut() {
            provider.unbind_all();
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, not(any(target_os = "android", target_os = "windows"))))]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;
    use crate::camera::{loopback, CameraInfo, LensFacing};

    fn session(granted: bool) -> CameraSession {
        let (sender, _receiver) = channel();
        CameraSession::with_permission(
            PlatformContext::new(),
            ScannerConfig::default(),
            sender,
            granted,
        )
    }

    fn provider(cameras: Vec<CameraInfo>) -> Result<CameraProvider, CameraError> {
        Ok(CameraProvider::new(PlatformContext::new(), cameras))
    }

    fn back_camera() -> CameraInfo {
        CameraInfo {
            id: "test-back".into(),
            lens_facing: LensFacing::Back,
            sensor_orientation: 90,
            output_sizes: vec![Resolution::new(1920, 1080)],
            has_flash: true,
        }
    }

    #[test]
    fn no_provider_without_permission() {
        let mut session = session(false);
        session.start(Resolution::new(1080, 1920));
        assert!(!session.has_camera_permission());
        assert!(!session.is_provider_pending());

        session.on_permission_result(true);
        assert!(session.is_provider_pending());
    }

    #[test]
    fn denied_permission_leaves_preview_blank() {
        let mut session = session(false);
        session.start(Resolution::new(1080, 1920));
        session.on_permission_result(false);
        assert!(!session.is_provider_pending());
        assert!(session.camera_provider().is_none());
    }

    #[test]
    fn provider_is_requested_once_permission_is_held() {
        let mut session = session(true);
        session.start(Resolution::new(1080, 1920));
        assert!(session.is_provider_pending());

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.is_provider_pending() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
            session.poll();
        }
        assert!(session.camera_provider().is_some());
    }

    #[test]
    fn setup_failure_is_swallowed() {
        let mut session = session(true);
        session.start(Resolution::new(1080, 1920));
        session.on_provider_ready(provider(vec![]));

        assert!(session.camera_provider().is_some());
        assert!(!session.is_bound());
        let analysis = session.image_analysis().unwrap();
        assert_eq!(analysis.target_resolution(), Resolution::new(1080, 1920));
        assert_eq!(
            analysis.backpressure_strategy(),
            BackpressureStrategy::KeepOnlyLatest
        );
        assert!(!analysis.has_analyzer());
    }

    #[test]
    fn provider_error_is_swallowed() {
        let mut session = session(true);
        session.on_provider_ready(Err(CameraError::ProviderUnavailable));
        assert!(session.camera_provider().is_none());
        assert!(session.image_analysis().is_none());
    }

    fn front_camera() -> CameraInfo {
        CameraInfo {
            id: "test-front".into(),
            lens_facing: LensFacing::Front,
            sensor_orientation: 270,
            output_sizes: vec![Resolution::new(1280, 720)],
            has_flash: false,
        }
    }

    fn bound_facing(session: &CameraSession) -> Option<LensFacing> {
        session
            .camera_provider()?
            .camera()
            .map(|camera| camera.info().lens_facing)
    }

    #[test]
    fn provider_ready_binds_the_selected_camera() {
        let mut session = session(true);
        session.start(Resolution::new(1080, 1920));
        session.on_provider_ready(provider(vec![front_camera(), back_camera()]));

        assert!(session.is_bound());
        assert_eq!(bound_facing(&session), Some(LensFacing::Back));
        let camera = session.camera_provider().unwrap().camera().unwrap();
        assert_eq!(camera.resolution(), Resolution::new(1920, 1080));
        assert_eq!(loopback::events(), ["open test-back"]);
    }

    #[test]
    fn switching_closes_the_old_camera_before_binding() {
        let mut session = session(true);
        session.on_provider_ready(provider(vec![back_camera(), front_camera()]));

        session.switch_camera();
        assert_eq!(session.camera_selector(), CameraSelector::Front);
        assert_eq!(bound_facing(&session), Some(LensFacing::Front));
        assert_eq!(
            loopback::events(),
            ["open test-back", "close test-back", "open test-front"]
        );
    }

    #[test]
    fn switching_to_a_missing_lens_leaves_preview_blank() {
        let mut session = session(true);
        assert_eq!(session.camera_selector(), CameraSelector::Back);
        session.on_provider_ready(provider(vec![back_camera()]));
        assert!(session.is_bound());

        session.switch_camera();
        assert_eq!(session.camera_selector(), CameraSelector::Front);
        assert!(!session.is_bound());

        session.switch_camera();
        assert_eq!(session.camera_selector(), CameraSelector::Back);
        assert!(session.is_bound());
    }

    #[test]
    fn torch_needs_a_bound_camera() {
        let mut session = session(true);
        assert!(!session.set_torch(true));
        assert!(!session.torch_enabled());
    }

    #[test]
    fn torch_follows_flash_support() {
        let mut session = session(true);
        session.on_provider_ready(provider(vec![back_camera(), front_camera()]));
        assert!(session.set_torch(true));
        assert!(session.torch_enabled());
        assert!(!session.set_torch(false));

        session.switch_camera();
        assert!(!session.set_torch(true));
        assert!(!session.torch_enabled());
    }

    #[test]
    fn start_after_shutdown_binds_again() {
        let mut session = session(true);
        session.on_provider_ready(provider(vec![back_camera()]));
        session.shutdown();
        assert!(!session.is_bound());

        session.start(Resolution::new(1080, 1920));
        assert!(session.is_bound());
        assert!(!session.is_provider_pending());
        assert_eq!(
            loopback::events(),
            ["open test-back", "close test-back", "open test-back"]
        );
    }

    #[test]
    fn executor_is_reserved() {
        let session = session(true);
        assert!(session.camera_executor().is_some());
    }
}
