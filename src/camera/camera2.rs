use anyhow::{anyhow, Result};
use core::slice;
use log::{debug, error, info, warn};
use ndk_sys::{
    acamera_metadata_tag, camera_status_t, media_status_t, ACameraCaptureSession,
    ACameraCaptureSession_close, ACameraCaptureSession_setRepeatingRequest,
    ACameraCaptureSession_stateCallbacks, ACameraCaptureSession_stopRepeating, ACameraDevice,
    ACameraDevice_StateCallbacks, ACameraDevice_close, ACameraDevice_createCaptureRequest,
    ACameraDevice_createCaptureSession, ACameraDevice_getId, ACameraDevice_request_template,
    ACameraManager, ACameraManager_create, ACameraManager_delete,
    ACameraManager_deleteCameraIdList, ACameraManager_getCameraCharacteristics,
    ACameraManager_getCameraIdList, ACameraManager_openCamera, ACameraMetadata,
    ACameraMetadata_const_entry, ACameraMetadata_free, ACameraMetadata_getConstEntry,
    ACameraOutputTarget, ACameraOutputTarget_create, ACameraOutputTarget_free, ACaptureRequest,
    ACaptureRequest_addTarget, ACaptureRequest_free, ACaptureRequest_setEntry_u8,
    ACaptureSessionOutput, ACaptureSessionOutputContainer, ACaptureSessionOutputContainer_add,
    ACaptureSessionOutputContainer_create, ACaptureSessionOutputContainer_free,
    ACaptureSessionOutput_create, ACaptureSessionOutput_free, AImageReader,
    AImageReader_ImageListener, AImageReader_acquireLatestImage, AImageReader_delete,
    AImageReader_getFormat, AImageReader_getHeight, AImageReader_getWidth,
    AImageReader_getWindow, AImageReader_new, AImageReader_setImageListener, AImage_delete,
    AImage_getPlaneData, AImage_getTimestamp, ANativeWindow, AIMAGE_FORMATS,
};
use slint::SharedPixelBuffer;
use std::{
    ffi::{c_int, c_void, CStr, CString},
    mem::zeroed,
    ptr::null_mut,
    sync::{Arc, Mutex},
    time::Instant,
};

use super::{
    lock, yuv, yuv_gpu::YuvGpuDecoder, CameraInfo, Frame, FrameSink, LensFacing, Resolution,
};

#[link(name = "camera2ndk")]
extern "C" {}

#[link(name = "mediandk")]
extern "C" {}

// ACAMERA_FLASH_MODE values
const FLASH_MODE_OFF: u8 = 0;
const FLASH_MODE_TORCH: u8 = 2;

/// Owns an `ACameraManager` for the duration of a call.
struct CameraManager(*mut ACameraManager);

impl CameraManager {
    fn new() -> Result<Self> {
        let manager = unsafe { ACameraManager_create() };
        if manager.is_null() {
            return Err(anyhow!("Failed to create camera manager"));
        }
        Ok(Self(manager))
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        unsafe { ACameraManager_delete(self.0) };
    }
}

/// Owns camera characteristics returned by the manager.
struct Metadata(*mut ACameraMetadata);

impl Metadata {
    fn entry(&self, tag: acamera_metadata_tag) -> Option<ACameraMetadata_const_entry> {
        unsafe {
            let mut entry: ACameraMetadata_const_entry = zeroed();
            let status = ACameraMetadata_getConstEntry(self.0, tag.0, &mut entry);
            (status == camera_status_t::ACAMERA_OK && entry.count > 0).then_some(entry)
        }
    }

    fn u8_value(&self, tag: acamera_metadata_tag) -> Option<u8> {
        let entry = self.entry(tag)?;
        Some(unsafe { *entry.data.u8_ })
    }

    fn i32_values(&self, tag: acamera_metadata_tag) -> &[i32] {
        match self.entry(tag) {
            Some(entry) => unsafe { slice::from_raw_parts(entry.data.i32_, entry.count as usize) },
            None => &[],
        }
    }

    /// YUV_420_888 output sizes. Stream configurations are int32 quadruples
    /// of format, width, height, input.
    fn yuv_output_sizes(&self) -> Vec<Resolution> {
        self.i32_values(acamera_metadata_tag::ACAMERA_SCALER_AVAILABLE_STREAM_CONFIGURATIONS)
            .chunks_exact(4)
            .filter(|c| c[3] == 0 && c[0] == AIMAGE_FORMATS::AIMAGE_FORMAT_YUV_420_888.0 as i32)
            .map(|c| Resolution::new(c[1] as u32, c[2] as u32))
            .collect()
    }
}

impl Drop for Metadata {
    fn drop(&mut self) {
        unsafe { ACameraMetadata_free(self.0) };
    }
}

fn characteristics(manager: &CameraManager, id: &CStr) -> Result<Metadata> {
    let mut metadata = null_mut();
    let status =
        unsafe { ACameraManager_getCameraCharacteristics(manager.0, id.as_ptr(), &mut metadata) };
    if status != camera_status_t::ACAMERA_OK || metadata.is_null() {
        return Err(anyhow!(
            "Failed to get camera meta data of id:{:?} (reason: {:?})",
            id,
            status
        ));
    }
    Ok(Metadata(metadata))
}

/// List the cameras known to the camera service.
pub fn enumerate() -> Result<Vec<CameraInfo>> {
    let manager = CameraManager::new()?;
    unsafe {
        let mut camera_id_list_raw = null_mut();
        let camera_status = ACameraManager_getCameraIdList(manager.0, &mut camera_id_list_raw);
        if camera_status != camera_status_t::ACAMERA_OK || camera_id_list_raw.is_null() {
            return Err(anyhow!(
                "Failed to get camera id list (reason: {:?})",
                camera_status
            ));
        }

        let camera_id_list = &*camera_id_list_raw;
        let camera_ids = if camera_id_list.numCameras > 0 {
            slice::from_raw_parts(camera_id_list.cameraIds, camera_id_list.numCameras as usize)
        } else {
            &[]
        };

        let mut cameras = Vec::with_capacity(camera_ids.len());
        for id in camera_ids.iter().map(|id| CStr::from_ptr(*id)) {
            let metadata = match characteristics(&manager, id) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("{err}");
                    continue;
                }
            };

            let lens_facing = metadata
                .u8_value(acamera_metadata_tag::ACAMERA_LENS_FACING)
                .map(LensFacing::from_metadata)
                .unwrap_or(LensFacing::External);
            let sensor_orientation = metadata
                .i32_values(acamera_metadata_tag::ACAMERA_SENSOR_ORIENTATION)
                .first()
                .copied()
                .unwrap_or(0);
            let has_flash = metadata
                .u8_value(acamera_metadata_tag::ACAMERA_FLASH_INFO_AVAILABLE)
                .is_some_and(|v| v != 0);

            cameras.push(CameraInfo {
                id: id.to_string_lossy().into_owned(),
                lens_facing,
                sensor_orientation,
                output_sizes: metadata.yuv_output_sizes(),
                has_flash,
            });
        }

        ACameraManager_deleteCameraIdList(camera_id_list_raw);
        Ok(cameras)
    }
}

/// State shared with the image reader callback thread.
struct FrameContext {
    /// Null once the camera is closing; the callback then does nothing.
    image_reader: *mut AImageReader,
    sensor_orientation: i32,
    mirror: bool,
    decoder_gpu: Option<YuvGpuDecoder>,
    rgba_buffer: Vec<u8>,
    sink: FrameSink,
    timer: Instant,
    frame_count: i32,
}

// The reader pointer is only dereferenced while the context lock is held.
unsafe impl Send for FrameContext {}

/// A camera2 device streaming YUV frames through an `AImageReader`.
///
/// The image reader callback only sees `frames`; everything else is touched
/// from the thread owning the camera.
pub struct AndroidCamera {
    info: CameraInfo,
    camera_device: *mut ACameraDevice,
    capture_request: *mut ACaptureRequest,
    camera_output_target: *mut ACameraOutputTarget,
    session_output: *mut ACaptureSessionOutput,
    capture_session_output_container: *mut ACaptureSessionOutputContainer,
    capture_session: *mut ACameraCaptureSession,
    image_listener: AImageReader_ImageListener,
    capture_session_state_callbacks: ACameraCaptureSession_stateCallbacks,
    device_state_callbacks: ACameraDevice_StateCallbacks,
    resolution: Resolution,
    frames: Arc<Mutex<FrameContext>>,
}

impl AndroidCamera {
    pub fn open(info: CameraInfo, sink: FrameSink) -> Result<Box<Self>> {
        let frames = Arc::new(Mutex::new(FrameContext {
            image_reader: null_mut(),
            sensor_orientation: info.sensor_orientation,
            mirror: info.lens_facing == LensFacing::Front,
            decoder_gpu: None,
            rgba_buffer: vec![],
            sink,
            timer: Instant::now(),
            frame_count: 0,
        }));
        let mut camera = Box::new(Self {
            info,
            camera_device: null_mut(),
            capture_request: null_mut(),
            camera_output_target: null_mut(),
            session_output: null_mut(),
            capture_session_output_container: null_mut(),
            capture_session: null_mut(),
            image_listener: AImageReader_ImageListener {
                context: null_mut(),
                onImageAvailable: None,
            },
            capture_session_state_callbacks: unsafe { zeroed() },
            device_state_callbacks: unsafe { zeroed() },
            resolution: Resolution::new(0, 0),
            frames,
        });

        unsafe extern "C" fn on_disconnected(_data: *mut c_void, device: *mut ACameraDevice) {
            info!("Camera(id: {:?}) is disconnected.", get_cstr(ACameraDevice_getId(device)));
        }

        unsafe extern "C" fn on_error(_data: *mut c_void, device: *mut ACameraDevice, error: c_int) {
            error!(
                "Error(code: {}) on Camera(id: {:?}).",
                error,
                get_cstr(ACameraDevice_getId(device))
            );
        }

        camera.device_state_callbacks.onDisconnected = Some(on_disconnected);
        camera.device_state_callbacks.onError = Some(on_error);

        let manager = CameraManager::new()?;
        let id = CString::new(camera.info.id.as_str())?;
        let camera_status = unsafe {
            ACameraManager_openCamera(
                manager.0,
                id.as_ptr(),
                &mut camera.device_state_callbacks,
                &mut camera.camera_device,
            )
        };
        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!(
                "Failed to open camera device (id: {}, reason: {:?})",
                camera.info.id,
                camera_status
            ));
        }
        info!("camera {} opened", camera.info.id);
        Ok(camera)
    }

    pub fn start_preview(&mut self, resolution: Resolution) -> Result<()> {
        let Resolution { width, height } = resolution;
        self.resolution = resolution;
        {
            let mut frames = lock(&self.frames);
            frames.decoder_gpu = match YuvGpuDecoder::new(width, height) {
                Ok(decoder) => Some(decoder),
                Err(err) => {
                    warn!("gpu decoder unavailable, converting on the cpu: {err}");
                    None
                }
            };
            frames.rgba_buffer = vec![0; (width * height * 4) as usize];
        }
        let image_reader =
            self.create_image_reader(width, height, AIMAGE_FORMATS::AIMAGE_FORMAT_YUV_420_888)?;

        unsafe {
            let camera_status = ACameraDevice_createCaptureRequest(
                self.camera_device,
                ACameraDevice_request_template::TEMPLATE_PREVIEW,
                &mut self.capture_request,
            );
            if camera_status != camera_status_t::ACAMERA_OK {
                return Err(anyhow!(
                    "Failed to create preview capture request (id: {:?})",
                    self.info.id
                ));
            }

            let mut native_window: *mut ANativeWindow = null_mut();
            let res = AImageReader_getWindow(image_reader, &mut native_window);
            if res != media_status_t::AMEDIA_OK {
                return Err(anyhow!("AImageReader_getWindow error res={:?}.", res));
            }

            ACameraOutputTarget_create(native_window, &mut self.camera_output_target);
            ACaptureRequest_addTarget(self.capture_request, self.camera_output_target);
            ACaptureSessionOutput_create(native_window, &mut self.session_output);

            let camera_status =
                ACaptureSessionOutputContainer_create(&mut self.capture_session_output_container);
            if camera_status != camera_status_t::ACAMERA_OK {
                return Err(anyhow!(
                    "Failed to create capture session output container (reason: {:?})",
                    camera_status
                ));
            }

            unsafe extern "C" fn capture_session_on_ready(
                _context: *mut c_void,
                session: *mut ACameraCaptureSession,
            ) {
                debug!("Session is ready. {:?}", session);
            }

            unsafe extern "C" fn capture_session_on_active(
                _context: *mut c_void,
                session: *mut ACameraCaptureSession,
            ) {
                debug!("Session is activated. {:?}", session);
            }

            unsafe extern "C" fn capture_session_on_closed(
                _context: *mut c_void,
                session: *mut ACameraCaptureSession,
            ) {
                debug!("Session is closed. {:?}", session);
            }

            self.capture_session_state_callbacks.onReady = Some(capture_session_on_ready);
            self.capture_session_state_callbacks.onActive = Some(capture_session_on_active);
            self.capture_session_state_callbacks.onClosed = Some(capture_session_on_closed);
            self.capture_session_state_callbacks.context = null_mut();

            ACaptureSessionOutputContainer_add(
                self.capture_session_output_container,
                self.session_output,
            );

            let camera_status = ACameraDevice_createCaptureSession(
                self.camera_device,
                self.capture_session_output_container,
                &self.capture_session_state_callbacks,
                &mut self.capture_session,
            );
            if camera_status != camera_status_t::ACAMERA_OK {
                return Err(anyhow!(
                    "Failed to create capture session (reason: {:?})",
                    camera_status
                ));
            }
        }
        self.repeat_request()
    }

    fn repeat_request(&mut self) -> Result<()> {
        let camera_status = unsafe {
            ACameraCaptureSession_setRepeatingRequest(
                self.capture_session,
                null_mut(),
                1,
                &mut self.capture_request,
                null_mut(),
            )
        };
        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!(
                "Failed to set repeating request (reason: {:?})",
                camera_status
            ));
        }
        Ok(())
    }

    pub fn set_torch(&mut self, on: bool) -> Result<()> {
        if self.capture_request.is_null() || self.capture_session.is_null() {
            return Err(anyhow!("camera {} is not streaming", self.info.id));
        }
        let mode = if on { FLASH_MODE_TORCH } else { FLASH_MODE_OFF };
        let camera_status = unsafe {
            ACaptureRequest_setEntry_u8(
                self.capture_request,
                acamera_metadata_tag::ACAMERA_FLASH_MODE.0,
                1,
                &mode,
            )
        };
        if camera_status != camera_status_t::ACAMERA_OK {
            return Err(anyhow!("Failed to set flash mode (reason: {:?})", camera_status));
        }
        self.repeat_request()?;
        info!("torch {}", if on { "on" } else { "off" });
        Ok(())
    }

    /// Stop streaming and release every NDK object. Safe to call twice.
    pub fn close(&mut self) {
        unsafe {
            if !self.capture_session.is_null() {
                ACameraCaptureSession_stopRepeating(self.capture_session);
            }

            // Waits for a callback still converting a frame; later callbacks
            // find no reader and return.
            let image_reader = std::mem::replace(&mut lock(&self.frames).image_reader, null_mut());
            if !image_reader.is_null() {
                AImageReader_setImageListener(image_reader, null_mut());
            }

            if !self.capture_session.is_null() {
                ACameraCaptureSession_close(self.capture_session);
                self.capture_session = null_mut();
            }

            if !self.camera_device.is_null() {
                let camera_status = ACameraDevice_close(self.camera_device);
                if camera_status != camera_status_t::ACAMERA_OK {
                    error!("Failed to close CameraDevice.");
                }
                self.camera_device = null_mut();
            }

            if !self.capture_request.is_null() {
                ACaptureRequest_free(self.capture_request);
                self.capture_request = null_mut();
            }

            if !self.camera_output_target.is_null() {
                ACameraOutputTarget_free(self.camera_output_target);
                self.camera_output_target = null_mut();
            }

            if !self.session_output.is_null() {
                ACaptureSessionOutput_free(self.session_output);
                self.session_output = null_mut();
            }

            if !self.capture_session_output_container.is_null() {
                ACaptureSessionOutputContainer_free(self.capture_session_output_container);
                self.capture_session_output_container = null_mut();
            }

            if !image_reader.is_null() {
                AImageReader_delete(image_reader);
            }
        }
        info!("Close Camera {}", self.info.id);
    }

    fn create_image_reader(
        &mut self,
        width: u32,
        height: u32,
        image_format: AIMAGE_FORMATS,
    ) -> Result<*mut AImageReader> {
        unsafe {
            let mut image_reader = null_mut();
            let res = AImageReader_new(
                width as i32,
                height as i32,
                image_format.0 as i32,
                2,
                &mut image_reader,
            );
            if res != media_status_t::AMEDIA_OK {
                return Err(anyhow!("create Image Reader error."));
            }
            lock(&self.frames).image_reader = image_reader;

            unsafe extern "C" fn on_image_available(
                context: *mut c_void,
                _image_reader: *mut AImageReader,
            ) {
                let frames = &*(context as *const Mutex<FrameContext>);
                if let Err(err) = lock(frames).on_image_available() {
                    debug!("frame dropped: {err}");
                }
            }

            self.image_listener.context = Arc::as_ptr(&self.frames) as *mut c_void;
            self.image_listener.onImageAvailable = Some(on_image_available);

            let res = AImageReader_setImageListener(image_reader, &mut self.image_listener);
            if res != media_status_t::AMEDIA_OK {
                return Err(anyhow!("set Image Listener error."));
            }
            Ok(image_reader)
        }
    }
}

impl Drop for AndroidCamera {
    fn drop(&mut self) {
        self.close();
    }
}

impl FrameContext {
    fn on_image_available(&mut self) -> Result<()> {
        if self.image_reader.is_null() {
            return Ok(());
        }
        unsafe {
            let mut image = null_mut();
            let media_status = AImageReader_acquireLatestImage(self.image_reader, &mut image);
            if media_status != media_status_t::AMEDIA_OK {
                let msg = if media_status == media_status_t::AMEDIA_IMGREADER_NO_BUFFER_AVAILABLE {
                    "An image reader frame was discarded".to_string()
                } else {
                    format!(
                        "Failed to acquire latest image from image reader, error: {:?}.",
                        media_status
                    )
                };
                return Err(anyhow!("{msg}"));
            }
            let result = self.convert_image(image);
            AImage_delete(image);
            result
        }
    }

    unsafe fn convert_image(&mut self, image: *mut ndk_sys::AImage) -> Result<()> {
        let mut format = 0;
        let res = AImageReader_getFormat(self.image_reader, &mut format);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("AImageReader_getFormat error res={:?}.", res));
        }
        if format != AIMAGE_FORMATS::AIMAGE_FORMAT_YUV_420_888.0 as i32 {
            return Err(anyhow!("format is not AIMAGE_FORMAT_YUV_420_888"));
        }

        let (mut width, mut height) = (0, 0);
        let res = AImageReader_getWidth(self.image_reader, &mut width);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("AImageReader_getWidth error res={:?}.", res));
        }
        let res = AImageReader_getHeight(self.image_reader, &mut height);
        if res != media_status_t::AMEDIA_OK {
            return Err(anyhow!("AImageReader_getHeight error res={:?}.", res));
        }

        // The Y plane pointer starts a contiguous NV21 block: Y followed by
        // interleaved V/U, the U plane pointer being one byte past V.
        let mut y_pixel = null_mut();
        let mut y_len = 0;
        AImage_getPlaneData(image, 0, &mut y_pixel, &mut y_len);
        if y_pixel.is_null() {
            return Err(anyhow!("image has no Y plane"));
        }
        let yuv_data =
            slice::from_raw_parts(y_pixel, ((width * height) + (width * height) / 2) as usize);

        let mut timestamp_ns = 0;
        let _ = AImage_getTimestamp(image, &mut timestamp_ns);

        let (degrees, mirror) = (self.sensor_orientation, self.mirror);
        let t = Instant::now();
        let (rgba, out_width, out_height) = match self.decoder_gpu.as_mut() {
            Some(decoder) => {
                decoder.decode(yuv_data, &mut self.rgba_buffer, degrees, mirror)?;
                let size = decoder.output_size(degrees);
                (self.rgba_buffer.as_slice(), size.width, size.height)
            }
            None => {
                let rgba = yuv::yuv420sp_to_rgba(yuv_data, width as u32, height as u32)?;
                let (rgba, w, h) =
                    yuv::orient_rgba(rgba, width as u32, height as u32, degrees, mirror)?;
                self.rgba_buffer = rgba;
                (self.rgba_buffer.as_slice(), w, h)
            }
        };

        let pixels = SharedPixelBuffer::clone_from_slice(rgba, out_width, out_height);
        self.sink.deliver(Frame::new(pixels, timestamp_ns))?;
        debug!("convert+orient+send took {}ms", t.elapsed().as_millis());

        self.frame_count += 1;
        if self.timer.elapsed().as_millis() > 1000 {
            debug!("preview FPS:{}", self.frame_count);
            self.timer = Instant::now();
            self.frame_count = 0;
        }
        Ok(())
    }
}

unsafe fn get_cstr<'a>(s: *const ::std::os::raw::c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}
