use std::{cell::RefCell, rc::Rc, sync::mpsc::channel};

use anyhow::Result;
use log::info;
use slint::{Image, PhysicalSize, Timer, TimerMode};

use crate::camera::{CameraSelector, PlatformContext, Resolution};
use crate::config::ScannerConfig;
use crate::overlay::ScannerOverlay;
use crate::session::CameraSession;

slint::slint! {
    import { Button, HorizontalBox } from "std-widgets.slint";
    export component MainWindow inherits Window {
        in property <image> camera-frame <=> camera-frame.source;
        in property <image> overlay <=> overlay.source;
        in property <bool> front-camera;
        in property <bool> torch-on;
        callback switch-camera();
        callback toggle-torch(bool);

        background: black;

        camera-frame := Image {
            width: 100%;
            height: 100%;
            image-fit: cover;
        }

        overlay := Image {
            width: 100%;
            height: 100%;
            image-fit: fill;
        }

        Text {
            y: parent.height - 120px;
            width: 100%;
            horizontal-alignment: center;
            color: white;
            text: "Align the code inside the frame";
        }

        HorizontalBox {
            y: parent.height - self.height - 24px;
            height: 48px;
            alignment: center;
            Button {
                text: root.front-camera ? "Back camera" : "Front camera";
                clicked => {
                    root.switch-camera();
                }
            }
            Button {
                text: root.torch-on ? "Torch off" : "Torch on";
                clicked => {
                    root.toggle-torch(!root.torch-on);
                }
            }
        }
    }
}

/// Window geometry the overlay was last painted for.
struct RenderedViewport {
    size: PhysicalSize,
    scale: f32,
}

impl RenderedViewport {
    fn new() -> Self {
        Self {
            size: PhysicalSize::new(0, 0),
            scale: 0.0,
        }
    }

    fn is_laid_out(&self) -> bool {
        self.size.width > 0 && self.size.height > 0
    }

    /// Returns `true` when `size` or `scale` differ from the last painted
    /// geometry and the overlay has to be painted again.
    fn update(&mut self, size: PhysicalSize, scale: f32) -> bool {
        if size.width == 0 || size.height == 0 {
            return false;
        }
        if size == self.size && scale == self.scale {
            return false;
        }
        self.size = size;
        self.scale = scale;
        true
    }
}

pub fn run(#[cfg(target_os = "android")] android_app: slint::android::AndroidApp) -> Result<()> {
    let config = ScannerConfig::default();
    let app = MainWindow::new()?;

    let (frame_sender, frame_receiver) = channel();
    let context = PlatformContext::new(
        #[cfg(target_os = "android")]
        android_app,
    );
    let session = Rc::new(RefCell::new(CameraSession::new(
        context,
        config.clone(),
        frame_sender,
    )));
    let overlay = ScannerOverlay::from(&config.overlay);

    let app_weak = app.as_weak();
    let session_clone = session.clone();
    let mut rendered = RenderedViewport::new();
    let timer = Timer::default();
    timer.start(TimerMode::Repeated, config.ui_poll_interval, move || {
        let Some(app) = app_weak.upgrade() else {
            return;
        };
        let mut session = session_clone.borrow_mut();

        let size = app.window().size();
        let scale = app.window().scale_factor();
        let first_layout = !rendered.is_laid_out();
        if rendered.update(size, scale) {
            if first_layout {
                session.start(Resolution::new(size.width, size.height));
            }
            if let Some(image) = overlay.render(size.width, size.height, scale) {
                app.set_overlay(image.to_slint_image());
            }
        }

        session.poll();

        // only the newest frame is worth showing
        if let Some(buffer) = frame_receiver.try_iter().last() {
            app.set_camera_frame(Image::from_rgba8(buffer));
        }
    });

    let app_weak = app.as_weak();
    let session_clone = session.clone();
    app.on_switch_camera(move || {
        let mut session = session_clone.borrow_mut();
        session.switch_camera();
        if let Some(app) = app_weak.upgrade() {
            app.set_front_camera(session.camera_selector() == CameraSelector::Front);
            app.set_torch_on(session.torch_enabled());
        }
    });

    let app_weak = app.as_weak();
    let session_clone = session.clone();
    app.on_toggle_torch(move |on| {
        let enabled = session_clone.borrow_mut().set_torch(on);
        if let Some(app) = app_weak.upgrade() {
            app.set_torch_on(enabled);
        }
    });

    let session_clone = session.clone();
    app.window().on_close_requested(move || {
        session_clone.borrow_mut().shutdown();
        slint::CloseRequestResponse::HideWindow
    });

    app.run()?;
    session.borrow_mut().shutdown();
    info!("scanner closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_repaints_on_resize_and_scale_change() {
        let mut rendered = RenderedViewport::new();
        assert!(!rendered.update(PhysicalSize::new(0, 0), 1.0));
        assert!(!rendered.is_laid_out());

        assert!(rendered.update(PhysicalSize::new(1080, 2340), 2.75));
        assert!(rendered.is_laid_out());
        assert!(!rendered.update(PhysicalSize::new(1080, 2340), 2.75));

        // moved to a monitor with another scale factor
        assert!(rendered.update(PhysicalSize::new(1080, 2340), 2.0));
        assert!(rendered.update(PhysicalSize::new(2340, 1080), 2.0));
    }
}
