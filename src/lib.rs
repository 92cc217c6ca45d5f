pub mod app;
pub mod camera;
pub mod config;
pub mod overlay;
pub mod session;

#[cfg(target_os = "android")]
#[no_mangle]
fn android_main(app: slint::android::AndroidApp) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag("scanner_camera"),
    );
    slint::android::init(app.clone()).unwrap();
    if let Err(err) = app::run(app) {
        log::error!("scanner exited with error: {err:?}");
    }
}
