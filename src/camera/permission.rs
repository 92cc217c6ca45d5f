//! Runtime camera permission.
//!
//! On android the check and the request go through the activity with JNI. The
//! request is fire-and-forget: the result is observed by checking again.
//! Desktop platforms have no runtime permission and always report granted.

use anyhow::Result;

use super::PlatformContext;

pub const CAMERA_PERMISSION: &str = "android.permission.CAMERA";

#[cfg(target_os = "android")]
const CAMERA_PERMISSION_REQUEST_CODE: i32 = 100;

pub fn has_camera_permission(#[allow(unused_variables)] context: &PlatformContext) -> Result<bool> {
    #[cfg(target_os = "android")]
    {
        android::check_self_permission(&context.app, CAMERA_PERMISSION)
    }
    #[cfg(not(target_os = "android"))]
    {
        Ok(true)
    }
}

/// Ask the user for the camera permission if it has not been granted yet.
pub fn request_camera_permission(
    #[allow(unused_variables)] context: &PlatformContext,
) -> Result<()> {
    #[cfg(target_os = "android")]
    {
        let sdk_version = android::sdk_version(&context.app)?;
        log::info!("sdk version:{sdk_version}");
        // runtime permissions exist from API 23 on
        if sdk_version >= 23 && !android::check_self_permission(&context.app, CAMERA_PERMISSION)? {
            android::request_permissions(
                &context.app,
                &[CAMERA_PERMISSION],
                CAMERA_PERMISSION_REQUEST_CODE,
            )?;
        }
    }
    Ok(())
}

#[cfg(target_os = "android")]
mod android {
    use anyhow::Result;
    use jni::{
        objects::{JObject, JValueGen},
        sys::{jint, JNIInvokeInterface_, _jobject},
        JavaVM,
    };
    use slint::android::AndroidApp;

    pub fn sdk_version(app: &AndroidApp) -> Result<i32> {
        unsafe {
            let vm = JavaVM::from_raw(app.vm_as_ptr() as *mut *const JNIInvokeInterface_)?;
            let mut env = vm.attach_current_thread()?;
            Ok(env
                .get_static_field("android/os/Build$VERSION", "SDK_INT", "I")?
                .i()?)
        }
    }

    pub fn check_self_permission(app: &AndroidApp, permission: &str) -> Result<bool> {
        unsafe {
            let vm = JavaVM::from_raw(app.vm_as_ptr() as *mut *const JNIInvokeInterface_)?;
            let mut env = vm.attach_current_thread()?;
            let granted = env
                .get_static_field(
                    "android/content/pm/PackageManager",
                    "PERMISSION_GRANTED",
                    "I",
                )?
                .i()?;
            let permission = env.new_string(permission)?;
            let activity = JObject::from_raw(app.activity_as_ptr() as *mut _jobject);
            let result = env
                .call_method(
                    activity,
                    "checkSelfPermission",
                    "(Ljava/lang/String;)I",
                    &[JValueGen::Object(&JObject::from(permission))],
                )?
                .i()?;
            Ok(result == granted)
        }
    }

    pub fn request_permissions(
        app: &AndroidApp,
        permissions: &[&str],
        request_code: i32,
    ) -> Result<()> {
        unsafe {
            let vm = JavaVM::from_raw(app.vm_as_ptr() as *mut *const JNIInvokeInterface_)?;
            let mut env = vm.attach_current_thread()?;
            let activity = JObject::from_raw(app.activity_as_ptr() as *mut _jobject);

            let array = env.new_object_array(
                permissions.len() as jint,
                "java/lang/String",
                JObject::null(),
            )?;
            for (index, permission) in permissions.iter().enumerate() {
                let permission = env.new_string(*permission)?;
                env.set_object_array_element(&array, index as jint, permission)?;
            }

            env.call_method(
                activity,
                "requestPermissions",
                "([Ljava/lang/String;I)V",
                &[
                    JValueGen::Object(&JObject::from(array)),
                    request_code.into(),
                ],
            )?;
        }
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "android")))]
mod tests {
    use super::*;

    #[test]
    fn desktop_is_always_granted() {
        let context = PlatformContext::new();
        assert!(has_camera_permission(&context).unwrap());
        assert!(request_camera_permission(&context).is_ok());
    }
}
