#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenRecordingStatus {
    Granted,
    Denied,
    NotSupported,
}

impl ScreenRecordingStatus {
    pub fn is_granted(&self) -> bool {
        matches!(
            self,
            ScreenRecordingStatus::Granted | ScreenRecordingStatus::NotSupported
        )
    }
}

pub fn screen_recording_status() -> ScreenRecordingStatus {
    #[cfg(target_os = "macos")]
    unsafe {
        if CGPreflightScreenCaptureAccess() {
            ScreenRecordingStatus::Granted
        } else {
            ScreenRecordingStatus::Denied
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        ScreenRecordingStatus::NotSupported
    }
}

pub fn screen_recording_help_message() -> &'static str {
    "Grant Screen Recording permission: System Settings -> Privacy & Security -> Screen Recording. Toggle the terminal or watcher daemon on, then restart the daemon."
}

#[cfg(target_os = "macos")]
#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    fn CGPreflightScreenCaptureAccess() -> bool;
}
