use crate::models::InvocationRequest;
use std::io::ErrorKind;

/// Exit code recorded when the child could not be started at all.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = -1;

pub fn describe_launch_failure(error: &std::io::Error, request: &InvocationRequest) -> String {
    let mut message = format!("Failed to launch: {}", error);
    if error.kind() == ErrorKind::NotFound {
        match request.working_directory.as_ref() {
            Some(cwd) if !cwd.exists() => {
                message.push_str(&format!(" (working directory not found: {})", cwd.display()));
            }
            _ => {
                message.push_str(&format!(
                    " (executable not found: {})",
                    request.executable_path.display()
                ));
            }
        }
    } else if error.kind() == ErrorKind::PermissionDenied {
        message.push_str(&format!(
            " (not executable: {})",
            request.executable_path.display()
        ));
    }
    message
}
