pub mod launch_failure;
pub mod line_buffer;
