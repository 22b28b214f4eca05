pub mod backoff;
pub mod buf;
