pub mod client_message;
pub mod frame;
pub mod framing;
pub mod opcodes;
