pub mod callback;
pub mod circuit;
mod error;
pub mod replies;
pub mod service_link;
pub mod service_link_config;

pub use error::LinkError;
