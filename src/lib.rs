pub mod connection;
pub mod hub;
pub mod node_addr;
pub mod protocol;
pub mod service_link;
pub mod test_util;
pub mod util;
pub mod virtual_conn;
