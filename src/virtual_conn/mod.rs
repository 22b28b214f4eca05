pub mod id_allocator;
pub mod virtual_connection;
pub mod virtual_connection_registry;
