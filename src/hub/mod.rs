pub mod connection_table;
pub mod gossip;
pub mod hub;
pub mod hub_config;
pub mod hub_context;
pub mod hub_description;
pub mod hub_info;
pub mod hub_registry;
pub mod state_counter;
