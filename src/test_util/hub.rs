use std::sync::Arc;

use crate::hub::hub_config::HubConfig;
use crate::hub::hub_context::HubContext;
use crate::test_util::node::test_node_addr_from_number;

/// A hub context without a listener or background tasks, identified by
///  `test_node_addr_from_number(number)`.
pub fn test_hub_context(number: u16) -> Arc<HubContext> {
    let addr = test_node_addr_from_number(number);
    let mut config = HubConfig::new(addr.socket_addr);
    config.name = format!("hub-{}", number);
    test_hub_context_with_config(number, config)
}

pub fn test_hub_context_with_config(number: u16, config: HubConfig) -> Arc<HubContext> {
    HubContext::new(config, test_node_addr_from_number(number))
}
