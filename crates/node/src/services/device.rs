use std::sync::Arc;

use protocol::{Capability, DeviceInfo, PROTOCOL_VERSION};

use super::ServiceContext;

/// Identity and capability exchange.
#[derive(Clone)]
pub struct DeviceService {
    context: Arc<ServiceContext>,
}

impl DeviceService {
    pub(super) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            identity: self.context.identity.clone(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: vec![
                Capability::new("path"),
                Capability::new("file"),
                Capability::new("bookmark"),
                Capability::on_port("http", self.context.http_port),
            ],
        }
    }
}
