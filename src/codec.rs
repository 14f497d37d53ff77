//! Encoding of node payloads.

use std::collections::BTreeMap;

use crate::model::{HostStatus, ServiceInstance};
use crate::Result;

/// Opaque encode/decode capability for everything the registry writes to the store.
pub trait Codec: Send + Sync {
    fn encode_instance(&self, instance: &ServiceInstance) -> Result<Vec<u8>>;
    fn decode_instance(&self, data: &[u8]) -> Result<ServiceInstance>;
    fn encode_status(&self, status: &HostStatus) -> Result<Vec<u8>>;
    fn encode_config(&self, config: &BTreeMap<String, String>) -> Result<Vec<u8>>;
    fn decode_config(&self, data: &[u8]) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_instance(&self, instance: &ServiceInstance) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(instance)?)
    }

    fn decode_instance(&self, data: &[u8]) -> Result<ServiceInstance> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode_status(&self, status: &HostStatus) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(status)?)
    }

    fn encode_config(&self, config: &BTreeMap<String, String>) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(config)?)
    }

    fn decode_config(&self, data: &[u8]) -> Result<BTreeMap<String, String>> {
        Ok(serde_json::from_slice(data)?)
    }
}
