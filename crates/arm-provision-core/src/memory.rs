use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::arm::{ArmError, ArmResult, ManagementApi};
use crate::resources::ResourceId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Get(String),
    Put(String),
    Post { resource: String, action: String },
    Delete(String),
}

/// Management API backed by a map, recording every call it receives.
#[derive(Debug, Default)]
pub struct InMemoryManagementApi {
    resources: Mutex<BTreeMap<ResourceId, Value>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl InMemoryManagementApi {
    pub fn with_resource(self, id: ResourceId, body: Value) -> Self {
        self.insert(id, body);
        self
    }

    pub fn insert(&self, id: ResourceId, mut body: Value) {
        if let Value::Object(map) = &mut body {
            map.entry("id")
                .or_insert_with(|| Value::String(id.to_string()));
        }
        if let Ok(mut resources) = self.resources.lock() {
            resources.insert(id, body);
        }
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources
            .lock()
            .map(|resources| resources.contains_key(id))
            .unwrap_or(false)
    }

    pub fn resource(&self, id: &ResourceId) -> Option<Value> {
        self.resources
            .lock()
            .ok()
            .and_then(|resources| resources.get(id).cloned())
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: ApiCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn not_found(id: &ResourceId) -> ArmError {
        ArmError::NotFound {
            resource: id.to_string(),
            message: "The Resource was not found.".to_string(),
        }
    }
}

#[async_trait]
impl ManagementApi for InMemoryManagementApi {
    async fn get(&self, id: &ResourceId, _api_version: &str) -> ArmResult<Value> {
        self.record(ApiCall::Get(id.to_string()));
        self.resource(id).ok_or_else(|| Self::not_found(id))
    }

    async fn create_or_update(
        &self,
        id: &ResourceId,
        _api_version: &str,
        body: &Value,
    ) -> ArmResult<Value> {
        self.record(ApiCall::Put(id.to_string()));
        self.insert(id.clone(), body.clone());
        self.resource(id).ok_or_else(|| Self::not_found(id))
    }

    async fn post_action(&self, id: &ResourceId, action: &str, _api_version: &str) -> ArmResult<()> {
        self.record(ApiCall::Post {
            resource: id.to_string(),
            action: action.to_string(),
        });
        if self.contains(id) {
            Ok(())
        } else {
            Err(Self::not_found(id))
        }
    }

    async fn delete(&self, id: &ResourceId, _api_version: &str) -> ArmResult<()> {
        self.record(ApiCall::Delete(id.to_string()));
        if let Ok(mut resources) = self.resources.lock() {
            resources.remove(id);
        }
        Ok(())
    }
}
