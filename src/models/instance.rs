//! Target record operations act on.
//!
//! The engine never interprets this payload; it loads it by id and hands it to
//! every step and to the failure handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Service instance backed by a managed Kubernetes runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    /// Runtime (cluster) id assigned by the provisioner, once known
    pub runtime_id: Option<String>,
    pub global_account_id: String,
    pub subaccount_id: String,
    pub plan_id: String,
    pub region: Option<String>,
    pub kubeconfig: Option<String>,
    /// Provisioning parameters as received from the service broker request
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        instance_id: impl Into<String>,
        global_account_id: impl Into<String>,
        subaccount_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            runtime_id: None,
            global_account_id: global_account_id.into(),
            subaccount_id: subaccount_id.into(),
            plan_id: plan_id.into(),
            region: None,
            kubeconfig: None,
            parameters: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }
}
