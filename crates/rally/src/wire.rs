//! Response envelopes of the Web Services API.
//!
//! Every response wraps its payload in a single named member
//! (`QueryResult`, `CreateResult`, `OperationResult`) carrying `Errors` and
//! `Warnings` lists alongside the data.

use serde::Deserialize;
use serde_json::Value;

use reconcile::Entity;

#[derive(Debug, Deserialize)]
pub(crate) struct QueryEnvelope {
    #[serde(rename = "QueryResult")]
    pub query_result: QueryResultBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct QueryResultBody {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub total_result_count: u64,
    #[serde(default)]
    pub results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateEnvelope {
    #[serde(rename = "CreateResult")]
    pub create_result: OperationBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OperationEnvelope {
    #[serde(rename = "OperationResult")]
    pub operation_result: OperationBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct OperationBody {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default)]
    pub security_token: Option<String>,
}

impl OperationBody {
    /// The returned object, if it is a JSON object.
    pub fn into_entity(self) -> (Option<Entity>, Vec<String>, Vec<String>) {
        (
            self.object.and_then(Entity::from_value),
            self.errors,
            self.warnings,
        )
    }
}
