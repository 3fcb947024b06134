//! Operation handler bridging a transport shell to the adapter.
//!
//! The shell parses the action name into a [`DynamoDBOperation`] and hands
//! over the raw JSON body; the handler returns the JSON response body. HTTP
//! framing stays in the shell.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tracing::Instrument;

use dynamo_adapter_model::error::DynamoDBError;
use dynamo_adapter_model::operations::DynamoDBOperation;

use crate::provider::DynamoAdapter;

/// Boundary between a transport shell and the adapter.
pub trait OperationHandler: Send + Sync + 'static {
    /// Handle one operation, returning the JSON response body.
    fn handle_operation(
        &self,
        op: DynamoDBOperation,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, DynamoDBError>> + Send + '_>>;
}

/// Handler that dispatches operations to a [`DynamoAdapter`].
#[derive(Debug, Clone)]
pub struct DynamoAdapterHandler {
    provider: Arc<DynamoAdapter>,
}

impl DynamoAdapterHandler {
    /// Create a new handler wrapping a provider.
    #[must_use]
    pub fn new(provider: Arc<DynamoAdapter>) -> Self {
        Self { provider }
    }

    /// Handle an action given by name, e.g. `DynamoDB_20120810.Query`.
    pub async fn handle_action(&self, action: &str, body: Bytes) -> Result<Bytes, DynamoDBError> {
        let op = DynamoDBOperation::from_name(action)
            .ok_or_else(|| DynamoDBError::unknown_operation(action))?;
        self.handle_operation(op, body).await
    }
}

impl OperationHandler for DynamoAdapterHandler {
    fn handle_operation(
        &self,
        op: DynamoDBOperation,
        body: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, DynamoDBError>> + Send + '_>> {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("dynamodb_request", %request_id, operation = %op);
        let provider = Arc::clone(&self.provider);
        Box::pin(
            async move {
                let result = dispatch(&provider, op, &body).await;
                if let Err(e) = &result {
                    tracing::debug!(code = %e.code, message = %e.message, "operation failed");
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Dispatch an operation to the matching provider method.
async fn dispatch(
    provider: &DynamoAdapter,
    op: DynamoDBOperation,
    body: &[u8],
) -> Result<Bytes, DynamoDBError> {
    match op {
        DynamoDBOperation::GetItem => {
            serialize(&provider.handle_get_item(deserialize(body)?).await?)
        }
        DynamoDBOperation::PutItem => {
            serialize(&provider.handle_put_item(deserialize(body)?).await?)
        }
        DynamoDBOperation::UpdateItem => {
            serialize(&provider.handle_update_item(deserialize(body)?).await?)
        }
        DynamoDBOperation::DeleteItem => {
            serialize(&provider.handle_delete_item(deserialize(body)?).await?)
        }
        DynamoDBOperation::Query => serialize(&provider.handle_query(deserialize(body)?).await?),
        DynamoDBOperation::Scan => serialize(&provider.handle_scan(deserialize(body)?).await?),
        DynamoDBOperation::BatchGetItem => {
            serialize(&provider.handle_batch_get_item(deserialize(body)?).await?)
        }
        DynamoDBOperation::BatchWriteItem => {
            serialize(&provider.handle_batch_write_item(deserialize(body)?).await?)
        }
        DynamoDBOperation::TransactWriteItems => {
            serialize(&provider.handle_transact_write_items(deserialize(body)?).await?)
        }
    }
}

/// Deserialize a JSON request body into the input type.
fn deserialize<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, DynamoDBError> {
    serde_json::from_slice(body).map_err(|e| {
        DynamoDBError::serialization_exception(format!("Failed to deserialize request body: {e}"))
    })
}

/// Serialize an output type into a JSON body.
fn serialize<T: serde::Serialize>(output: &T) -> Result<Bytes, DynamoDBError> {
    serde_json::to_vec(output)
        .map(Bytes::from)
        .map_err(|e| DynamoDBError::internal_error(format!("Failed to serialize response: {e}")))
}

#[cfg(test)]
mod tests {
    use dynamo_adapter_model::error::DynamoDBErrorCode;
    use dynamo_adapter_model::types::ScalarAttributeType;
    use serde_json::{Value, json};

    use super::*;
    use crate::catalog::{KeyAttribute, KeySchema, MemoryCatalog, TableSchema};
    use crate::config::AdapterConfig;
    use crate::store::MemoryStore;

    fn handler() -> DynamoAdapterHandler {
        let catalog = MemoryCatalog::new();
        catalog
            .register(TableSchema::new(
                "employees",
                KeySchema::new(KeyAttribute::new("emp_id", ScalarAttributeType::N), None),
            ))
            .expect("register");
        let store = MemoryStore::for_catalog(&catalog);
        DynamoAdapterHandler::new(Arc::new(DynamoAdapter::new(
            Arc::new(catalog),
            Arc::new(store),
            AdapterConfig::default(),
        )))
    }

    async fn call(handler: &DynamoAdapterHandler, action: &str, body: Value) -> Value {
        let bytes = handler
            .handle_action(action, Bytes::from(body.to_string()))
            .await
            .expect("operation succeeds");
        serde_json::from_slice(&bytes).expect("json response")
    }

    #[tokio::test]
    async fn test_should_dispatch_json_operations() {
        let handler = handler();
        for id in ["1", "2", "3"] {
            let out = call(
                &handler,
                "DynamoDB_20120810.PutItem",
                json!({
                    "TableName": "employees",
                    "Item": {"emp_id": {"N": id}, "name": {"S": format!("e{id}")}}
                }),
            )
            .await;
            assert_eq!(out, json!({}));
        }

        let out = call(
            &handler,
            "GetItem",
            json!({"TableName": "employees", "Key": {"emp_id": {"N": "2"}}}),
        )
        .await;
        assert_eq!(out["Item"]["name"], json!({"S": "e2"}));

        let out = call(
            &handler,
            "GetItem",
            json!({"TableName": "employees", "Key": {"emp_id": {"N": "9"}}}),
        )
        .await;
        assert_eq!(out, json!({}));

        let out = call(
            &handler,
            "Scan",
            json!({"TableName": "employees", "Limit": 2, "Select": "COUNT"}),
        )
        .await;
        assert_eq!(out["Count"], 2);
        assert_eq!(out["ScannedCount"], 2);
        assert!(out.get("Items").is_none());
        assert_eq!(
            out["LastEvaluatedKey"],
            json!({"emp_id": {"N": "2"}, "offset": {"N": "2"}})
        );

        let out = call(
            &handler,
            "BatchGetItem",
            json!({"RequestItems": {"employees": {"Keys": [{"emp_id": {"N": "1"}}]}}}),
        )
        .await;
        assert_eq!(out["Responses"]["employees"].as_array().map(Vec::len), Some(1));
        assert_eq!(out["UnprocessedKeys"], json!({}));
    }

    #[tokio::test]
    async fn test_should_dispatch_transactions_and_render_cancellation() {
        let handler = handler();
        let put = |id: &str| {
            json!({"Put": {
                "TableName": "employees",
                "Item": {"emp_id": {"N": id}},
                "ConditionExpression": "attribute_not_exists(emp_id)"
            }})
        };
        let out = call(
            &handler,
            "DynamoDB_20120810.TransactWriteItems",
            json!({"TransactItems": [put("1"), put("2")]}),
        )
        .await;
        assert_eq!(out, json!({}));

        let err = handler
            .handle_action(
                "TransactWriteItems",
                Bytes::from(json!({"TransactItems": [put("3"), put("2")]}).to_string()),
            )
            .await
            .expect_err("second put collides");
        assert_eq!(err.code, DynamoDBErrorCode::TransactionCanceledException);
        let body = err.to_json_body();
        assert_eq!(
            body["CancellationReasons"],
            json!([
                {"Code": "None"},
                {"Code": "ConditionalCheckFailed", "Message": "The conditional request failed"}
            ])
        );

        let out = call(
            &handler,
            "GetItem",
            json!({"TableName": "employees", "Key": {"emp_id": {"N": "3"}}}),
        )
        .await;
        assert_eq!(out, json!({}));
    }

    #[tokio::test]
    async fn test_should_report_bad_bodies_and_unknown_actions() {
        let handler = handler();
        let err = handler
            .handle_operation(DynamoDBOperation::Query, Bytes::from_static(b"{not json"))
            .await
            .expect_err("malformed body");
        assert_eq!(err.code, DynamoDBErrorCode::SerializationException);
        assert!(err.message.starts_with("Failed to deserialize request body"));

        let err = handler
            .handle_action("CreateTable", Bytes::from_static(b"{}"))
            .await
            .expect_err("unsupported action");
        assert_eq!(err.code, DynamoDBErrorCode::UnrecognizedClientException);
    }
}
