//! Typed access to the requisitions collection.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::Url;
use serde_json::json;
use tracing::debug;

use crate::cache::RecordSource;
use crate::models::{RecordId, Requisition, RequisitionStatus};

use super::ApiClient;

/// Requisitions endpoints, rooted at a collection path such as
/// `/api/requisitions/`.
#[derive(Clone)]
pub struct RequisitionsApi {
    client: ApiClient,
    collection_path: String,
}

impl RequisitionsApi {
    pub fn new(client: ApiClient, collection_path: &str) -> Self {
        let mut collection_path = collection_path.to_string();
        if !collection_path.ends_with('/') {
            collection_path.push('/');
        }
        Self {
            client,
            collection_path,
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn collection_path(&self) -> &str {
        &self.collection_path
    }

    pub fn item_path(&self, id: &RecordId) -> String {
        format!("{}{}/", self.collection_path, id)
    }

    /// Fetch the whole collection
    pub async fn list(&self) -> Result<Vec<Requisition>> {
        let requisitions: Vec<Requisition> = self
            .client
            .get_json(&self.collection_path)
            .await
            .context("Failed to fetch requisitions")?;
        debug!(count = requisitions.len(), "Fetched requisitions");
        Ok(requisitions)
    }

    /// Collection path filtered by one query parameter, value form-encoded.
    pub fn filtered_path(&self, key: &str, value: &str) -> String {
        let mut url = match Url::parse("http://localhost/") {
            Ok(url) => url,
            Err(_) => return self.collection_path.clone(),
        };
        url.query_pairs_mut().append_pair(key, value);
        match url.query() {
            Some(query) => format!("{}?{}", self.collection_path, query),
            None => self.collection_path.clone(),
        }
    }

    /// Fetch requisitions of one type ("material" or "hr")
    pub async fn list_by_type(&self, requisition_type: &str) -> Result<Vec<Requisition>> {
        let path = self.filtered_path("requisition_type", requisition_type);
        self.client
            .get_json(&path)
            .await
            .with_context(|| format!("Failed to fetch {} requisitions", requisition_type))
    }

    pub async fn get(&self, id: &RecordId) -> Result<Requisition> {
        self.client
            .get_json(&self.item_path(id))
            .await
            .with_context(|| format!("Failed to fetch requisition {}", id))
    }

    /// Change a requisition's status. Returns the full record from the
    /// response body, suitable for an optimistic merge.
    pub async fn update_status(&self, id: &RecordId, status: &RequisitionStatus) -> Result<Requisition> {
        self.client
            .patch_json(&self.item_path(id), &json!({ "status": status.as_str() }))
            .await
            .with_context(|| format!("Failed to update status of requisition {}", id))
    }

    /// Replace a requisition wholesale
    pub async fn replace(&self, requisition: &Requisition) -> Result<Requisition> {
        let id = requisition
            .id
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Cannot replace a requisition without an id"))?;
        self.client
            .put_json(&self.item_path(id), requisition)
            .await
            .with_context(|| format!("Failed to replace requisition {}", id))
    }

    pub async fn delete(&self, id: &RecordId) -> Result<()> {
        self.client
            .delete(&self.item_path(id))
            .await
            .with_context(|| format!("Failed to delete requisition {}", id))
    }
}

impl RecordSource<Requisition> for RequisitionsApi {
    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Requisition>>> {
        Box::pin(self.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiRequest, ApiResponse, Transport};
    use reqwest::{Method, StatusCode};
    use std::sync::{Arc, Mutex};

    struct EchoTransport {
        seen: Mutex<Vec<ApiRequest>>,
    }

    impl Transport for EchoTransport {
        fn send<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, Result<ApiResponse>> {
            self.seen.lock().unwrap().push(request.clone());
            let body = match (&request.method, request.route()) {
                (&Method::GET, "/api/requisitions/") => {
                    r#"[{"id": 1, "status": "to_accept", "updated_at": "t1"}]"#.to_string()
                }
                (&Method::GET, "/api/requisitions/1/") => {
                    r#"{"id": 1, "status": "to_accept", "updated_at": "t1", "number": "ZAP/2024/001"}"#
                        .to_string()
                }
                (&Method::PATCH, "/api/requisitions/1/") | (&Method::PUT, "/api/requisitions/1/") => {
                    r#"{"id": 1, "status": "accepted", "updated_at": "t2"}"#.to_string()
                }
                _ => String::new(),
            };
            let status = if body.is_empty() {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::OK
            };
            Box::pin(async move { Ok(ApiResponse::new(status, body)) })
        }
    }

    fn api() -> (RequisitionsApi, Arc<EchoTransport>) {
        let transport = Arc::new(EchoTransport {
            seen: Mutex::new(Vec::new()),
        });
        let client = ApiClient::with_transport(transport.clone());
        (RequisitionsApi::new(client, "/api/requisitions"), transport)
    }

    #[test]
    fn test_paths() {
        let (api, _) = api();
        assert_eq!(api.collection_path(), "/api/requisitions/");
        assert_eq!(api.item_path(&RecordId::Int(7)), "/api/requisitions/7/");
    }

    #[tokio::test]
    async fn test_list_and_fetch_all() {
        let (api, _) = api();
        let listed = api.list().await.unwrap();
        assert_eq!(listed.len(), 1);

        let fetched = api.fetch_all().await.unwrap();
        assert_eq!(fetched, listed);
    }

    #[tokio::test]
    async fn test_update_status_sends_patch_body() {
        let (api, transport) = api();
        let updated = api
            .update_status(&RecordId::Int(1), &RequisitionStatus::Accepted)
            .await
            .unwrap();
        assert_eq!(updated.status, Some(RequisitionStatus::Accepted));

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].method, Method::PATCH);
        assert_eq!(seen[0].body, Some(json!({"status": "accepted"})));
    }

    #[tokio::test]
    async fn test_list_by_type_encodes_query() {
        let (api, transport) = api();
        assert_eq!(
            api.filtered_path("requisition_type", "material"),
            "/api/requisitions/?requisition_type=material"
        );

        let listed = api.list_by_type("hr & material").await.unwrap();
        assert_eq!(listed.len(), 1);
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].path, "/api/requisitions/?requisition_type=hr+%26+material");
        assert_eq!(seen[0].route(), "/api/requisitions/");
    }

    #[tokio::test]
    async fn test_get_single_requisition() {
        let (api, transport) = api();
        let record = api.get(&RecordId::Int(1)).await.unwrap();
        assert_eq!(record.number(), Some("ZAP/2024/001"));
        assert_eq!(transport.seen.lock().unwrap()[0].method, Method::GET);

        let missing = api.get(&RecordId::Int(9)).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_replace_requires_id_and_sends_put() {
        let (api, transport) = api();
        let mut record = Requisition::new(1_i64, "accepted", "t1");
        record.extra.insert("comment".to_string(), json!("pilne"));
        let replaced = api.replace(&record).await.unwrap();
        assert_eq!(replaced.updated_at.as_deref(), Some("t2"));
        {
            let seen = transport.seen.lock().unwrap();
            assert_eq!(seen[0].method, Method::PUT);
            assert_eq!(seen[0].body.as_ref().unwrap()["comment"], "pilne");
        }

        record.id = None;
        assert!(api.replace(&record).await.is_err());
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_accepts_no_content() {
        let (api, transport) = api();
        api.delete(&RecordId::Int(4)).await.unwrap();
        assert_eq!(transport.seen.lock().unwrap()[0].path, "/api/requisitions/4/");
    }
}
