//! Collaborators the sync engine consumes but does not implement.
//!
//! Session issuance, permission evaluation and REST endpoint definitions live elsewhere in
//! the application; the engine only sees these traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use sonic_rs::Value;

use crate::core::{CacheKey, HealthSnapshot, RemoteError, SyncError, SyncResult, Version};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// Request/response side of the server.
pub trait RestClient: Send + Sync + 'static {
    fn request(&self, method: Method, path: &str, body: Option<Value>)
    -> BoxFuture<Result<Value, RemoteError>>;
}

/// Adapt a REST call into the `remote_call` closure taken by `SyncContext::mutate`.
pub fn remote_call(
    client: Arc<dyn RestClient>,
    method: Method,
    path: impl Into<String>,
    body: Option<Value>,
) -> impl FnOnce() -> BoxFuture<Result<Value, RemoteError>> + Send + 'static {
    let path = path.into();
    move || client.request(method, &path, body)
}

pub trait PermissionGate: Send + Sync + 'static {
    fn has_permission(&self, action: &str) -> bool;
}

/// Fail fast before a mutation the current session may not perform.
pub fn require_permission(gate: &dyn PermissionGate, action: &str) -> SyncResult<()> {
    if gate.has_permission(action) {
        Ok(())
    } else {
        Err(SyncError::PermissionDenied {
            action: action.to_string(),
        })
    }
}

/// Session credentials presented in the push channel's `auth` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinic_id: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: None,
            clinic_id: None,
        }
    }
}

pub trait CredentialsProvider: Send + Sync + 'static {
    /// `None` when there is no session; the channel then connects unauthenticated.
    fn credentials(&self) -> Option<Credentials>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulledEntity {
    pub key: CacheKey,
    pub value: Value,
    pub version: Version,
}

/// One pull-based refresh of the data the push channel would have delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullBatch {
    pub entities: Vec<PulledEntity>,
    pub deletions: Vec<(CacheKey, Version)>,
    pub health: Option<HealthSnapshot>,
}

impl PullBatch {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.deletions.is_empty() && self.health.is_none()
    }
}

pub trait PullSource: Send + Sync + 'static {
    fn pull(&self) -> BoxFuture<Result<PullBatch, RemoteError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::json;
    use std::sync::Mutex;

    struct RecordingClient {
        calls: Mutex<Vec<(Method, String)>>,
    }

    impl RestClient for RecordingClient {
        fn request(
            &self,
            method: Method,
            path: &str,
            body: Option<Value>,
        ) -> BoxFuture<Result<Value, RemoteError>> {
            self.calls
                .lock()
                .expect("lock")
                .push((method, path.to_string()));
            Box::pin(async move { Ok(body.unwrap_or_else(|| json!({}))) })
        }
    }

    struct Gate(&'static [&'static str]);

    impl PermissionGate for Gate {
        fn has_permission(&self, action: &str) -> bool {
            self.0.contains(&action)
        }
    }

    #[tokio::test]
    async fn remote_call_forwards_method_path_and_body() {
        let client = Arc::new(RecordingClient {
            calls: Mutex::new(Vec::new()),
        });
        let call = remote_call(
            client.clone(),
            Method::Patch,
            "/appointments/appt-42",
            Some(json!({"status": "CONFIRMED"})),
        );
        let response = call().await.expect("ok");
        assert_eq!(response, json!({"status": "CONFIRMED"}));
        assert_eq!(
            *client.calls.lock().expect("lock"),
            vec![(Method::Patch, "/appointments/appt-42".to_string())]
        );
    }

    #[test]
    fn require_permission_maps_denial() {
        let gate = Gate(&["appointment:update"]);
        assert!(require_permission(&gate, "appointment:update").is_ok());
        assert!(matches!(
            require_permission(&gate, "appointment:delete"),
            Err(SyncError::PermissionDenied { action }) if action == "appointment:delete"
        ));
    }

    #[test]
    fn credentials_serialize_camel_case_without_empty_fields() {
        let mut creds = Credentials::bearer("t0k");
        creds.clinic_id = Some("clinic-7".to_string());
        let text = sonic_rs::to_string(&creds).expect("encode");
        assert_eq!(text, r#"{"token":"t0k","clinicId":"clinic-7"}"#);
    }
}
