//! Build hook endpoint: adapts HTTP requests to the dispatcher.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};

use crate::error::{DispatchError, HookError, RegistryError};
use crate::services::dispatch::{DispatchReport, Dispatcher};
use crate::services::hooks::HookRequest;

/// Handle one build hook request for `slug`.
pub async fn handle_build_hook(
    dispatcher: &Dispatcher,
    slug: &str,
    hook_type: &str,
    headers: &HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Result<DispatchReport, StatusCode> {
    let headers = headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    });
    let request = HookRequest::new(headers, query, body.to_vec());

    dispatcher
        .handle_hook(slug, hook_type, &request)
        .await
        .map_err(|e| {
            let status = dispatch_status(&e);
            if status.is_server_error() {
                tracing::error!(project = slug, hook = hook_type, "Build hook failed: {e}");
            } else {
                tracing::warn!(project = slug, hook = hook_type, "Build hook rejected: {e}");
            }
            status
        })
}

/// HTTP status for a failed hook invocation.
pub fn dispatch_status(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::Registry(RegistryError::UnknownHook(_)) => StatusCode::NOT_FOUND,
        DispatchError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        DispatchError::Hook(HookError::Unauthorized) => StatusCode::UNAUTHORIZED,
        DispatchError::Hook(HookError::Malformed(_)) => StatusCode::BAD_REQUEST,
        DispatchError::Hook(HookError::Vcs(_)) | DispatchError::Vcs(_) => StatusCode::BAD_GATEWAY,
        DispatchError::Hook(HookError::Store(_)) | DispatchError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        DispatchError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
