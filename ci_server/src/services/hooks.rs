//! Build hooks: sources of "these branches changed" notifications.
//!
//! A source turns an inbound request into a list of branch names. The
//! dispatcher treats every source the same way; push payloads and poll diffs
//! are interchangeable inputs.

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::HookError;
use crate::models::project::{parse_branch_list, Project};
use crate::services::vcs::Vcs;
use crate::store::BuildStore;

type HmacSha256 = Hmac<Sha256>;

/// Transport-neutral view of an inbound hook request.
#[derive(Debug, Clone, Default)]
pub struct HookRequest {
    headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HookRequest {
    pub fn new(
        headers: impl IntoIterator<Item = (String, String)>,
        query: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            query,
            body,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Everything a source may consult to work out the changed branches.
pub struct HookContext<'a> {
    pub project: &'a Project,
    pub request: &'a HookRequest,
    pub vcs: &'a dyn Vcs,
    pub store: &'a dyn BuildStore,
}

#[async_trait]
pub trait BuildHookSource: Send + Sync {
    async fn changed_branches(&self, ctx: &HookContext<'_>) -> Result<Vec<String>, HookError>;
}

/// GitHub push webhook: the branch comes from the payload's `ref`.
#[derive(Debug, Clone, Default)]
pub struct GitHubPushHook {
    secret: String,
}

impl GitHubPushHook {
    /// An empty secret disables signature validation.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl BuildHookSource for GitHubPushHook {
    async fn changed_branches(&self, ctx: &HookContext<'_>) -> Result<Vec<String>, HookError> {
        let request = ctx.request;
        let signature = request.header("x-hub-signature-256").unwrap_or("");
        if !validate_signature(&self.secret, &request.body, signature) {
            tracing::warn!(project = %ctx.project.slug, "Webhook signature validation failed");
            return Err(HookError::Unauthorized);
        }

        match request.header("x-github-event") {
            None | Some("push") => {}
            Some("ping") => {
                tracing::info!(project = %ctx.project.slug, "Received GitHub ping webhook");
                return Ok(Vec::new());
            }
            Some(other) => {
                tracing::debug!(event = other, "Ignoring webhook event");
                return Ok(Vec::new());
            }
        }

        Ok(push_branch(&request.body).into_iter().collect())
    }
}

/// Branch named by a push payload, if the payload names one.
pub fn push_branch(body: &[u8]) -> Option<String> {
    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!("Unparseable push payload: {e}");
            return None;
        }
    };
    let branch = payload["ref"].as_str()?.strip_prefix("refs/heads/")?;
    (!branch.is_empty()).then(|| branch.to_string())
}

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(sig_bytes) = hex::decode(sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Manual trigger: `?branches=main,feature/x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugHook;

#[async_trait]
impl BuildHookSource for DebugHook {
    async fn changed_branches(&self, ctx: &HookContext<'_>) -> Result<Vec<String>, HookError> {
        ctx.request
            .query
            .get("branches")
            .map(|b| parse_branch_list(b))
            .ok_or_else(|| HookError::Malformed("missing `branches` query parameter".to_string()))
    }
}

/// Poll: branches whose remote tip differs from the last recorded revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollHook;

#[async_trait]
impl BuildHookSource for PollHook {
    async fn changed_branches(&self, ctx: &HookContext<'_>) -> Result<Vec<String>, HookError> {
        let tips = ctx.vcs.remote_branches(&ctx.project.repo_uri).await?;
        let mut changed = Vec::new();
        for (branch, tip) in tips {
            let known = ctx
                .store
                .latest_commit_for_branch(ctx.project.id, &branch)
                .await?;
            if known.and_then(|c| c.vcs_id).as_deref() != Some(tip.as_str()) {
                changed.push(branch);
            }
        }
        tracing::debug!(project = %ctx.project.slug, ?changed, "Polled remote branches");
        Ok(changed)
    }
}
