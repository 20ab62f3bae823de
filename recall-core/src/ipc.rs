//! Wire types shared by the daemon and the CLI. Frames are MessagePack maps
//! behind a 4-byte little-endian length prefix.

use serde::{Deserialize, Serialize};

use crate::config::OrphanPolicy;
use crate::error::StoreError;

pub const PROTOCOL_VERSION: &str = "1.0";

fn default_n_results() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecallRequest {
    Ping,
    Health,
    Add {
        embedding: Vec<Vec<f32>>,
        metadata: serde_json::Value,
    },
    Search {
        embedding: Vec<Vec<f32>>,
        #[serde(default = "default_n_results")]
        n_results: usize,
    },
    Get {
        id: String,
    },
    Update {
        id: String,
        embedding: Vec<Vec<f32>>,
        metadata: serde_json::Value,
    },
    Delete {
        id: String,
    },
    Count,
    Backup {
        dir: Option<String>,
    },
    Restore {
        path: String,
    },
    ListBackups {
        dir: Option<String>,
    },
    Vacuum,
    Reconcile {
        policy: Option<OrphanPolicy>,
    },
    ClearCaches,
    Metrics,
    Hardware,
    HardwareHistory {
        /// Newest samples to return; all retained samples when omitted.
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecallResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Error code from `ErrorKind::code`, set on failures.
    #[serde(default)]
    pub code: Option<String>,
    pub version: String,
}

impl RecallResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            code: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            code: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn from_error(e: &StoreError) -> Self {
        Self {
            code: Some(e.code().to_string()),
            ..Self::err(e.to_string())
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_tagged_by_action() {
        let req: RecallRequest = serde_json::from_value(json!({
            "action": "search",
            "embedding": [[0.1, 0.2]],
        }))
        .expect("search request");
        match req {
            RecallRequest::Search {
                embedding,
                n_results,
            } => {
                assert_eq!(embedding, vec![vec![0.1, 0.2]]);
                assert_eq!(n_results, 5);
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let req: RecallRequest = serde_json::from_value(json!({
            "action": "reconcile",
            "policy": "backfill",
        }))
        .expect("reconcile request");
        assert!(matches!(
            req,
            RecallRequest::Reconcile {
                policy: Some(OrphanPolicy::Backfill)
            }
        ));

        let encoded = serde_json::to_value(RecallRequest::ListBackups { dir: None })
            .expect("encode");
        assert_eq!(encoded["action"], "list_backups");
    }

    #[test]
    fn test_error_response_carries_code() {
        let resp = RecallResponse::from_error(&StoreError::validation("n_results must be at least 1"));
        assert!(!resp.is_ok());
        assert_eq!(resp.code.as_deref(), Some("E3003"));
        assert!(resp
            .error
            .as_deref()
            .is_some_and(|m| m.contains("n_results")));
        assert!(RecallResponse::pong().is_ok());

        let busy = RecallResponse::from_error(&StoreError::Pool("all connections busy".into()));
        assert_eq!(busy.code.as_deref(), Some("E1004"));
    }
}
