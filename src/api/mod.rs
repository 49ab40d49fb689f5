//! Management API seam.
//!
//! Structured actions reach the virtualization platform through this trait
//! after classification and root protection have passed. The gateway ships
//! with the client disabled; deployments plug in a real one.

use std::fmt;
use std::str::FromStr;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "delete")]
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    pub fn is_read_only(self) -> bool {
        self == Self::Get
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported method '{other}'")),
        }
    }
}

/// Guest lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmOp {
    Start,
    Stop,
    Restart,
    Shutdown,
    Suspend,
    Resume,
}

impl VmOp {
    /// The platform calls a restart "reboot".
    pub fn api_op(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "reboot",
            Self::Shutdown => "shutdown",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
        }
    }
}

pub fn vm_status_path(node: &str, vmid: u32, op: VmOp) -> String {
    format!("/nodes/{node}/qemu/{vmid}/status/{}", op.api_op())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("management API client is disabled")]
    Disabled,
    #[error("management API request failed: {0}")]
    Request(String),
    #[error("management API returned {status}: {body}")]
    Status { status: u16, body: String },
}

pub trait ManagementApi: Send + Sync {
    fn call(
        &self,
        method: HttpMethod,
        path: &str,
        payload: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value, ApiError>>;
}

/// The default client: every call reports the channel as unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledApi;

impl ManagementApi for DisabledApi {
    fn call(
        &self,
        _method: HttpMethod,
        _path: &str,
        _payload: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value, ApiError>> {
        Box::pin(async { Err(ApiError::Disabled) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_paths() {
        assert_eq!(vm_status_path("pve", 101, VmOp::Start), "/nodes/pve/qemu/101/status/start");
        assert_eq!(vm_status_path("pve", 101, VmOp::Restart), "/nodes/pve/qemu/101/status/reboot");
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("delete".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        let m: HttpMethod = serde_json::from_str("\"post\"").unwrap();
        assert_eq!(m, HttpMethod::Post);
        assert_eq!(serde_json::to_string(&HttpMethod::Get).unwrap(), "\"GET\"");
        assert!(HttpMethod::Get.is_read_only());
        assert!(!HttpMethod::Put.is_read_only());
    }

    #[tokio::test]
    async fn test_disabled_api() {
        let err = DisabledApi.call(HttpMethod::Get, "/version", None).await.unwrap_err();
        assert_eq!(err, ApiError::Disabled);
    }
}
