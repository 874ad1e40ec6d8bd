//! Wire types of the host bridge.
//!
//! Requests arrive as `{id, method, params?}` and each gets one
//! `{id, ok, result | error}` response. Events raised while a request runs
//! are sent as `{requestId, event, data}`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::BridgeError;
use crate::inference::GenerationStats;
use crate::session::SessionStatus;
use crate::storage::{DownloadProgress, ModelInfo};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureModelParams {
    pub url: String,
    pub filename: String,
    #[serde(default, alias = "sha256")]
    pub integrity_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteModelParams {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelParams {
    pub path: PathBuf,
    #[serde(default, alias = "nCtx")]
    pub context_size: Option<u32>,
    #[serde(default, alias = "nThreads")]
    pub thread_count: Option<u32>,
    #[serde(default)]
    pub use_metal: Option<bool>,
}

/// Sampling fields left out fall back to the runtime settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub repeat_penalty: Option<f32>,
}

/// A decoded bridge call
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCall {
    EnsureModel(EnsureModelParams),
    ListDownloadedModels,
    DeleteModel(DeleteModelParams),
    LoadModel(LoadModelParams),
    UnloadModel,
    ClearContext,
    Generate(GenerateParams),
    CancelGeneration,
    GetModelInfo,
}

impl BridgeCall {
    /// Decodes `method` and its params. Calls without parameters ignore
    /// whatever `params` holds.
    pub fn parse(method: &str, params: Value) -> Result<Self, BridgeError> {
        let call = match method {
            "ensureModel" => BridgeCall::EnsureModel(decode(method, params)?),
            "listDownloadedModels" => BridgeCall::ListDownloadedModels,
            "deleteModel" => BridgeCall::DeleteModel(decode(method, params)?),
            "loadModel" => BridgeCall::LoadModel(decode(method, params)?),
            "unloadModel" => BridgeCall::UnloadModel,
            "clearContext" => BridgeCall::ClearContext,
            "generate" => BridgeCall::Generate(decode(method, params)?),
            "cancelGeneration" | "stopInference" => BridgeCall::CancelGeneration,
            "getModelInfo" => BridgeCall::GetModelInfo,
            other => {
                return Err(BridgeError::InvalidArgument(format!("unknown method {other:?}")));
            }
        };
        Ok(call)
    }

    pub fn method(&self) -> &'static str {
        match self {
            BridgeCall::EnsureModel(_) => "ensureModel",
            BridgeCall::ListDownloadedModels => "listDownloadedModels",
            BridgeCall::DeleteModel(_) => "deleteModel",
            BridgeCall::LoadModel(_) => "loadModel",
            BridgeCall::UnloadModel => "unloadModel",
            BridgeCall::ClearContext => "clearContext",
            BridgeCall::Generate(_) => "generate",
            BridgeCall::CancelGeneration => "cancelGeneration",
            BridgeCall::GetModelInfo => "getModelInfo",
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T, BridgeError> {
    serde_json::from_value(params)
        .map_err(|e| BridgeError::InvalidArgument(format!("invalid params for {method}: {e}")))
}

/// Successful outcome of a call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CallResult {
    Path { path: PathBuf },
    Models { models: Vec<ModelInfo> },
    Stats(GenerationStats),
    ModelInfo(SessionStatus),
    Done,
}

/// Notifications raised while a call runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum BridgeEvent {
    ModelDownloadProgress(DownloadProgress),
    TokenEvent { token: String },
    GenerationComplete(GenerationStats),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl From<&BridgeError> for ErrorBody {
    fn from(e: &BridgeError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn from_outcome(id: Value, outcome: Result<CallResult, BridgeError>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                id,
                ok: false,
                result: None,
                error: Some(ErrorBody::from(&e)),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<'a> {
    pub request_id: &'a Value,
    #[serde(flatten)]
    pub event: &'a BridgeEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_load_model_aliases() {
        let call = BridgeCall::parse(
            "loadModel",
            json!({"path": "/models/test.gguf", "nCtx": 1024, "nThreads": 2, "useMetal": true}),
        )
        .unwrap();
        assert_eq!(
            call,
            BridgeCall::LoadModel(LoadModelParams {
                path: PathBuf::from("/models/test.gguf"),
                context_size: Some(1024),
                thread_count: Some(2),
                use_metal: Some(true),
            })
        );

        let call = BridgeCall::parse("loadModel", json!({"path": "/m.gguf", "contextSize": 512})).unwrap();
        match call {
            BridgeCall::LoadModel(p) => {
                assert_eq!(p.context_size, Some(512));
                assert_eq!(p.thread_count, None);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_parse_ensure_model_sha256_alias() {
        let call = BridgeCall::parse(
            "ensureModel",
            json!({"url": "https://x/m.gguf", "filename": "m.gguf", "sha256": "ab"}),
        )
        .unwrap();
        match call {
            BridgeCall::EnsureModel(p) => assert_eq!(p.integrity_hash.as_deref(), Some("ab")),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_parse_unit_calls_ignore_params() {
        assert_eq!(
            BridgeCall::parse("stopInference", Value::Null).unwrap(),
            BridgeCall::CancelGeneration
        );
        assert_eq!(
            BridgeCall::parse("getModelInfo", json!({})).unwrap(),
            BridgeCall::GetModelInfo
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let err = BridgeCall::parse("teleport", Value::Null).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");

        let err = BridgeCall::parse("generate", json!({"maxTokens": 5})).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        assert!(err.to_string().contains("prompt"));

        let err = BridgeCall::parse("deleteModel", Value::Null).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_event_envelope_shape() {
        let id = json!(7);
        let event = BridgeEvent::TokenEvent {
            token: "hi".to_string(),
        };
        let value = serde_json::to_value(EventEnvelope {
            request_id: &id,
            event: &event,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"requestId": 7, "event": "tokenEvent", "data": {"token": "hi"}})
        );
    }

    #[test]
    fn test_response_shape() {
        let ok = Response::from_outcome(json!("a"), Ok(CallResult::Path { path: PathBuf::from("/m.gguf") }));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": "a", "ok": true, "result": {"path": "/m.gguf"}})
        );

        let done = Response::from_outcome(json!(1), Ok(CallResult::Done));
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({"id": 1, "ok": true, "result": null})
        );

        let err = Response::from_outcome(json!(2), Err(BridgeError::UnsupportedPlatform));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], json!("UNSUPPORTED_PLATFORM"));
        assert!(value.get("result").is_none());
    }
}
