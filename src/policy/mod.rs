//! Direction-aware OBS WebSocket v5 protocol policy.
//!
//! Every byte crossing the relay trust boundary must be a well-formed OBS v5
//! frame of a permitted shape for its direction. This module is the single
//! place policy is applied; the whitelists below are the source of truth.

use std::collections::HashSet;
use std::sync::LazyLock;

use serde::Deserialize;
use serde_json::Value;

/// Direction a frame is traveling, relative to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Responses and events originating from local OBS, bound for the relay.
    AgentToRelay,
    /// Commands from the relay, bound for local OBS.
    RelayToAgent,
}

/// Ops the agent may forward to the relay: Hello, Identified, Event,
/// RequestResponse, RequestBatchResponse.
const AGENT_TO_RELAY_OPS: &[i64] = &[0, 2, 5, 7, 9];

/// Ops the relay may send toward local OBS: Identify, Request, RequestBatch.
const RELAY_TO_AGENT_OPS: &[i64] = &[1, 6, 8];

/// OBS request types the relay is allowed to invoke. Compiled in; anything
/// else is rejected. Kept as data so new types are a one-line change.
const ALLOWED_REQUEST_TYPES: &[&str] = &[
    // Scenes
    "GetSceneList",
    "SetCurrentProgramScene",
    "GetCurrentProgramScene",
    "CreateScene",
    "RemoveScene",
    "SetSceneName",
    // Scene items (sources within scenes)
    "GetSceneItemList",
    "GetSceneItemEnabled",
    "SetSceneItemEnabled",
    "GetSceneItemTransform",
    "SetSceneItemTransform",
    "RemoveSceneItem",
    // Sources / inputs
    "GetSourcesList",
    "GetSourceActive",
    "SetSourceFilterEnabled",
    "CreateInput",
    "GetInputSettings",
    "SetInputSettings",
    "SetInputName",
    "GetInputMute",
    "SetInputMute",
    "ToggleInputMute",
    "GetInputVolume",
    "SetInputVolume",
    // Stream
    "GetStreamStatus",
    "StartStream",
    "StopStream",
    "ToggleStream",
    // Record
    "GetRecordStatus",
    "StartRecord",
    "StopRecord",
    "PauseRecord",
    "ResumeRecord",
    // Replay buffer
    "GetReplayBufferStatus",
    "StartReplayBuffer",
    "StopReplayBuffer",
    "SaveReplayBuffer",
    // Virtual cam
    "GetVirtualCamStatus",
    "StartVirtualCam",
    "StopVirtualCam",
    // Studio mode
    "GetStudioModeEnabled",
    "SetStudioModeEnabled",
    // Media
    "TriggerMediaInputAction",
    // General
    "GetVideoSettings",
    "GetStats",
    "GetVersion",
    // Control-plane extension, intercepted by the bridge before it ever
    // reaches OBS (see bridge::CONFIGURE_MONITOR_REQUEST).
    "AgentConfigureMonitor",
];

static REQUEST_TYPE_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| ALLOWED_REQUEST_TYPES.iter().copied().collect());

/// Minimal OBS v5 wire shape: `{op: int, d: object}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ObsFrame {
    pub op: i64,
    #[serde(default)]
    pub d: Option<Value>,
}

/// Why [`validate`] rejected a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    NotJson,
    ForbiddenOp(i64),
    ForbiddenRequest(String),
    ForbiddenBatchRequest(String),
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJson => f.write_str("not_json"),
            Self::ForbiddenOp(op) => write!(f, "forbidden_op_{}", op),
            Self::ForbiddenRequest(name) => write!(f, "forbidden_request_{}", name),
            Self::ForbiddenBatchRequest(name) => write!(f, "forbidden_batch_request_{}", name),
        }
    }
}

/// True if `request_type` is on the compiled-in whitelist.
pub fn request_allowed(request_type: &str) -> bool {
    REQUEST_TYPE_SET.contains(request_type)
}

/// Check that `payload` is a valid OBS v5 message permitted in `direction`.
///
/// For op 6 the `requestType` must be whitelisted; for op 8 every entry of
/// `requests[*].requestType` must be. A missing or malformed `d` passes the
/// op-level check (OBS itself rejects such frames).
pub fn validate(payload: &[u8], direction: Direction) -> Result<ObsFrame, PolicyViolation> {
    let frame: ObsFrame = match serde_json::from_slice(payload) {
        Ok(frame) => frame,
        Err(_) => return Err(PolicyViolation::NotJson),
    };

    let allowed = match direction {
        Direction::AgentToRelay => AGENT_TO_RELAY_OPS,
        Direction::RelayToAgent => RELAY_TO_AGENT_OPS,
    };
    if !allowed.contains(&frame.op) {
        return Err(PolicyViolation::ForbiddenOp(frame.op));
    }

    if frame.op == 6 {
        if let Some(name) = frame
            .d
            .as_ref()
            .and_then(|d| d.get("requestType"))
            .and_then(|v| v.as_str())
        {
            if !name.is_empty() && !request_allowed(name) {
                return Err(PolicyViolation::ForbiddenRequest(name.to_string()));
            }
        }
    }

    if frame.op == 8 {
        if let Some(requests) = frame
            .d
            .as_ref()
            .and_then(|d| d.get("requests"))
            .and_then(|v| v.as_array())
        {
            for req in requests {
                if let Some(name) = req.get("requestType").and_then(|v| v.as_str()) {
                    if !name.is_empty() && !request_allowed(name) {
                        return Err(PolicyViolation::ForbiddenBatchRequest(name.to_string()));
                    }
                }
            }
        }
    }

    Ok(frame)
}
