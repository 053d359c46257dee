use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::orchestrator::Enforcer;
use crate::storage::Storage;

#[derive(Debug, Deserialize)]
#[serde(tag = "method")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "violations")]
    Violations { limit: Option<i64> },
    #[serde(rename = "show")]
    Show { violation_id: String },
    #[serde(rename = "ignore")]
    Ignore { violation_id: String },
    #[serde(rename = "reload_rules")]
    ReloadRules,
    #[serde(rename = "activity")]
    Activity { limit: Option<i64> },
}

#[derive(Debug, Serialize)]
pub struct IpcResponse {
    pub success: bool,
    pub data: serde_json::Value,
}

impl IpcResponse {
    fn ok(data: serde_json::Value) -> Self {
        Self { success: true, data }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: json!({ "error": message.into() }),
        }
    }
}

/// Shared state behind the operator socket.
#[derive(Clone)]
pub struct IpcState {
    pub enforcer: Arc<Enforcer>,
    pub storage: Storage,
    pub started: Instant,
}

pub async fn start_ipc_server(state: IpcState, socket_path: &str) -> Result<JoinHandle<()>> {
    let _ = std::fs::remove_file(socket_path);
    if let Some(parent) = std::path::Path::new(socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    }

    info!("IPC server listening on {}", socket_path);

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, &state).await {
                            error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }))
}

async fn handle_client(stream: UnixStream, state: &IpcState) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    if BufReader::new(read).read_line(&mut line).await? == 0 {
        return Ok(());
    }
    info!("IPC request: {}", line.trim());

    let response = match serde_json::from_str::<IpcRequest>(&line) {
        Ok(req) => handle_request(req, state).await,
        Err(e) => {
            warn!("Invalid request: {}", e);
            IpcResponse::error(format!("Invalid request: {}", e))
        }
    };

    write.write_all(serde_json::to_string(&response)?.as_bytes()).await?;
    write.write_all(b"\n").await?;
    Ok(())
}

pub async fn handle_request(req: IpcRequest, state: &IpcState) -> IpcResponse {
    match req {
        IpcRequest::Status => handle_status(state).await,
        IpcRequest::Violations { limit } => handle_violations(&state.storage, limit.unwrap_or(20)).await,
        IpcRequest::Show { violation_id } => handle_show(&state.storage, &violation_id).await,
        IpcRequest::Ignore { violation_id } => handle_ignore(state, &violation_id).await,
        IpcRequest::ReloadRules => {
            let dropped = state.enforcer.evaluator().reload().await;
            IpcResponse::ok(json!({ "dropped": dropped }))
        }
        IpcRequest::Activity { limit } => handle_activity(&state.storage, limit.unwrap_or(20)).await,
    }
}

async fn handle_status(state: &IpcState) -> IpcResponse {
    let counts = match state.storage.violation_counts().await {
        Ok(counts) => counts,
        Err(e) => return IpcResponse::error(format!("Database error: {}", e)),
    };
    let providers: Vec<String> = state
        .enforcer
        .provider_kinds()
        .iter()
        .map(|k| k.to_string())
        .collect();

    IpcResponse::ok(json!({
        "status": "running",
        "uptime_seconds": state.started.elapsed().as_secs(),
        "ticks_completed": state.enforcer.ticks_completed().await,
        "last_tick": state.enforcer.last_tick().await,
        "violations": {
            "pending": counts.pending,
            "remediated": counts.remediated,
            "ignored": counts.ignored,
        },
        "rules_cached": state.enforcer.evaluator().cached_count().await,
        "providers": providers,
    }))
}

async fn handle_violations(storage: &Storage, limit: i64) -> IpcResponse {
    match storage.list_violations(limit).await {
        Ok(violations) => IpcResponse::ok(json!({ "violations": violations })),
        Err(e) => IpcResponse::error(format!("Failed to fetch violations: {}", e)),
    }
}

async fn handle_show(storage: &Storage, violation_id: &str) -> IpcResponse {
    let violation = match storage.get_violation(violation_id).await {
        Ok(Some(v)) => v,
        Ok(None) => return IpcResponse::error(format!("Violation {} not found", violation_id)),
        Err(e) => return IpcResponse::error(format!("Database error: {}", e)),
    };
    let policy = storage.find_policy(&violation.policy_id).await.ok().flatten();

    IpcResponse::ok(json!({
        "violation": violation,
        "policy": policy.map(|p| json!({
            "id": p.id,
            "name": p.name,
            "type": p.policy_type.as_str(),
            "config": p.config,
        })),
    }))
}

async fn handle_ignore(state: &IpcState, violation_id: &str) -> IpcResponse {
    match state.enforcer.ledger().ignore(violation_id).await {
        Ok(true) => IpcResponse::ok(json!({ "violation_id": violation_id, "status": "ignored" })),
        Ok(false) => IpcResponse::error(format!("Violation {} is not pending", violation_id)),
        Err(e) => IpcResponse::error(format!("Database error: {}", e)),
    }
}

async fn handle_activity(storage: &Storage, limit: i64) -> IpcResponse {
    match storage.list_activity(limit).await {
        Ok(entries) => IpcResponse::ok(json!({ "activity": entries })),
        Err(e) => IpcResponse::error(format!("Failed to fetch activity: {}", e)),
    }
}
