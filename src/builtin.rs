//! Operation bodies the service registers out of the box.

use crate::operation::{OperationRegistry, SessionContext};
use crate::process::Application;
use crate::scheduler::ResourceClass;
use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry
        .register_fn(ResourceClass::ExclusiveAutomation, "automation.launch", launch)
        .register_fn(ResourceClass::BackgroundTask, "artifact.write", write)
        .register_fn(ResourceClass::BackgroundTask, "artifact.read", read);
    registry
}

#[derive(Deserialize)]
struct LaunchRequest {
    application: Application,
}

async fn launch(payload: Value, session: SessionContext) -> anyhow::Result<Value> {
    let req: LaunchRequest = serde_json::from_value(payload).context("invalid launch payload")?;
    let handle = session.acquire(req.application).await?;
    Ok(json!({
        "pid": handle.pid,
        "application": handle.application,
        "session_id": handle.session_id,
        "working_dir": handle.working_dir,
    }))
}

#[derive(Deserialize)]
struct WriteRequest {
    path: String,
    text: Option<String>,
    content_base64: Option<String>,
}

async fn write(payload: Value, session: SessionContext) -> anyhow::Result<Value> {
    let req: WriteRequest = serde_json::from_value(payload).context("invalid write payload")?;
    let content = match (req.text, req.content_base64) {
        (Some(text), None) => text.into_bytes(),
        (None, Some(encoded)) => STANDARD.decode(encoded).context("content_base64 is not valid base64")?,
        _ => bail!("exactly one of text or content_base64 is required"),
    };
    let written = session.write_artifact(&req.path, &content).await?;
    Ok(json!({ "path": written, "bytes": content.len() }))
}

#[derive(Deserialize)]
struct ReadRequest {
    path: String,
}

async fn read(payload: Value, session: SessionContext) -> anyhow::Result<Value> {
    let req: ReadRequest = serde_json::from_value(payload).context("invalid read payload")?;
    let content = session.read_artifact(&req.path).await?;
    Ok(json!({ "path": req.path, "content_base64": STANDARD.encode(content) }))
}
