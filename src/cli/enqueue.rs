use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

use mnemos::config::MnemosConfig;
use mnemos::events::EventType;
use mnemos::runtime::Runtime;

/// Add a session to the consolidation queue. Re-enqueueing a known session is a no-op.
pub fn enqueue(config: MnemosConfig, session_id: &str, session_path: &Path) -> Result<()> {
    let session_path = std::path::absolute(session_path)
        .with_context(|| format!("invalid session path: {}", session_path.display()))?;

    let runtime = Runtime::open(config)?;
    let added = runtime.queue().add(session_id, &session_path)?;

    if added {
        runtime.events().publish(
            EventType::SessionQueued,
            json!({
                "session_id": session_id,
                "session_path": session_path.to_string_lossy(),
            }),
        )?;
        println!("Queued {session_id}");
    } else {
        println!("{session_id} is already queued");
    }

    runtime.shutdown();
    Ok(())
}
