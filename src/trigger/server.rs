use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::pipeline::Pipeline;
use crate::trigger::handler::handle_request;

/// Serves one JSON request per stdin line and writes one JSON response per
/// stdout line. A blank line or `{}` runs a cycle for every active tenant.
pub async fn run_stdio_server(pipeline: &Pipeline<'_>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("read trigger stdin line")? {
        let response = handle_line(pipeline, &line).await;
        stdout
            .write_all(format!("{response}\n").as_bytes())
            .await
            .context("write trigger stdout response")?;
        stdout.flush().await.context("flush trigger stdout response")?;
    }

    Ok(())
}

pub async fn handle_line(pipeline: &Pipeline<'_>, line: &str) -> Value {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return handle_request(pipeline, None).await;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(body) => handle_request(pipeline, Some(body)).await,
        Err(error) => json!({
            "success": false,
            "message": format!("invalid JSON request: {error}"),
        }),
    }
}
