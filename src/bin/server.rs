//! HTTP server for the projects query API
//! Plain tokio TCP handling, one task per connection

use anyhow::{Context, Result};
use projects_nlq::db::MemoryDataSource;
use projects_nlq::{init_tracing, EngineConfig, QueryEngine, QueryRequest};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const MAX_REQUEST_BYTES: usize = 1_000_000;
const REFRESH_TICK: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = EngineConfig::load().context("loading engine configuration")?;
    let engine = Arc::new(build_engine(config, std::env::var("NLQ_FIXTURE").ok()).await?);

    let report = engine.refresh_index().await;
    info!(
        "Column index loaded: {} columns, {} failed",
        report.refreshed.len(),
        report.failed.len()
    );
    engine.spawn_refresh_loop(REFRESH_TICK);

    let addr = std::env::var("NLQ_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Server listening on http://{}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("New connection from: {}", peer);
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            handle_connection(stream, engine).await;
        });
    }
}

/// Fixture file when `fixture` is set, Postgres otherwise.
async fn build_engine(config: EngineConfig, fixture: Option<String>) -> Result<QueryEngine> {
    match fixture {
        Some(path) => {
            let source = MemoryDataSource::from_json_file(Path::new(&path), &config.table, &config.columns)
                .with_context(|| format!("loading fixture {}", path))?;
            info!("Serving {} fixture rows from {}", source.len(), path);
            Ok(QueryEngine::with_llm(config, Arc::new(source)))
        }
        None => QueryEngine::connect(config)
            .await
            .context("connecting to Postgres"),
    }
}

async fn handle_connection(mut stream: TcpStream, engine: Arc<QueryEngine>) {
    let mut buffer = Vec::new();
    let mut temp_buf = [0; 8192];
    let mut too_large = false;

    let read_result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut temp_buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&temp_buf[..n]);
                    if let Ok(s) = std::str::from_utf8(&buffer) {
                        if let Some(headers_end) = s.find("\r\n\r\n").map(|i| i + 4) {
                            match extract_content_length(s) {
                                Some(length) if buffer.len() >= headers_end + length => break,
                                None if n < temp_buf.len() => break,
                                _ => {}
                            }
                        }
                    }
                    if buffer.len() > MAX_REQUEST_BYTES {
                        too_large = true;
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })
    .await;

    let response = match read_result {
        Err(_) => {
            warn!("Request read timeout");
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to read from stream: {}", e);
            return;
        }
        Ok(Ok(())) if too_large => create_response(413, r#"{"success":false,"error":"invalid_request","message":"request too large"}"#),
        Ok(Ok(())) if buffer.is_empty() => return,
        Ok(Ok(())) => match String::from_utf8(buffer) {
            Ok(request) => handle_request(&request, &engine).await,
            Err(_) => create_response(400, r#"{"success":false,"error":"invalid_request","message":"request is not UTF-8"}"#),
        },
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

fn extract_content_length(request: &str) -> Option<usize> {
    request
        .lines()
        .take_while(|line| !line.is_empty())
        .find(|line| line.to_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| value.trim().parse().ok())
}

async fn handle_request(request: &str, engine: &QueryEngine) -> String {
    let Some(request_line) = request.lines().next() else {
        return create_response(400, "{}");
    };
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let raw_path = parts.next().unwrap_or("/");
    let path = raw_path.split('?').next().unwrap_or(raw_path);
    let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };
    let body = request.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");

    debug!("{} {}", method, path);

    match (method, path) {
        ("OPTIONS", _) => create_response(200, "{}"),
        ("GET", "/api/health") => {
            let body = json!({
                "status": "ok",
                "index_ready": engine.index().is_initialized(),
                "templates": engine.catalog().names(),
            });
            create_response(200, &body.to_string())
        }
        ("POST", "/api/query") => match serde_json::from_str::<QueryRequest>(body) {
            Ok(query) => {
                let outcome = engine.handle_with_timeout(query).await;
                let status = outcome.response.status_code();
                let mut payload = outcome.to_api_json();
                payload["request_id"] = json!(outcome.request_id.to_string());
                create_response(status, &payload.to_string())
            }
            Err(e) => {
                let payload = json!({
                    "success": false,
                    "error": "invalid_request",
                    "message": format!("invalid request body: {}", e),
                });
                create_response(400, &payload.to_string())
            }
        },
        ("POST", "/api/index/refresh") => {
            let report = engine.refresh_index().await;
            let status = if report.refreshed.is_empty() && !report.failed.is_empty() {
                503
            } else {
                200
            };
            create_response(status, &json!(report).to_string())
        }
        _ => create_response(404, r#"{"success":false,"error":"not_found"}"#),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

fn create_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text(status),
        body.len(),
        body
    )
}
