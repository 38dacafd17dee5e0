mod ops;

use helpdesk::{Config, Dispatcher, HelpdeskCore, Store, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({
            "success": true,
            "data": data,
            "message": null
        })),
        error: None,
        id,
    }
}

fn raw_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

// ─── Shared app state ────────────────────────────────────────────────────────

struct AppState {
    core: Arc<HelpdeskCore>,
    config: Config,
    http_addr: Option<SocketAddr>,
}

/// Set once during `initialize`.
static STATE: OnceCell<AppState> = OnceCell::const_new();

// ─── Entry point ─────────────────────────────────────────────────────────────

fn init_tracing() {
    // stdout carries the protocol; logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_env("HELPDESK_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    let stdin_loop = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        err_response(Value::Number(0.into()), -32700, format!("Parse error: {e}"));
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";
            let response = handle.block_on(handle_request(&request));
            emit_line(&mut out, &response);

            if is_shutdown {
                return true;
            }
        }
        false
    });

    match stdin_loop.await {
        Ok(true) => {}
        // Host went away without `shutdown`: still log what is in flight.
        Ok(false) => {
            if let Some(state) = STATE.get() {
                drain(state).await;
            }
        }
        Err(e) => tracing::error!(error = %e, "stdin loop terminated abnormally"),
    }
}

fn emit_line(out: &mut impl Write, resp: &JsonRpcResponse) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize response"),
    }
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

async fn handle_request(req: &JsonRpcRequest) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => handle_initialize(req).await,
        "shutdown" => handle_shutdown(req).await,
        "execute" => handle_execute(req).await,
        _ => err_response(req.id.clone(), -32601, format!("Unknown method: {}", req.method)),
    }
}

async fn build_state(data_dir: PathBuf) -> Result<AppState, String> {
    let config = Config::load(&data_dir).map_err(|e| e.to_string())?;

    let mut store = Store::with_data_dir(config.data_dir.clone());
    store.load().map_err(|e| format!("failed to load state: {e}"))?;
    let store = store.into_shared();

    let clock = Arc::new(SystemClock);
    let dispatcher = Dispatcher::new(store.clone(), config.webhooks.clone(), clock.clone())
        .map_err(|e| format!("failed to build HTTP client: {e}"))?;
    let core = Arc::new(HelpdeskCore::new(store, Arc::new(dispatcher), clock));

    let http_addr = if config.http.enabled {
        let addr = helpdesk::http_server::start(core.clone(), &config.http.bind)
            .await
            .map_err(|e| format!("HTTP server failed: {e}"))?;
        Some(addr)
    } else {
        None
    };

    Ok(AppState {
        core,
        config,
        http_addr,
    })
}

async fn handle_initialize(req: &JsonRpcRequest) -> JsonRpcResponse {
    let data_dir = req
        .params
        .get("data_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    if STATE.initialized() {
        return err_response(req.id.clone(), -32603, "already initialized".into());
    }

    let state = match build_state(data_dir).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "initialize failed");
            return err_response(req.id.clone(), -32603, e);
        }
    };

    let http_addr = state.http_addr.map(|a| a.to_string());
    if STATE.set(state).is_err() {
        return err_response(req.id.clone(), -32603, "already initialized".into());
    }
    tracing::info!(http = ?http_addr, "helpdesk core ready");

    raw_response(
        req.id.clone(),
        serde_json::json!({ "ready": true, "http_addr": http_addr }),
    )
}

/// Wait for in-flight deliveries and flush the store.
async fn drain(state: &AppState) {
    if let Err(e) = state.core.shutdown().await {
        tracing::warn!(error = %e, "failed to persist state on shutdown");
    }
}

async fn handle_shutdown(req: &JsonRpcRequest) -> JsonRpcResponse {
    if let Some(state) = STATE.get() {
        drain(state).await;
    }
    raw_response(req.id.clone(), serde_json::json!({}))
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(req: &JsonRpcRequest) -> JsonRpcResponse {
    let Some(state) = STATE.get() else {
        return err_response(req.id.clone(), -32002, "server not initialized".into());
    };

    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req
        .params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    let result = match operation {
        "get_server_info" => Ok(server_info(state).await),
        _ => ops::execute(operation, &input, &state.core).await,
    };

    match result {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), -32000, msg),
    }
}

async fn server_info(state: &AppState) -> Value {
    let webhook_count = state.core.list_webhooks().await.len();
    let policy_count = state.core.list_policies(false).await.len();
    serde_json::json!({
        "http_addr": state.http_addr.map(|a| a.to_string()),
        "data_dir": state.config.data_dir,
        "webhook_timeout_secs": state.config.webhooks.timeout_secs,
        "webhook_count": webhook_count,
        "sla_policy_count": policy_count,
    })
}
