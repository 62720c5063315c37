//! HTTP surface: the `/api` routes, the chat page, static files, and the
//! header rewriting that lets the page run inside a survey iframe.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_SECURITY_POLICY, X_FRAME_OPTIONS};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use colored::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::audit::AuditOutcome;
use crate::cli::Args;
use crate::error::{ChatError, ConfigError};
use crate::orchestrator::ChatTurn;
use crate::state::AppState;

/// Survey-platform subdomains.
pub const DEFAULT_ORIGIN_REGEX: &str = r"^https://([a-z0-9-]+\.)*qualtrics\.com$";

/// Origins that are always allowed.
pub const BASE_ALLOWED_ORIGINS: [&str; 3] = [
    "https://qualtrics.com",
    "http://localhost:8000",
    "http://127.0.0.1:8000",
];

/// Participant id fields, highest precedence first.
const PID_FIELDS: [&str; 3] = ["prolific_pid", "test_pid", "pid"];

const DEBUG_PID: &str = "DEBUG_PID";
const DEBUG_BOT: &str = "debug-bot";

/// Served at `/` when the static directory has no `index.html`.
pub const FALLBACK_INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Study Chat</title>
<style>
  body { font-family: system-ui, sans-serif; max-width: 40rem; margin: 2rem auto; }
  #log p { margin: .4rem 0; }
  .user { color: #1f4e79; }
  .assistant { color: #333; }
</style>
</head>
<body>
<h3>Chat frontend not found</h3>
<p>Put <code>index.html</code> in the static directory, or use the minimal form below.</p>
<div id="log"></div>
<form id="f">
  <input id="m" autocomplete="off" placeholder="Type a message" size="50">
  <button>Send</button>
</form>
<script>
const q = new URLSearchParams(location.search);
const pid = q.get("PROLIFIC_PID") || q.get("pid") || "";
const bot = q.get("bot") || "1";
const log = document.getElementById("log");
function line(cls, text) {
  const p = document.createElement("p");
  p.className = cls;
  p.textContent = text;
  log.appendChild(p);
}
document.getElementById("f").addEventListener("submit", async (e) => {
  e.preventDefault();
  const input = document.getElementById("m");
  const message = input.value.trim();
  if (!message) return;
  input.value = "";
  line("user", message);
  const r = await fetch("/api/chat", {
    method: "POST",
    headers: { "Content-Type": "application/json" },
    body: JSON.stringify({ prolific_pid: pid, bot, message }),
  });
  const data = await r.json();
  line("assistant", data.reply || data.error);
});
</script>
</body>
</html>
"##;

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

/// Which browser origins may call the API.
#[derive(Debug, Clone)]
pub struct CorsSettings {
    origins: Vec<String>,
    pattern: Option<Regex>,
}

impl CorsSettings {
    /// The fixed allow-list plus an optional extra exact origin.
    pub fn new(extra_origin: Option<&str>) -> Self {
        let mut origins: Vec<String> = BASE_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect();
        if let Some(extra) = extra_origin.map(str::trim).filter(|o| !o.is_empty()) {
            origins.push(extra.trim_end_matches('/').to_string());
        }
        Self {
            origins,
            pattern: None,
        }
    }

    pub fn with_origin_regex(mut self, pattern: &str) -> Result<Self, ConfigError> {
        let re = Regex::new(pattern).map_err(|e| ConfigError::OriginRegex {
            pattern: pattern.to_string(),
            detail: e.to_string(),
        })?;
        self.pattern = Some(re);
        Ok(self)
    }

    /// An invalid regex is logged and left out; the exact list still applies.
    pub fn from_args(args: &Args) -> Self {
        let base = Self::new(args.allowed_origin.as_deref());
        match base.clone().with_origin_regex(&args.allow_origin_regex) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "ignoring origin regex");
                base
            }
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.origins.iter().any(|o| o == origin)
            || self.pattern.as_ref().is_some_and(|re| re.is_match(origin))
    }

    pub fn origins(&self) -> &[String] {
        &self.origins
    }

    pub fn layer(&self) -> CorsLayer {
        let settings = self.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts: &Parts| {
                    origin.to_str().map(|o| settings.allows(o)).unwrap_or(false)
                },
            ))
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    }
}

// ---------------------------------------------------------------------------
// Iframe headers
// ---------------------------------------------------------------------------

/// Drop every `frame-ancestors` directive. `None` when nothing is left.
pub fn strip_frame_ancestors(csp: &str) -> Option<String> {
    let kept: Vec<&str> = csp
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .filter(|d| {
            let name = d.split_whitespace().next().unwrap_or("");
            !name.eq_ignore_ascii_case("frame-ancestors")
        })
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}

pub fn allow_framing(headers: &mut HeaderMap) {
    if headers.contains_key(X_FRAME_OPTIONS) {
        headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("ALLOWALL"));
    }

    let csp = match headers.get(CONTENT_SECURITY_POLICY) {
        Some(value) => value.to_str().map(str::to_owned).ok(),
        None => return,
    };
    match csp.as_deref().and_then(strip_frame_ancestors) {
        Some(policy) => match HeaderValue::from_str(&policy) {
            Ok(value) => {
                headers.insert(CONTENT_SECURITY_POLICY, value);
            }
            Err(_) => {
                headers.remove(CONTENT_SECURITY_POLICY);
            }
        },
        None => {
            headers.remove(CONTENT_SECURITY_POLICY);
        }
    }
}

async fn frame_headers(mut response: Response) -> Response {
    allow_framing(response.headers_mut());
    response
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

/// String or number field as text.
fn text_field(body: &Value, name: &str) -> Option<String> {
    match body.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pull the turn fields out of a raw `/api/chat` body.
pub fn parse_chat_body(raw: &[u8]) -> Result<ChatTurn, ChatError> {
    let body: Value = serde_json::from_slice(raw).map_err(|_| ChatError::InvalidJson)?;
    if !body.is_object() {
        return Err(ChatError::InvalidJson);
    }

    let participant_id = PID_FIELDS
        .iter()
        .filter_map(|f| text_field(&body, f))
        .find(|p| !p.trim().is_empty());
    let message = text_field(&body, "message")
        .filter(|m| !m.trim().is_empty())
        .or_else(|| text_field(&body, "msg"));

    Ok(ChatTurn {
        participant_id,
        bot: text_field(&body, "bot"),
        message,
    })
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionQuery {
    pid: Option<String>,
    bot: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum TestLogResponse {
    Success { message: String },
    Error { detail: String },
}

async fn create_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let info = state
        .orchestrator
        .open_session(query.pid.as_deref(), query.bot.as_deref())
        .await;
    Json(info)
}

async fn chat(State(state): State<AppState>, body: Bytes) -> Response {
    let turn = match parse_chat_body(&body) {
        Ok(turn) => turn,
        Err(e) => {
            warn!(error = %e, "rejected chat request");
            return e.into_response();
        }
    };
    match state.orchestrator.chat(turn).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            warn!(error = %e, "rejected chat request");
            e.into_response()
        }
    }
}

fn describe(outcome: &AuditOutcome) -> String {
    match outcome {
        AuditOutcome::Remote => "appended".to_string(),
        AuditOutcome::Disabled => "spreadsheet logging disabled".to_string(),
        AuditOutcome::Fallback { reason } => format!("append failed, written to fallback file: {reason}"),
        AuditOutcome::Dropped { reason } => format!("append and fallback failed: {reason}"),
    }
}

/// Writes two debug records and reports whether both reached the spreadsheet.
async fn test_log(State(state): State<AppState>) -> Json<TestLogResponse> {
    let audit = state.orchestrator.audit();
    let first = audit.record(DEBUG_PID, DEBUG_BOT, "system", "test-log probe 1 of 2").await;
    let second = audit.record(DEBUG_PID, DEBUG_BOT, "system", "test-log probe 2 of 2").await;

    if first.is_remote() && second.is_remote() {
        info!("test-log probe reached the spreadsheet");
        Json(TestLogResponse::Success {
            message: "two debug rows appended".to_string(),
        })
    } else {
        let detail = format!("first: {}; second: {}", describe(&first), describe(&second));
        warn!(%detail, "test-log probe did not reach the spreadsheet");
        Json(TestLogResponse::Error { detail })
    }
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let path = state.static_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Html(page),
        Err(_) => Html(FALLBACK_INDEX_HTML.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Router and server
// ---------------------------------------------------------------------------

pub fn router(state: AppState, cors: &CorsSettings) -> Router {
    let api = Router::new()
        .route("/session", post(create_session))
        .route("/chat", post(chat))
        .route("/test-log", get(test_log));

    let mut app = Router::new().route("/", get(index)).nest("/api", api);

    if state.static_dir.is_dir() {
        app = app.nest_service("/static", ServeDir::new(&state.static_dir));
    } else {
        warn!(dir = %state.static_dir.display(), "static directory missing, /static disabled");
    }

    app.layer(middleware::map_response(frame_headers))
        .layer(cors.layer())
        .with_state(state)
}

fn print_banner(bind: &str, state: &AppState) {
    let persona = state.orchestrator.persona();
    eprintln!(
        "{}",
        format!("  Study chat server listening on http://{bind}").bright_green()
    );
    eprintln!(
        "{}",
        format!("  persona: {} (arm label {})", persona.name, persona.arm_label).bright_cyan()
    );
    if state.orchestrator.audit().is_enabled() {
        eprintln!("{}", "  spreadsheet logging: enabled".bright_cyan());
    } else {
        eprintln!("{}", "  spreadsheet logging: disabled".yellow());
    }
    eprintln!(
        "{}",
        format!("  static dir: {}", state.static_dir.display()).bright_blue()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Build everything from `args` and serve until Ctrl+C.
pub async fn serve(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_args(args).await;
    let cors = CorsSettings::from_args(args);
    let bind = args.bind_addr();

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    print_banner(&bind, &state);
    info!(%bind, origins = ?cors.origins(), "HTTP server listening");

    let app = router(state, &cors);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
