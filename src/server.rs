//! HTTP front-end.
//!
//! Every request that does not hit an internal `/_gate/` route runs through
//! the engine and is answered with the decision: a 403 or redirect for
//! blocks, the challenge page, or a 200/redirect for allowed traffic.

use crate::config::ServerConfig;
use crate::engine::{Action, Decision, DecisionEngine};
use crate::detectors::RequestContext;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;

const DECISION_HEADER: HeaderName = HeaderName::from_static("x-bot-decision");
const REASON_HEADER: HeaderName = HeaderName::from_static("x-bot-reason");
const SCORE_HEADER: HeaderName = HeaderName::from_static("x-bot-human-score");

struct GateState {
    engine: Arc<DecisionEngine>,
    config: ServerConfig,
}

/// Router that gates every path through `engine`.
pub fn router(engine: Arc<DecisionEngine>, config: ServerConfig) -> Router {
    let state = Arc::new(GateState { engine, config });

    Router::new()
        .route("/_gate/health", get(health))
        .route("/_gate/stats", get(stats))
        .fallback(gate)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<GateState>>) -> impl IntoResponse {
    Json(state.engine.stats().snapshot())
}

async fn gate(State(state): State<Arc<GateState>>, request: Request) -> Response {
    let ctx = context_of(&request);
    let decision = state.engine.decide(&ctx).await;

    render(decision, &ctx, &state.config)
}

fn context_of(request: &Request) -> RequestContext {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    RequestContext::from_headers(request.headers(), request.method().as_str(), path, peer)
}

/// Turn a decision into the HTTP response sent to the client.
pub fn render(decision: Decision, ctx: &RequestContext, config: &ServerConfig) -> Response {
    let reason = decision.reason.as_str();
    let action = decision.action.as_str();
    let score = decision.classification.as_ref().map(|c| c.human_score);

    let mut response = match decision.action {
        Action::Block => config
            .block_redirect
            .as_deref()
            .and_then(redirect)
            .unwrap_or_else(|| (StatusCode::FORBIDDEN, "Forbidden").into_response()),
        Action::Challenge(page) => {
            let mut response = Html(page.body).into_response();
            let headers = response.headers_mut();
            if let Ok(cookie) = HeaderValue::from_str(&page.set_cookie) {
                headers.insert(header::SET_COOKIE, cookie);
            }
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        }
        Action::Allow => config
            .allow_redirect
            .as_deref()
            .and_then(|base| redirect(&format!("{}{}", base.trim_end_matches('/'), ctx.path)))
            .unwrap_or_else(|| (StatusCode::OK, "OK").into_response()),
    };

    if config.decision_headers {
        let headers = response.headers_mut();
        headers.insert(DECISION_HEADER, HeaderValue::from_static(action));
        headers.insert(REASON_HEADER, HeaderValue::from_static(reason));
        if let Some(score) = score {
            headers.insert(SCORE_HEADER, HeaderValue::from(score));
        }
    }

    response
}

/// `303 See Other` to `target`, or `None` when it cannot be a header value.
fn redirect(target: &str) -> Option<Response> {
    let location = HeaderValue::from_str(target).ok()?;
    Some((StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response())
}
