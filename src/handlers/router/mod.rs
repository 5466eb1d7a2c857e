//! Rule router.
//!
//! Maps inbound request paths to the broker of the first rule whose publish
//! or subscribe path matches, in configuration order. Requests matching no
//! rule are handed to the next router unmodified.
//!
//! A configured path matches itself and anything below it on a `/`
//! boundary, so `/chat` covers `/chat/room` but not `/chatroom`. This is
//! stricter than a plain string-prefix match.
//!
//! Request fields are read with first-value-wins semantics: a repeated key
//! uses its first occurrence, and form body fields come before query fields.
//!
//! ## Client contract
//!
//! Publish (`GET` query or form-encoded `POST`, fields `category` and
//! `body`): `200 OK` with text `OK`, or `500` with text `Not OK`.
//!
//! Subscribe (`GET ?category=..&timeout=..[&since=<id>|&since_time=<millis>]`):
//! ```text
//! 200 {"events":[{"id":7,"category":"team","body":"hello","timestamp":1700000000123}],"cursor":7}
//! 200 {"events":[],"cursor":7,"timeout":"no events before timeout","timestamp":1700000045000}
//! 400 {"error":"subscription category missing"}
//! 503 {"error":"broker shutting down"}
//! ```
//!
//! `cursor` is the largest delivered id. On timeout it echoes the request's
//! `since`, or the broker's latest event id at the time of the request when no
//! cursor was sent; a `since_time` cursor is echoed as `since_time` instead.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, FromRequest, Query, Request, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use super::errmsg;
use crate::broker::{Broker, BrokerError, Cursor, Event, SubscribeOutcome};
use crate::config::{Config, RuleConfig};

/// Which side of a rule a request path hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Publish,
    Subscribe,
}

/// A configured path pair and the broker it owns.
pub struct Rule {
    publish_path: String,
    subscribe_path: String,
    broker: Arc<Broker>,
}

impl Rule {
    /// Start a broker for `config`.
    pub fn start(config: &RuleConfig) -> Self {
        info!(
            publish_path = %config.publish_path,
            subscribe_path = %config.subscribe_path,
            "Mounting pubsub rule"
        );
        Self {
            publish_path: config.publish_path.clone(),
            subscribe_path: config.subscribe_path.clone(),
            broker: Arc::new(Broker::start(config.broker_options())),
        }
    }

    pub fn publish_path(&self) -> &str {
        &self.publish_path
    }

    pub fn subscribe_path(&self) -> &str {
        &self.subscribe_path
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Endpoint `path` falls under, subscribe taking precedence.
    pub fn endpoint_for(&self, path: &str) -> Option<Endpoint> {
        if path_matches(path, &self.subscribe_path) {
            Some(Endpoint::Subscribe)
        } else if path_matches(path, &self.publish_path) {
            Some(Endpoint::Publish)
        } else {
            None
        }
    }
}

/// Check if a request path falls under a configured base path.
///
/// Matching rules:
/// - Exact match: "/chat" matches "/chat"
/// - Hierarchical: "/chat" matches "/chat/room" (prefix match with slash separator)
fn path_matches(path: &str, base: &str) -> bool {
    if path == base {
        return true;
    }
    path.starts_with(base) && (base.ends_with('/') || path[base.len()..].starts_with('/'))
}

/// Ordered list of rules, created once per process.
#[derive(Clone)]
pub struct RuleRouter {
    rules: Arc<Vec<Rule>>,
}

impl RuleRouter {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: Arc::new(rules),
        }
    }

    /// Start one broker per configured rule.
    ///
    /// The configuration is expected to have been validated.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rules.iter().map(Rule::start).collect())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First rule (in configuration order) handling `path`.
    pub fn route(&self, path: &str) -> Option<(&Rule, Endpoint)> {
        self.rules
            .iter()
            .find_map(|rule| rule.endpoint_for(path).map(|endpoint| (rule, endpoint)))
    }

    /// Build an axum router dispatching to the rules, falling back to `next`.
    pub fn into_router(self, next: Router) -> Router {
        let state = Arc::new(DispatchState { rules: self, next });
        Router::new().fallback(dispatch).with_state(state)
    }

    /// Shut every broker down, releasing blocked subscribers.
    pub async fn shutdown(&self) {
        futures::future::join_all(self.rules.iter().map(|rule| rule.broker.shutdown())).await;
        info!(rules = self.rules.len(), "All pubsub brokers stopped");
    }
}

struct DispatchState {
    rules: RuleRouter,
    next: Router,
}

async fn dispatch(State(state): State<Arc<DispatchState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    match state.rules.route(&path) {
        Some((rule, Endpoint::Subscribe)) => subscribe(&rule.broker, request).await,
        Some((rule, Endpoint::Publish)) => publish(&rule.broker, request).await,
        None => {
            debug!(path = %path, "No pubsub rule matched, passing through");
            state
                .next
                .clone()
                .oneshot(request)
                .await
                .unwrap_or_else(|never| match never {})
        }
    }
}

// ============================================================================
// Publish
// ============================================================================

/// Decoded `key=value` pairs, in request order.
#[derive(Debug, Default)]
struct Fields(Vec<(String, String)>);

impl Fields {
    fn from_uri(uri: &Uri) -> Self {
        Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map(|Query(pairs)| Self(pairs))
            .unwrap_or_default()
    }

    async fn from_form(request: Request) -> Self {
        Form::<Vec<(String, String)>>::from_request(request, &())
            .await
            .map(|Form(pairs)| Self(pairs))
            .unwrap_or_default()
    }

    /// First value for `key`.
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn extend(&mut self, other: Fields) {
        self.0.extend(other.0);
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

async fn publish(broker: &Broker, request: Request) -> Response {
    let query = Fields::from_uri(request.uri());

    // Form bodies take precedence over the query string.
    let mut fields = if request.method() == Method::GET || request.method() == Method::HEAD {
        Fields::default()
    } else {
        Fields::from_form(request).await
    };
    fields.extend(query);

    let category = non_empty(fields.get("category"));
    let body = non_empty(fields.get("body"));

    let result = match (category, body) {
        (None, _) => Err(BrokerError::EmptyCategory),
        (Some(_), None) => Err(BrokerError::EmptyBody),
        (Some(category), Some(body)) => broker.publish(&category, &body).await.map(|_| ()),
    };

    match result {
        Ok(()) => plain_text(StatusCode::OK, errmsg::PUBLISH_OK),
        Err(e) => {
            warn!(error = %e, "Publication rejected");
            plain_text(StatusCode::INTERNAL_SERVER_ERROR, errmsg::PUBLISH_NOT_OK)
        }
    }
}

fn plain_text(status: StatusCode, body: &'static str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

// ============================================================================
// Subscribe
// ============================================================================

#[derive(Debug, Default)]
struct SubscribeParams {
    category: Option<String>,
    timeout: Option<String>,
    since: Option<String>,
    since_time: Option<String>,
}

impl SubscribeParams {
    fn from_fields(fields: &Fields) -> Self {
        let field = |key: &str| fields.get(key).map(str::to_string);
        Self {
            category: field("category"),
            timeout: field("timeout"),
            since: field("since"),
            since_time: field("since_time"),
        }
    }

    /// Requested wait; unparsable or non-positive values defer to the broker maximum.
    fn timeout(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|t| t.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    fn cursor(&self) -> Option<Cursor> {
        let since = self
            .since
            .as_deref()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Cursor::Id);
        let since_time = || {
            self.since_time
                .as_deref()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Cursor::Time)
        };
        since.or_else(since_time)
    }
}

#[derive(Debug, Serialize)]
struct SubscribeResponse<'a> {
    events: Vec<&'a Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    since_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

impl<'a> From<&'a SubscribeOutcome> for SubscribeResponse<'a> {
    fn from(outcome: &'a SubscribeOutcome) -> Self {
        let (cursor, since_time) = match outcome.cursor {
            Cursor::Id(id) => (Some(id), None),
            Cursor::Time(millis) => (None, Some(millis)),
        };
        let (timeout, timestamp) = if outcome.timed_out {
            (
                Some(errmsg::SUBSCRIBE_TIMEOUT),
                Some(chrono::Utc::now().timestamp_millis()),
            )
        } else {
            (None, None)
        };
        Self {
            events: outcome.events.iter().map(|e| e.as_ref()).collect(),
            cursor,
            since_time,
            timeout,
            timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

fn json_error(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

async fn subscribe(broker: &Broker, request: Request) -> Response {
    let params = SubscribeParams::from_fields(&Fields::from_uri(request.uri()));

    let Some(category) = non_empty(params.category.as_deref()) else {
        return json_error(StatusCode::BAD_REQUEST, errmsg::SUBSCRIBE_NO_CATEGORY);
    };

    // This call blocks until an event is published, the wait times out, or
    // the client goes away (which drops this future).
    match broker
        .subscribe(&category, params.timeout(), params.cursor())
        .await
    {
        Ok(outcome) => {
            debug!(
                category = %category,
                events = outcome.events.len(),
                timed_out = outcome.timed_out,
                "Subscription resolved"
            );
            (StatusCode::OK, Json(SubscribeResponse::from(&outcome))).into_response()
        }
        Err(BrokerError::ShutDown) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, errmsg::BROKER_SHUTTING_DOWN)
        }
        Err(e) => {
            warn!(category = %category, error = %e, "Subscription rejected");
            json_error(StatusCode::BAD_REQUEST, errmsg::SUBSCRIBE_NO_CATEGORY)
        }
    }
}

#[cfg(test)]
mod tests;
