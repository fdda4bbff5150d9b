//! MCP Progress Notifications
//!
//! Tracks progress tokens supplied in `params._meta.progressToken`, enforces
//! that reported progress only moves forward, and rate-limits emission per
//! token.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::{methods, JsonRpcNotification, ProgressToken, RequestId};
use crate::mcp::rate_limit::RateLimiter;

/// Message attached to the automatic notification sent before a handler runs.
pub const STARTED_MESSAGE: &str = "in progress";

/// Message attached to the automatic notification sent after a handler returns.
pub const COMPLETED_MESSAGE: &str = "completed";

/// Progress notification params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A validated progress update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressNotification {
    pub token: ProgressToken,
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
}

impl ProgressNotification {
    /// Build an update, rejecting negative progress or progress beyond `total`.
    pub fn new(
        token: ProgressToken,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<Self> {
        if !progress.is_finite() || progress < 0.0 {
            return Err(Error::InvalidParams(
                "progress must be a finite, non-negative number".to_string(),
            ));
        }
        if let Some(total) = total {
            if !total.is_finite() || total <= 0.0 {
                return Err(Error::InvalidParams("total must be positive".to_string()));
            }
            if progress > total {
                return Err(Error::InvalidParams(
                    "progress must not exceed total".to_string(),
                ));
            }
        }
        let message = message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        Ok(Self {
            token,
            progress,
            total,
            message,
        })
    }

    /// Parse the params of an inbound `notifications/progress`.
    pub fn from_params(params: &Value) -> Result<Self> {
        let params: ProgressParams = serde_json::from_value(params.clone())
            .map_err(|e| Error::InvalidParams(e.to_string()))?;
        Self::new(
            params.progress_token,
            params.progress,
            params.total,
            params.message,
        )
    }

    pub fn to_params(&self) -> ProgressParams {
        ProgressParams {
            progress_token: self.token.clone(),
            progress: self.progress,
            total: self.total,
            message: self.message.clone(),
        }
    }

    pub fn to_notification(&self) -> JsonRpcNotification {
        let params = serde_json::to_value(self.to_params()).ok();
        JsonRpcNotification::new(methods::PROGRESS, params)
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenState {
    last: f64,
    total: Option<f64>,
}

impl TokenState {
    fn new() -> Self {
        Self {
            last: f64::NEG_INFINITY,
            total: None,
        }
    }

    /// The value a final notification reports: the latest total, or 1.
    fn target(&self) -> f64 {
        self.total.unwrap_or_else(|| self.last.max(1.0))
    }
}

/// Progress tracker for inbound requests of one session.
pub struct ProgressTracker {
    /// Ids of requests registered and not yet released.
    seen: DashSet<RequestId>,
    tokens: DashMap<RequestId, ProgressToken>,
    progress: DashMap<ProgressToken, TokenState>,
    limiter: RateLimiter<ProgressToken>,
}

impl ProgressTracker {
    pub fn new(limiter: RateLimiter<ProgressToken>) -> Self {
        Self {
            seen: DashSet::new(),
            tokens: DashMap::new(),
            progress: DashMap::new(),
            limiter,
        }
    }

    /// Register an inbound request and its optional progress token.
    ///
    /// A request id may not be registered again until it is released. A
    /// rejected registration leaves nothing behind.
    pub fn register(&self, id: &RequestId, params: Option<&Value>) -> Result<Option<ProgressToken>> {
        if !self.seen.insert(id.clone()) {
            return Err(Error::InvalidRequest(format!("Duplicate request id: {}", id)));
        }
        let registered = self.register_token(id, params);
        if registered.is_err() {
            self.seen.remove(id);
        }
        registered
    }

    fn register_token(&self, id: &RequestId, params: Option<&Value>) -> Result<Option<ProgressToken>> {
        let token = ProgressToken::from_params(params)?;
        if let Some(token) = &token {
            match self.progress.entry(token.clone()) {
                Entry::Occupied(_) => {
                    return Err(Error::InvalidParams(format!(
                        "Duplicate progress token: {}",
                        token
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(TokenState::new());
                }
            }
            self.tokens.insert(id.clone(), token.clone());
            debug!("Registered progress token {} for request {}", token, id);
        }
        Ok(token)
    }

    /// Discard all state for a finished request.
    pub fn release(&self, id: &RequestId) {
        self.seen.remove(id);
        if let Some((_, token)) = self.tokens.remove(id) {
            self.progress.remove(&token);
            self.limiter.remove(&token);
        }
    }

    /// Number of registered requests not yet released.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Validate a handler-supplied update and turn it into a wire notification.
    pub fn prepare(&self, note: &ProgressNotification) -> Result<JsonRpcNotification> {
        if !self.is_active(&note.token) {
            return Err(Error::InvalidParams(format!(
                "Unknown progress token: {}",
                note.token
            )));
        }
        self.limiter.check(&note.token)?;
        self.record(note)?;
        Ok(note.to_notification())
    }

    /// Like [`prepare`](Self::prepare), but exempt from rate limiting.
    pub fn prepare_unthrottled(&self, note: &ProgressNotification) -> Result<JsonRpcNotification> {
        self.record(note)?;
        Ok(note.to_notification())
    }

    /// Record an update; progress must strictly increase for a token.
    pub fn record(&self, note: &ProgressNotification) -> Result<()> {
        let mut state = self.progress.get_mut(&note.token).ok_or_else(|| {
            Error::InvalidParams(format!("Unknown progress token: {}", note.token))
        })?;
        if note.progress <= state.last {
            return Err(Error::InvalidParams("progress must increase".to_string()));
        }
        state.last = note.progress;
        if note.total.is_some() {
            state.total = note.total;
        }
        Ok(())
    }

    pub fn is_active(&self, token: &ProgressToken) -> bool {
        self.progress.contains_key(token)
    }

    /// Whether any update was recorded for the token.
    pub fn has_progress(&self, token: &ProgressToken) -> bool {
        self.progress
            .get(token)
            .map(|s| s.last > f64::NEG_INFINITY)
            .unwrap_or(false)
    }

    /// The final update for a token, or `None` if completion was already reported.
    pub fn completion(&self, token: &ProgressToken) -> Option<ProgressNotification> {
        let state = *self.progress.get(token)?;
        let target = state.target();
        if state.last >= target {
            return None;
        }
        ProgressNotification::new(
            token.clone(),
            target,
            Some(target),
            Some(COMPLETED_MESSAGE.to_string()),
        )
        .ok()
    }

    pub fn token_for(&self, id: &RequestId) -> Option<ProgressToken> {
        self.tokens.get(id).map(|t| t.clone())
    }
}

/// Destination for notifications emitted on behalf of a handler.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()>;
}

/// Progress reporter handed to request handlers.
///
/// Reporting is a no-op when the caller did not ask for progress.
#[derive(Clone)]
pub struct ProgressReporter {
    token: Option<ProgressToken>,
    tracker: Arc<ProgressTracker>,
    sink: Arc<dyn NotificationSink>,
}

impl ProgressReporter {
    pub fn new(
        token: Option<ProgressToken>,
        tracker: Arc<ProgressTracker>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            token,
            tracker,
            sink,
        }
    }

    pub fn token(&self) -> Option<&ProgressToken> {
        self.token.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Send a progress update.
    ///
    /// Fails with invalid-params if the update does not move forward and
    /// with rate-limited if the token is sending too quickly.
    pub async fn report(&self, progress: f64, total: Option<f64>, message: Option<&str>) -> Result<()> {
        let Some(token) = &self.token else {
            return Ok(());
        };
        let note = ProgressNotification::new(
            token.clone(),
            progress,
            total,
            message.map(String::from),
        )?;
        let notification = self.tracker.prepare(&note)?;
        self.sink.send_notification(notification).await
    }

    /// Report a percentage of 100.
    pub async fn report_percent(&self, percent: f64, message: Option<&str>) -> Result<()> {
        self.report(percent, Some(100.0), message).await
    }

    /// Emit the automatic 0% notification.
    pub(crate) async fn start(&self) {
        let Some(token) = &self.token else {
            return;
        };
        let note = match ProgressNotification::new(
            token.clone(),
            0.0,
            Some(1.0),
            Some(STARTED_MESSAGE.to_string()),
        ) {
            Ok(note) => note,
            Err(e) => {
                warn!("Could not build start notification: {}", e);
                return;
            }
        };
        self.emit_unthrottled(&note).await;
    }

    /// Emit the automatic completion notification unless one was already reported.
    pub(crate) async fn finish(&self) {
        let Some(token) = &self.token else {
            return;
        };
        if let Some(note) = self.tracker.completion(token) {
            self.emit_unthrottled(&note).await;
        }
    }

    async fn emit_unthrottled(&self, note: &ProgressNotification) {
        match self.tracker.prepare_unthrottled(note) {
            Ok(notification) => {
                if let Err(e) = self.sink.send_notification(notification).await {
                    debug!("Failed to send progress for {}: {}", note.token, e);
                }
            }
            Err(e) => debug!("Progress update rejected for {}: {}", note.token, e),
        }
    }
}
