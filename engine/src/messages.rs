//! Request/response protocol between surfaces and the engine.
//!
//! Requests travel over an mpsc channel, each paired with a oneshot reply
//! slot. Every request receives exactly one response, or none when the engine
//! cannot answer; callers bound the wait with a timeout.
//!
//! The message shapes are serde-tagged so they can also be carried over a
//! text transport:
//!
//! ```json
//! {"type": "GET_TIMER_STATE"}
//! {"type": "UPDATE_TIMER_STATE", "state": {"time": 1500, ...}}
//! {"type": "RESET_TIMER"}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

pub use crate::error::RequestError;
use crate::types::TimerState;

/// Default time a caller waits for the engine to answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Capacity of the engine's request queue.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerRequest {
    /// Read the canonical state.
    GetTimerState,

    /// Replace the canonical state.
    UpdateTimerState { state: TimerState },

    /// Stop the timer and rewind the current mode to its full length.
    ResetTimer,
}

/// Acknowledgement of a mutating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub const OK: Ack = Ack { success: true };
    pub const FAILED: Ack = Ack { success: false };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimerResponse {
    // Listed first: a state document never carries `success`.
    Ack(Ack),
    State(TimerState),
}

/// A request waiting for the engine's answer.
#[derive(Debug)]
pub struct PendingRequest {
    request: TimerRequest,
    reply: oneshot::Sender<TimerResponse>,
}

impl PendingRequest {
    pub fn request(&self) -> &TimerRequest {
        &self.request
    }

    /// Sends the response. A caller that gave up waiting is ignored.
    pub fn respond(self, response: TimerResponse) {
        if self.reply.send(response).is_err() {
            trace!("Requester went away before the response");
        }
    }
}

/// Clonable client side of the engine's request channel.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<PendingRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Creates a handle and the receiver the engine serves requests from.
    pub fn channel(timeout: Duration) -> (Self, mpsc::Receiver<PendingRequest>) {
        let (requests, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        (Self { requests, timeout }, rx)
    }

    /// Returns a handle that waits `timeout` for each response.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends a request and waits for its single response.
    ///
    /// # Errors
    ///
    /// - [`RequestError::EngineUnavailable`] if the engine has stopped
    /// - [`RequestError::NoResponse`] if the engine dropped the request
    /// - [`RequestError::Timeout`] if no response arrived in time
    pub async fn request(&self, request: TimerRequest) -> Result<TimerResponse, RequestError> {
        let (reply, response) = oneshot::channel();
        let exchange = async {
            self.requests
                .send(PendingRequest { request, reply })
                .await
                .map_err(|_| RequestError::EngineUnavailable)?;
            response.await.map_err(|_| RequestError::NoResponse)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RequestError::Timeout(self.timeout))?
    }

    pub async fn get_timer_state(&self) -> Result<TimerState, RequestError> {
        match self.request(TimerRequest::GetTimerState).await? {
            TimerResponse::State(state) => Ok(state),
            TimerResponse::Ack(_) => Err(RequestError::UnexpectedResponse),
        }
    }

    pub async fn update_timer_state(&self, state: TimerState) -> Result<Ack, RequestError> {
        self.expect_ack(TimerRequest::UpdateTimerState { state }).await
    }

    pub async fn reset_timer(&self) -> Result<Ack, RequestError> {
        self.expect_ack(TimerRequest::ResetTimer).await
    }

    async fn expect_ack(&self, request: TimerRequest) -> Result<Ack, RequestError> {
        match self.request(request).await? {
            TimerResponse::Ack(ack) => Ok(ack),
            TimerResponse::State(_) => Err(RequestError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_screaming_snake_case_tags() {
        assert_eq!(
            serde_json::to_value(TimerRequest::GetTimerState).unwrap(),
            json!({ "type": "GET_TIMER_STATE" })
        );
        assert_eq!(
            serde_json::to_value(TimerRequest::ResetTimer).unwrap(),
            json!({ "type": "RESET_TIMER" })
        );

        let update: TimerRequest = serde_json::from_value(json!({
            "type": "UPDATE_TIMER_STATE",
            "state": { "time": 10, "isRunning": true }
        }))
        .unwrap();
        assert!(matches!(update, TimerRequest::UpdateTimerState { state } if state.time == 10));
    }

    #[test]
    fn responses_decode_by_shape() {
        let ack: TimerResponse = serde_json::from_value(json!({ "success": true })).unwrap();
        assert_eq!(ack, TimerResponse::Ack(Ack::OK));

        let state: TimerResponse =
            serde_json::from_value(json!({ "time": 5, "mode": "short_break" })).unwrap();
        assert!(matches!(state, TimerResponse::State(s) if s.time == 5));
    }

    #[tokio::test]
    async fn request_gets_its_response() {
        let (handle, mut rx) = EngineHandle::channel(DEFAULT_REQUEST_TIMEOUT);
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                let response = match pending.request() {
                    TimerRequest::GetTimerState => TimerResponse::State(TimerState::default()),
                    _ => TimerResponse::Ack(Ack::OK),
                };
                pending.respond(response);
            }
        });

        assert_eq!(handle.get_timer_state().await.unwrap(), TimerState::default());
        assert_eq!(handle.reset_timer().await.unwrap(), Ack::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_engine_times_out() {
        let (handle, _rx) = EngineHandle::channel(Duration::from_millis(2000));
        let err = handle.get_timer_state().await.unwrap_err();
        assert_eq!(err, RequestError::Timeout(Duration::from_millis(2000)));
    }

    #[tokio::test]
    async fn dropped_request_reports_no_response() {
        let (handle, mut rx) = EngineHandle::channel(DEFAULT_REQUEST_TIMEOUT);
        tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                drop(pending);
            }
        });
        assert_eq!(handle.reset_timer().await.unwrap_err(), RequestError::NoResponse);
    }

    #[tokio::test]
    async fn closed_engine_is_unavailable() {
        let (handle, rx) = EngineHandle::channel(DEFAULT_REQUEST_TIMEOUT);
        drop(rx);
        assert_eq!(
            handle.get_timer_state().await.unwrap_err(),
            RequestError::EngineUnavailable
        );
    }

    #[tokio::test]
    async fn mismatched_response_is_rejected() {
        let (handle, mut rx) = EngineHandle::channel(DEFAULT_REQUEST_TIMEOUT);
        tokio::spawn(async move {
            if let Some(pending) = rx.recv().await {
                pending.respond(TimerResponse::Ack(Ack::OK));
            }
        });
        assert_eq!(
            handle.get_timer_state().await.unwrap_err(),
            RequestError::UnexpectedResponse
        );
    }
}
