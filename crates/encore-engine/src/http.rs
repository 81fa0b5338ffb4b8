//! JSON-over-HTTP engine gateway.
//!
//! # Endpoints
//!
//! | Call                         | Route                                              |
//! |------------------------------|----------------------------------------------------|
//! | create                       | `POST /rooms`                                      |
//! | join                         | `POST /rooms/{workflow_id}/runs/{run_id}/join`     |
//! | leave                        | `POST /rooms/{workflow_id}/runs/{run_id}/leave`    |
//! | terminate                    | `POST /rooms/{workflow_id}/runs/{run_id}/terminate`|
//! | change_emitting_device       | `POST /rooms/{workflow_id}/runs/{run_id}/emitting-device` |
//! | update_position_constraint   | `POST /rooms/{workflow_id}/runs/{run_id}/position-constraint` |
//!
//! Join and leave responses may carry the room's new user count; the
//! gateway turns those (and the join verdict) into [`EngineAck`]s.

use std::time::Duration;

use async_trait::async_trait;
use encore_protocol::{DeviceId, RunId, UserId};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{AckSender, CreateRun, EngineAck, EngineError, EngineGateway, JoinRun, RunRef};

#[derive(Deserialize)]
struct CreateRunResponse {
    run_id: RunId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JoinStatus {
    Joined,
    Rejected,
}

#[derive(Deserialize)]
struct JoinRunResponse {
    status: JoinStatus,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    users_length: Option<u32>,
}

#[derive(Deserialize, Default)]
struct MembershipResponse {
    #[serde(default)]
    users_length: Option<u32>,
}

#[derive(Serialize)]
struct UserRequest {
    user_id: UserId,
}

#[derive(Serialize)]
struct EmittingDeviceRequest {
    user_id: UserId,
    device_id: DeviceId,
}

#[derive(Serialize)]
struct PositionConstraintRequest {
    user_id: UserId,
    fits: bool,
}

/// An [`EngineGateway`] speaking JSON over HTTP.
#[derive(Clone)]
pub struct HttpEngineGateway {
    client: Client,
    base_url: String,
    acks: AckSender,
}

impl HttpEngineGateway {
    /// Builds a gateway rooted at `base_url`. Every request is bounded by
    /// `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        acks: AckSender,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build engine HTTP client");
                EngineError::Request(e.to_string())
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            acks,
        })
    }

    fn run_url(&self, run: RunRef, action: &str) -> String {
        format!(
            "{}/rooms/{}/runs/{}/{action}",
            self.base_url,
            run.workflow_id.as_uuid(),
            run.run_id.as_uuid()
        )
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R, EngineError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Default,
    {
        let response = self.client.post(url).json(body).send().await.map_err(|e| {
            tracing::warn!(error = %e, url, "engine request failed");
            EngineError::from(e)
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::UnknownRun(url.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(%status, url, "engine returned an error status");
            return Err(EngineError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(R::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn ack(&self, ack: EngineAck) {
        if self.acks.send(ack).is_err() {
            tracing::warn!("engine ack receiver dropped");
        }
    }

    fn ack_users_length(&self, run: RunRef, users_length: Option<u32>) {
        if let Some(users_length) = users_length {
            self.ack(EngineAck::UsersLengthUpdated {
                room_id: run.workflow_id,
                users_length,
            });
        }
    }
}

impl std::fmt::Debug for HttpEngineGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEngineGateway")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// `post` needs a Default response for empty bodies.
impl Default for CreateRunResponse {
    fn default() -> Self {
        Self {
            run_id: RunId(uuid::Uuid::nil()),
        }
    }
}

impl Default for JoinRunResponse {
    fn default() -> Self {
        Self {
            status: JoinStatus::Joined,
            reason: None,
            users_length: None,
        }
    }
}

#[async_trait]
impl EngineGateway for HttpEngineGateway {
    async fn create(&self, request: CreateRun) -> Result<RunId, EngineError> {
        let url = format!("{}/rooms", self.base_url);
        let room_id = request.room_id;
        let response: CreateRunResponse = self.post(&url, &request).await?;
        if response.run_id.as_uuid().is_nil() {
            return Err(EngineError::Decode("create response has no run_id".into()));
        }
        tracing::debug!(%room_id, run_id = %response.run_id, "engine run created");
        self.ack(EngineAck::Created { room_id });
        Ok(response.run_id)
    }

    async fn join(&self, run: RunRef, request: JoinRun) -> Result<(), EngineError> {
        let response: JoinRunResponse = self.post(&self.run_url(run, "join"), &request).await?;
        match response.status {
            JoinStatus::Joined => self.ack(EngineAck::Joined {
                room_id: run.workflow_id,
                user_id: request.user_id,
                device_id: request.device_id,
            }),
            JoinStatus::Rejected => self.ack(EngineAck::JoinRejected {
                room_id: run.workflow_id,
                user_id: request.user_id,
                reason: response
                    .reason
                    .unwrap_or_else(|| "rejected by engine".to_string()),
            }),
        }
        self.ack_users_length(run, response.users_length);
        Ok(())
    }

    async fn leave(&self, run: RunRef, user: UserId) -> Result<(), EngineError> {
        let response: MembershipResponse = self
            .post(&self.run_url(run, "leave"), &UserRequest { user_id: user })
            .await?;
        self.ack_users_length(run, response.users_length);
        Ok(())
    }

    async fn terminate(&self, run: RunRef) -> Result<(), EngineError> {
        let _: MembershipResponse = self
            .post(&self.run_url(run, "terminate"), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn change_emitting_device(
        &self,
        run: RunRef,
        user: UserId,
        device: DeviceId,
    ) -> Result<(), EngineError> {
        let _: MembershipResponse = self
            .post(
                &self.run_url(run, "emitting-device"),
                &EmittingDeviceRequest {
                    user_id: user,
                    device_id: device,
                },
            )
            .await?;
        Ok(())
    }

    async fn update_position_constraint(
        &self,
        run: RunRef,
        user: UserId,
        fits: bool,
    ) -> Result<(), EngineError> {
        let _: MembershipResponse = self
            .post(
                &self.run_url(run, "position-constraint"),
                &PositionConstraintRequest {
                    user_id: user,
                    fits,
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_protocol::RoomId;
    use uuid::Uuid;

    #[test]
    fn test_run_url_format() {
        let (tx, _rx) = crate::ack_channel();
        let gateway =
            HttpEngineGateway::new("http://engine:8080/", Duration::from_secs(1), tx).unwrap();
        let run = RunRef::new(RoomId(Uuid::nil()), RunId(Uuid::nil()));
        assert_eq!(
            gateway.run_url(run, "join"),
            "http://engine:8080/rooms/00000000-0000-0000-0000-000000000000/runs/\
             00000000-0000-0000-0000-000000000000/join"
        );
    }

    #[test]
    fn test_join_response_parses_rejection() {
        let json = r#"{"status":"rejected","reason":"room is full"}"#;
        let response: JoinRunResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.status, JoinStatus::Rejected);
        assert_eq!(response.reason.as_deref(), Some("room is full"));
        assert_eq!(response.users_length, None);
    }
}
