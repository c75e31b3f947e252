use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use teamwire_models::media::{MediaKind, MediaParams, TransportDirection};

use crate::engine::{EngineError, MediaEngine, MediaHandle};

#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    pub api_key: String,
    pub api_secret: String,
    pub http_url: String, // http://localhost:7880
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EngineClaims {
    pub exp: u64,
    pub iss: String,
    pub sub: String,
    /// Admin scope; the engine rejects signaling calls without it.
    pub admin: bool,
}

/// Media engine reached over its twirp-style JSON API.
pub struct HttpMediaEngine {
    config: HttpEngineConfig,
    client: reqwest::Client,
}

impl HttpMediaEngine {
    pub fn new(config: HttpEngineConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Generate an admin token for engine API calls.
    fn generate_admin_token(&self) -> Result<String, EngineError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| EngineError::Unavailable(e.to_string()))?
            .as_secs();
        let claims = EngineClaims {
            exp: now + 300,
            iss: self.config.api_key.clone(),
            sub: "teamwire".to_string(),
            admin: true,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.api_secret.as_bytes()),
        )
        .map_err(|e| EngineError::Unavailable(format!("failed to sign admin token: {e}")))
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, EngineError> {
        let admin_token = self.generate_admin_token()?;
        let url = format!(
            "{}/twirp/sfu.Signaling/{}",
            self.config.http_url.trim_end_matches('/'),
            method
        );

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", admin_token))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{method}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            tracing::warn!(method, status = status.as_u16(), "media engine call failed");
            return if status.is_client_error() {
                Err(EngineError::Rejected(format!("{method}: {err}")))
            } else {
                Err(EngineError::Unavailable(format!("{method}: {status} {err}")))
            };
        }

        // Some calls answer with an empty body.
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{method}: {e}")))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Unavailable(format!("{method}: malformed response: {e}")))
    }
}

fn field(body: Value, name: &str) -> Result<MediaParams, EngineError> {
    match body.get(name) {
        Some(v) if v.is_object() => Ok(v.clone()),
        _ => Err(EngineError::Unavailable(format!(
            "engine response is missing '{name}'"
        ))),
    }
}

#[async_trait]
impl MediaEngine for HttpMediaEngine {
    async fn create_transport(
        &self,
        router_id: i64,
        transport_id: i64,
        direction: TransportDirection,
    ) -> Result<MediaParams, EngineError> {
        let body = self
            .call(
                "CreateTransport",
                json!({
                    "router": router_id.to_string(),
                    "transportId": transport_id.to_string(),
                    "direction": direction,
                }),
            )
            .await?;
        field(body, "transport")
    }

    async fn connect_transport(
        &self,
        transport_id: i64,
        dtls_parameters: &MediaParams,
    ) -> Result<(), EngineError> {
        self.call(
            "ConnectTransport",
            json!({
                "transportId": transport_id.to_string(),
                "dtlsParameters": dtls_parameters,
            }),
        )
        .await?;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: i64,
        producer_id: i64,
        kind: MediaKind,
        rtp_parameters: &MediaParams,
        app_data: Option<&MediaParams>,
    ) -> Result<(), EngineError> {
        self.call(
            "Produce",
            json!({
                "transportId": transport_id.to_string(),
                "producerId": producer_id.to_string(),
                "kind": kind,
                "rtpParameters": rtp_parameters,
                "appData": app_data,
            }),
        )
        .await?;
        Ok(())
    }

    async fn consume(
        &self,
        transport_id: i64,
        consumer_id: i64,
        producer_id: i64,
        rtp_capabilities: &MediaParams,
    ) -> Result<MediaParams, EngineError> {
        let body = self
            .call(
                "Consume",
                json!({
                    "transportId": transport_id.to_string(),
                    "consumerId": consumer_id.to_string(),
                    "producerId": producer_id.to_string(),
                    "rtpCapabilities": rtp_capabilities,
                }),
            )
            .await?;
        field(body, "consumer")
    }

    async fn close(&self, handle: MediaHandle) -> Result<(), EngineError> {
        self.call(
            "Close",
            json!({
                "kind": handle.kind(),
                "id": handle.id().to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn release_router(&self, router_id: i64) -> Result<(), EngineError> {
        self.call("DeleteRouter", json!({ "router": router_id.to_string() }))
            .await?;
        Ok(())
    }
}
