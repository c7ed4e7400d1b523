use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Backend, BackendError, Envelope};
use crate::auth::{Credentials, TokenSource};
use crate::config::Config;

/// Client for the Pub/Sub v1 REST API. The local emulator speaks the same protocol.
pub struct RestBackend {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    tokens: TokenSource,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

fn into_envelope(received: ReceivedMessage) -> Result<Envelope> {
    let payload = STANDARD
        .decode(received.message.data.as_bytes())
        .with_context(|| format!("message {} is not base64", received.message.message_id))?;

    Ok(Envelope {
        ack_id: received.ack_id,
        message_id: received.message.message_id,
        payload,
        attributes: received.message.attributes,
        publish_time: received.message.publish_time,
    })
}

impl RestBackend {
    pub fn connect(config: &Config) -> Result<Self> {
        let credentials = Credentials::resolve(config)?;
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        tracing::debug!(
            endpoint = %credentials.endpoint(),
            project = %config.project_id,
            "created pubsub client"
        );

        Ok(Self {
            endpoint: credentials.endpoint(),
            project_id: config.project_id.clone(),
            tokens: TokenSource::new(credentials, http.clone()),
            http,
        })
    }

    pub fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project_id, topic)
    }

    pub fn subscription_path(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.project_id, subscription)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.endpoint, path)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let request = self.http.request(method, self.url(path));
        Ok(match self.tokens.token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let response = self.request(Method::GET, path).await?.send().await?;
        presence(response, path).await
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<Response> {
        let response = self
            .request(Method::POST, path)
            .await?
            .json(&body)
            .send()
            .await?;
        check(response, path).await
    }
}

async fn presence(response: Response, path: &str) -> Result<bool> {
    match response.status() {
        StatusCode::NOT_FOUND => Ok(false),
        _ => check(response, path).await.map(|_| true),
    }
}

async fn check(response: Response, path: &str) -> Result<Response> {
    match response.status() {
        StatusCode::NOT_FOUND => Err(BackendError::NotFound(path.to_owned()).into()),
        StatusCode::CONFLICT => Err(BackendError::AlreadyExists(path.to_owned()).into()),
        status if status.is_success() => Ok(response),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!("{} failed with {}: {}", path, status, body))
        }
    }
}

fn decode_pull(response: PullResponse) -> Result<Vec<Envelope>> {
    response
        .received_messages
        .into_iter()
        .map(into_envelope)
        .collect()
}

#[async_trait::async_trait]
impl Backend for RestBackend {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        self.exists(&self.topic_path(topic)).await
    }

    async fn create_topic(&self, topic: &str) -> Result<()> {
        let path = self.topic_path(topic);
        let response = self
            .request(Method::PUT, &path)
            .await?
            .json(&json!({}))
            .send()
            .await?;
        check(response, &path).await?;
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        self.exists(&self.subscription_path(subscription)).await
    }

    async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<()> {
        let path = self.subscription_path(subscription);
        let response = self
            .request(Method::PUT, &path)
            .await?
            .json(&json!({ "topic": self.topic_path(topic) }))
            .send()
            .await?;
        check(response, &path).await?;
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        let path = self.subscription_path(subscription);
        let response = self.request(Method::DELETE, &path).await?.send().await?;
        check(response, &path).await?;
        Ok(())
    }

    async fn pull(&self, subscription: &str, max_messages: usize) -> Result<Vec<Envelope>> {
        let path = format!("{}:pull", self.subscription_path(subscription));
        let body = serde_json::to_value(PullRequest {
            max_messages: max_messages.max(1),
        })?;
        let response: PullResponse = self.post(&path, body).await?.json().await?;
        decode_pull(response)
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        let path = format!("{}:acknowledge", self.subscription_path(subscription));
        self.post(&path, json!({ "ackIds": [ack_id] })).await?;
        Ok(())
    }

    async fn negative_acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        // A zero deadline hands the message back for immediate redelivery.
        let path = format!("{}:modifyAckDeadline", self.subscription_path(subscription));
        self.post(
            &path,
            json!({ "ackIds": [ack_id], "ackDeadlineSeconds": 0 }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    fn respond(status: u16) -> Response {
        Response::from(
            http::Response::builder()
                .status(status)
                .body("{}")
                .unwrap(),
        )
    }

    fn emulator_backend(project: &str) -> RestBackend {
        let config = Config {
            project_id: project.into(),
            emulator_host: Some("localhost:8538".into()),
            ..Config::default()
        };
        RestBackend::connect(&config).unwrap()
    }

    #[test]
    fn qualify_resource_names_with_project() {
        let backend = emulator_backend("emulator-project-id");

        assert_eq!(
            backend.topic_path("test-topic"),
            "projects/emulator-project-id/topics/test-topic"
        );
        assert_eq!(
            backend.url(&backend.subscription_path("test-subscription")),
            "http://localhost:8538/v1/projects/emulator-project-id/subscriptions/test-subscription"
        );
    }

    #[test_case(200, Some(true) ; "found")]
    #[test_case(404, Some(false) ; "missing")]
    #[test_case(403, None ; "forbidden")]
    #[test_case(500, None ; "server error")]
    #[tokio::test]
    async fn map_existence_check_status(status: u16, expected: Option<bool>) {
        let result = presence(respond(status), "projects/p/topics/t").await;

        assert_eq!(result.ok(), expected);
    }

    #[test_case(404, "NotFound" ; "missing resource")]
    #[test_case(409, "AlreadyExists" ; "conflicting create")]
    #[tokio::test]
    async fn recognize_backend_errors(status: u16, expected: &str) {
        let error = check(respond(status), "projects/p/topics/t").await.unwrap_err();

        let kind = match error.downcast_ref::<BackendError>() {
            Some(BackendError::NotFound(_)) => "NotFound",
            Some(BackendError::AlreadyExists(_)) => "AlreadyExists",
            _ => "other",
        };
        assert_eq!(kind, expected);
    }

    #[test_case(200 ; "ok")]
    #[test_case(204 ; "no content")]
    #[tokio::test]
    async fn accept_success_status(status: u16) {
        assert!(check(respond(status), "projects/p/topics/t").await.is_ok());
    }

    #[tokio::test]
    async fn report_unexpected_status_with_body() {
        let error = check(respond(503), "projects/p/topics/t").await.unwrap_err();

        let message = error.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("projects/p/topics/t"));
    }

    #[test_case(r#"{}"#, 0 ; "empty pull")]
    #[test_case(r#"{"receivedMessages": []}"#, 0 ; "explicitly empty pull")]
    #[test_case(r#"{"receivedMessages": [
        {"ackId": "a1", "message": {"data": "dGVzdA==", "messageId": "1"}},
        {"ackId": "a2", "message": {"data": "dGVzdDI=", "messageId": "2"}}
    ]}"# , 2 ; "two messages")]
    fn count_pulled_envelopes(body: &str, expected: usize) {
        let response: PullResponse = serde_json::from_str(body).unwrap();

        assert_eq!(decode_pull(response).unwrap().len(), expected);
    }

    #[test]
    fn decode_pulled_message() {
        let response: PullResponse = serde_json::from_str(
            r#"{"receivedMessages": [{
                "ackId": "ack-1",
                "message": {
                    "data": "dGVzdA==",
                    "messageId": "42",
                    "attributes": {"origin": "web"},
                    "publishTime": "2021-11-20T10:15:30.123Z"
                }
            }]}"#,
        )
        .unwrap();

        let envelopes = decode_pull(response).unwrap();

        assert_eq!(envelopes[0].ack_id, "ack-1");
        assert_eq!(envelopes[0].message_id, "42");
        assert_eq!(envelopes[0].payload, b"test".to_vec());
        assert_eq!(envelopes[0].attributes["origin"], "web");
        assert_eq!(
            envelopes[0].publish_time.unwrap().to_rfc3339(),
            "2021-11-20T10:15:30.123+00:00"
        );
    }

    #[test]
    fn accept_message_without_data() {
        let response: PullResponse = serde_json::from_str(
            r#"{"receivedMessages": [{"ackId": "a", "message": {"messageId": "7"}}]}"#,
        )
        .unwrap();

        let envelopes = decode_pull(response).unwrap();

        assert!(envelopes[0].payload.is_empty());
    }

    #[test]
    fn reject_corrupt_payload() {
        let response: PullResponse = serde_json::from_str(
            r#"{"receivedMessages": [{"ackId": "a", "message": {"data": "***", "messageId": "7"}}]}"#,
        )
        .unwrap();

        assert!(decode_pull(response).is_err());
    }
}
