//! HTTP implementations of the collaborator channels.
//!
//! Each channel POSTs JSON to a configured endpoint with optional bearer
//! auth. Endpoint shape is deliberately simple — a small sidecar or
//! serverless function fronts whatever drafting model, chat workspace, or
//! mail provider a deployment uses.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    ChannelError, DraftRequest, DraftResponse, DraftingChannel, MailChannel,
    NotificationChannel, NotifyRequest, OutboundMail,
};

/// Per-request timeout for all channel calls.
const CHANNEL_TIMEOUT_SECS: u64 = 30;

fn build_client() -> Result<reqwest::Client, ChannelError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(CHANNEL_TIMEOUT_SECS))
        .build()
        .map_err(|e| ChannelError::Transport(e.to_string()))
}

async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    token: &Option<String>,
    request: &Req,
) -> Result<Resp, ChannelError> {
    let mut builder = client.post(url).json(request);
    if let Some(token) = token {
        builder = builder.bearer_auth(token);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ChannelError::Status(status.as_u16()));
    }

    response
        .json::<Resp>()
        .await
        .map_err(|e| ChannelError::Decode(e.to_string()))
}

/// Drafting service client.
pub struct HttpDrafting {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpDrafting {
    pub fn new(url: String, token: Option<String>) -> Result<Self, ChannelError> {
        Ok(Self {
            client: build_client()?,
            url,
            token,
        })
    }
}

#[async_trait]
impl DraftingChannel for HttpDrafting {
    async fn draft(&self, request: &DraftRequest) -> Result<DraftResponse, ChannelError> {
        post_json(&self.client, &self.url, &self.token, request).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotifyResponse {
    message_handle: String,
}

/// Notification channel client (chat workspace webhook or similar).
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpNotifier {
    pub fn new(url: String, token: Option<String>) -> Result<Self, ChannelError> {
        Ok(Self {
            client: build_client()?,
            url,
            token,
        })
    }
}

#[async_trait]
impl NotificationChannel for HttpNotifier {
    async fn notify(&self, request: &NotifyRequest) -> Result<String, ChannelError> {
        let response: NotifyResponse =
            post_json(&self.client, &self.url, &self.token, request).await?;
        Ok(response.message_handle)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailResponse {
    delivery_id: String,
}

/// Outbound mail client (transactional mail API).
pub struct HttpMail {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpMail {
    pub fn new(url: String, token: Option<String>) -> Result<Self, ChannelError> {
        Ok(Self {
            client: build_client()?,
            url,
            token,
        })
    }
}

#[async_trait]
impl MailChannel for HttpMail {
    async fn send(&self, mail: &OutboundMail) -> Result<String, ChannelError> {
        let response: MailResponse = post_json(&self.client, &self.url, &self.token, mail).await?;
        Ok(response.delivery_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_construct_with_timeout() {
        assert!(HttpDrafting::new("http://localhost/draft".to_string(), None).is_ok());
        assert!(HttpNotifier::new("http://localhost/notify".to_string(), Some("tok".into())).is_ok());
        assert!(HttpMail::new("http://localhost/mail".to_string(), None).is_ok());
    }
}
