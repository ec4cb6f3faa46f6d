use async_trait::async_trait;

use super::{AuthorityChannel, ChannelError, ExchangeReply, ExchangeRequest};

/// `reqwest`-backed channel. Timeouts are enforced by the adapter.
#[derive(Debug, Clone, Default)]
pub struct HttpChannel {
    client: reqwest::Client,
}

impl HttpChannel {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AuthorityChannel for HttpChannel {
    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeReply, ChannelError> {
        let mut builder = self.client.post(&request.url).body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?.to_vec();

        Ok(ExchangeReply {
            status,
            headers,
            body,
        })
    }
}

fn classify(error: reqwest::Error) -> ChannelError {
    if error.is_timeout() {
        ChannelError::Timeout
    } else {
        ChannelError::Network(error.to_string())
    }
}
