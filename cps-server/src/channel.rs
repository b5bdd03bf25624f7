//! Join/part channels backed by Streamr streams.
//!
//! The stream id comes from the community contract's `joinPartStream()`;
//! the channel is only handed out once the Streamr HTTP API confirms the
//! stream exists.

use async_trait::async_trait;
use cps_core::chain::ChainReader;
use cps_core::operator::{ChannelFactory, JoinPartChannel, OperatorError};
use cps_sdk::Address;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub struct StreamChannel {
    stream_id: String,
}

impl JoinPartChannel for StreamChannel {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

pub struct StreamChannelFactory {
    chain: Arc<dyn ChainReader>,
    http_client: reqwest::Client,
    streamr_http_url: Url,
}

impl StreamChannelFactory {
    pub fn new(chain: Arc<dyn ChainReader>, streamr_http_url: Url) -> Self {
        Self {
            chain,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            streamr_http_url,
        }
    }

    fn stream_url(&self, stream_id: &str) -> String {
        format!(
            "{}/streams/{}",
            self.streamr_http_url.as_str().trim_end_matches('/'),
            urlencoding::encode(stream_id)
        )
    }
}

#[async_trait]
impl ChannelFactory for StreamChannelFactory {
    async fn channel_for(&self, community: Address) -> Result<Box<dyn JoinPartChannel>, OperatorError> {
        let stream_id = self.chain.join_part_stream(community).await?;
        let not_found = |reason: String| OperatorError::StreamNotFound {
            community,
            stream_id: stream_id.clone(),
            reason,
        };

        let response = self
            .http_client
            .get(self.stream_url(&stream_id))
            .send()
            .await
            .map_err(|e| not_found(e.to_string()))?;
        if !response.status().is_success() {
            return Err(not_found(response.status().to_string()));
        }

        tracing::info!(
            community = %community,
            stream_id = %stream_id,
            "Found joinPartStream"
        );
        Ok(Box::new(StreamChannel { stream_id }))
    }
}
