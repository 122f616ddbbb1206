//! Pushes flushed buffers to a remote log aggregator over HTTP
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, RequestBuilder, Url,
};
use tracing::debug;

use super::Uploader;
use crate::{
    error::{SinkError, UploadError},
    settings::AggregatorSettings,
};

const SOURCE_HEADER: &str = "x-log-source";
/// Longest response body kept in upload errors
const MAX_ERROR_BODY: usize = 512;

pub struct AggregatorUploader {
    client: Client,
    url: Url,
    headers: HeaderMap,
}

impl AggregatorUploader {
    pub fn new(settings: &AggregatorSettings) -> Result<Self, SinkError> {
        let url = Url::parse(&settings.url)
            .map_err(|e| SinkError::Configuration(format!("aggregator url {}: {e}", settings.url)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(settings.format.unwrap_or_default().content_type()),
        );
        if let Some(token) = &settings.token {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        }
        let mappings = [
            ("x-timestamp-field", &settings.timestamp_field),
            ("x-message-field", &settings.message_field),
            ("x-level-field", &settings.level_field),
        ];
        for (name, field) in mappings {
            if let Some(field) = field {
                headers.insert(HeaderName::from_static(name), header_value(field)?);
            }
        }
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SinkError::Configuration(format!("header name {name}: {e}")))?;
            headers.insert(name, header_value(value)?);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds.unwrap_or(30)))
            .build()
            .map_err(|e| SinkError::Configuration(format!("creating http client: {e}")))?;

        Ok(AggregatorUploader {
            client,
            url,
            headers,
        })
    }

    fn request(&self, topic: &str, content: Vec<u8>) -> Result<RequestBuilder, UploadError> {
        let source = HeaderValue::from_str(topic).map_err(|_| UploadError::Rejected {
            status: 0,
            body: format!("topic {topic} is not a valid header value"),
        })?;
        Ok(self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(SOURCE_HEADER, source)
            .body(content))
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SinkError> {
    HeaderValue::from_str(value)
        .map_err(|e| SinkError::Configuration(format!("header value: {e}")))
}

#[async_trait]
impl Uploader for AggregatorUploader {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    async fn upload(&self, topic: &str, content: Vec<u8>) -> Result<(), UploadError> {
        let bytes = content.len();
        let response = self.request(topic, content)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(topic, bytes, status = status.as_u16(), "pushed to aggregator");
        Ok(())
    }
}
