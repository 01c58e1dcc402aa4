use http::StatusCode;
use reqwest::Client;
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, KasaError};

/// A boxed stream of raw body chunks from a streamed response.
pub type ByteStream = std::pin::Pin<
    Box<dyn futures_util::stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let inner = Client::builder()
            .connect_timeout(std::time::Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| KasaError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "kasa-client/0.1".to_string(),
        })
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let req = self.inner.post(url).json(body);
        self.send_json(req, headers).await
    }

    pub async fn patch_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let req = self.inner.patch(url).json(body);
        self.send_json(req, headers).await
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let req = self.inner.get(url);
        self.send_json(req, headers).await
    }

    async fn send_json<R: DeserializeOwned>(
        &self,
        mut req: reqwest::RequestBuilder,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        req = req.header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let resp = req.send().await.map_err(|e| KasaError::StoreError {
            code: "network".into(),
            message: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_store_error(status, &text));
        }
        resp.json::<R>().await.map_err(|e| KasaError::StoreError {
            code: status.as_u16().to_string(),
            message: format!("json decode error: {e}"),
        })
    }

    /// POST JSON and hand back the raw byte stream of the response body.
    /// Errors at this stage mean the stream never started.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<ByteStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req
            .send()
            .await
            .map_err(|_| KasaError::ConnectionFailed { status: None })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = %truncate(&body, 300), "stream request rejected");
            return Err(KasaError::ConnectionFailed {
                status: Some(status.as_u16()),
            });
        }
        Ok(Box::pin(resp.bytes_stream()))
    }
}

fn map_store_error(status: StatusCode, body: &str) -> KasaError {
    KasaError::StoreError {
        code: status.as_u16().to_string(),
        message: truncate(body, 300),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
