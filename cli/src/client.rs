//! Thin HTTP client over the daemon's API.

use anyhow::{bail, Context};
use futures::StreamExt;
use serde_json::Value;
use std::path::Path;

pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn expect_json(response: reqwest::Response) -> anyhow::Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| Value::String("<non-json response>".to_string()));
        if !status.is_success() {
            bail!("{}: {}", status, body);
        }
        Ok(body)
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let response = self
            .authorize(self.client.get(self.url(path)))
            .send()
            .await
            .with_context(|| format!("GET {}", path))?;
        Self::expect_json(response).await
    }

    pub async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let response = self
            .authorize(self.client.post(self.url(path)).json(&body))
            .send()
            .await
            .with_context(|| format!("POST {}", path))?;
        Self::expect_json(response).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        let response = self
            .authorize(self.client.delete(self.url(path)))
            .send()
            .await
            .with_context(|| format!("DELETE {}", path))?;
        Self::expect_json(response).await
    }

    /// Submit an analysis request as multipart form data.
    pub async fn submit(
        &self,
        description: &str,
        device_sn: Option<&str>,
        priority: Option<&str>,
        webhook_url: Option<&str>,
        files: &[impl AsRef<Path>],
    ) -> anyhow::Result<Value> {
        let mut form = reqwest::multipart::Form::new().text("description", description.to_string());
        if let Some(sn) = device_sn {
            form = form.text("device_sn", sn.to_string());
        }
        if let Some(priority) = priority {
            form = form.text("priority", priority.to_string());
        }
        if let Some(url) = webhook_url {
            form = form.text("webhook_url", url.to_string());
        }
        for file in files {
            let path = file.as_ref();
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload.bin".to_string());
            form = form.part(
                "log_files",
                reqwest::multipart::Part::bytes(bytes).file_name(name),
            );
        }

        let response = self
            .authorize(self.client.post(self.url("/analyze")).multipart(form))
            .send()
            .await
            .context("POST /analyze")?;
        Self::expect_json(response).await
    }

    /// Follow a task's SSE stream, invoking `on_event` per JSON event.
    /// Returns when the server closes the stream (terminal state).
    pub async fn watch(
        &self,
        task_id: &str,
        mut on_event: impl FnMut(Value),
    ) -> anyhow::Result<()> {
        let response = self
            .authorize(
                self.client
                    .get(self.url(&format!("/tasks/{}/stream", task_id))),
            )
            .send()
            .await
            .context("GET stream")?;
        if !response.status().is_success() {
            bail!("{}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("stream read")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames end with a blank line.
            while let Some(pos) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..pos + 2).collect();
                for line in frame.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(value) = serde_json::from_str::<Value>(data) {
                            on_event(value);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let client = ApiClient::new("http://localhost:8700/".to_string(), None);
        assert_eq!(client.url("/health"), "http://localhost:8700/health");
    }
}
