//! HTTP client for the toxicity classifier service.
//!
//! Request: `POST {url}` with `{"text": ..., "threshold": ...}`.
//! Response: `{"toxic_labels": [{"label": ..., ...}]}`; a missing array is
//! read as empty. Any status other than 200 is an error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{ToxicLabel, ToxicityClassifier};
use crate::error::{Result, VigilError};

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    text: &'a str,
    threshold: f32,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    toxic_labels: Vec<ToxicLabel>,
}

pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
    threshold: f32,
}

impl HttpClassifier {
    /// Build a client. `timeout` bounds the whole request at the HTTP layer;
    /// the gateway applies its own deadline on top.
    pub fn new(url: impl Into<String>, threshold: f32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VigilError::ClassifierTransport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            threshold,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ToxicityClassifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<ToxicLabel>> {
        let response = self
            .client
            .post(&self.url)
            .json(&CheckRequest {
                text,
                threshold: self.threshold,
            })
            .send()
            .await
            .map_err(|e| VigilError::ClassifierTransport(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(VigilError::ClassifierStatus {
                status: response.status().as_u16(),
            });
        }

        let body: CheckResponse = response
            .json()
            .await
            .map_err(|e| VigilError::ClassifierDecode(e.to_string()))?;
        Ok(body.toxic_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the request body received.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/check", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&request).to_string();
            text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn parses_toxic_labels() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"toxic_labels":[{"label":"insult","score":0.93}]}"#,
        )
        .await;
        let classifier = HttpClassifier::new(url, 0.5, Duration::from_secs(2)).unwrap();
        let labels = classifier.classify("you idiot").await.unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label, "insult");

        let request_body: serde_json::Value =
            serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(request_body["text"], "you idiot");
        approx::assert_abs_diff_eq!(request_body["threshold"].as_f64().unwrap(), 0.5, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn missing_array_means_safe() {
        let (url, _server) = serve_once("HTTP/1.1 200 OK", "{}").await;
        let classifier = HttpClassifier::new(url, 0.5, Duration::from_secs(2)).unwrap();
        assert!(classifier.classify("hello").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let (url, _server) = serve_once("HTTP/1.1 500 Internal Server Error", "{}").await;
        let classifier = HttpClassifier::new(url, 0.5, Duration::from_secs(2)).unwrap();
        let err = classifier.classify("hello").await.unwrap_err();
        assert!(matches!(err, VigilError::ClassifierStatus { status: 500 }));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/check", listener.local_addr().unwrap());
        drop(listener);
        let classifier = HttpClassifier::new(url, 0.5, Duration::from_secs(2)).unwrap();
        let err = classifier.classify("hello").await.unwrap_err();
        assert!(matches!(err, VigilError::ClassifierTransport(_)));
    }
}
