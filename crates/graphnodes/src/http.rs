use async_trait::async_trait;
use graphcore::{Config, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput, Value, ValueExt};
use graphruntime::ExecutorFactory;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Map;

fn method_from(name: &str) -> Result<Method, NodeError> {
    match name.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        _ => Err(NodeError::Configuration(format!("Unsupported method: {}", name))),
    }
}

fn with_headers(mut request: RequestBuilder, config: &Config) -> RequestBuilder {
    if let Some(Value::Object(headers)) = config.get("headers") {
        for (key, value) in headers {
            if let Some(val_str) = value.as_str() {
                request = request.header(key, val_str);
            }
        }
    }
    request
}

/// Body as JSON when it parses, text otherwise
async fn read_body(response: Response) -> Result<Value, NodeError> {
    let text = response
        .text()
        .await
        .map_err(|e| NodeError::execution(format!("Failed to read response: {}", e)))?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Send a request, giving up if the node is cancelled first
///
/// `committed` reports whether a cancelled request may already have had its effect.
async fn send(
    ctx: &NodeContext,
    request: RequestBuilder,
    committed: bool,
) -> Result<Response, NodeError> {
    tokio::select! {
        response = request.send() => response
            .map_err(|e| NodeError::execution(format!("HTTP request failed: {}", e))),
        _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled { committed }),
    }
}

/// HTTP request node
pub struct HttpNode {
    client: reqwest::Client,
}

impl HttpNode {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for HttpNode {
    fn node_type(&self) -> &str {
        NodeKind::Http.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = match ctx.inputs.get("url") {
            Some(Value::String(url)) => url.clone(),
            Some(other) => {
                return Err(NodeError::InvalidInputType {
                    field: "url".to_string(),
                    expected: "string".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
            None => ctx
                .config_str("url")
                .filter(|url| !url.is_empty())
                .ok_or_else(|| NodeError::MissingInput("url".to_string()))?
                .to_string(),
        };
        let method = method_from(ctx.config_str("method").unwrap_or("GET"))?;

        ctx.events.info(format!("{} {}", method, url));

        let mut request = with_headers(self.client.request(method.clone(), &url), &ctx.config);
        if method != Method::GET && method != Method::DELETE {
            match ctx.inputs.get("body") {
                Some(Value::String(text)) => request = request.body(text.clone()),
                Some(Value::Null) | None => {}
                Some(json) => request = request.json(json),
            }
        }

        let response = send(&ctx, request, method != Method::GET).await?;

        let status = response.status().as_u16();
        let headers_map: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();
        let body = read_body(response).await?;

        ctx.events.info(format!("Response status: {}", status));

        Ok(NodeOutput::new()
            .with_output("status", status)
            .with_output("body", body)
            .with_output("headers", Value::Object(headers_map)))
    }
}

pub struct HttpNodeFactory;

impl ExecutorFactory for HttpNodeFactory {
    fn create(&self, config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        if let Some(method) = config.get("method").and_then(Value::as_str) {
            method_from(method)?;
        }
        Ok(Box::new(HttpNode::new()))
    }

    fn node_type(&self) -> &str {
        NodeKind::Http.as_str()
    }
}

/// Delivers the input as a JSON payload to `url`; non-2xx responses fail the node
pub struct WebhookNode {
    client: reqwest::Client,
}

impl WebhookNode {
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeExecutor for WebhookNode {
    fn node_type(&self) -> &str {
        NodeKind::Webhook.as_str()
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let payload = ctx.require_input("input")?;
        let url = ctx
            .config_str("url")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| NodeError::Configuration("webhook needs a 'url'".to_string()))?;
        let method = method_from(ctx.config_str("method").unwrap_or("POST"))?;

        let request = with_headers(self.client.request(method, url), &ctx.config).json(payload);
        let response = send(&ctx, request, true).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::execution(format!(
                "webhook {} returned {}",
                url,
                status.as_u16()
            )));
        }
        ctx.events.info(format!("Delivered to {} ({})", url, status.as_u16()));

        Ok(NodeOutput::new()
            .with_output("output", read_body(response).await?)
            .with_metric("status", status.as_u16()))
    }
}

pub struct WebhookNodeFactory;

impl ExecutorFactory for WebhookNodeFactory {
    fn create(&self, _config: &Config) -> Result<Box<dyn NodeExecutor>, NodeError> {
        Ok(Box::new(WebhookNode::with_client(reqwest::Client::new())))
    }

    fn node_type(&self) -> &str {
        NodeKind::Webhook.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response on a local port and return its base URL
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn http_reads_status_and_json_body() {
        let url = serve_once("200 OK", r#"{"ok":true}"#).await;
        let out = HttpNode::with_client(local_client())
            .execute(NodeContext::detached("h", "http").with_input("url", url))
            .await
            .unwrap();
        assert_eq!(out.outputs["status"], json!(200));
        assert_eq!(out.outputs["body"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn http_without_url_is_missing_input() {
        let err = HttpNode::new()
            .execute(NodeContext::detached("h", "http"))
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::MissingInput("url".to_string()));
    }

    #[test]
    fn unsupported_method_is_rejected_at_creation() {
        let mut config = Config::new();
        config.insert("method".to_string(), json!("BREW"));
        assert!(HttpNodeFactory.create(&config).is_err());
    }

    #[tokio::test]
    async fn webhook_fails_on_error_status() {
        let url = serve_once("500 Internal Server Error", "{}").await;
        let err = WebhookNode::with_client(local_client())
            .execute(
                NodeContext::detached("w", "webhook")
                    .with_input("input", json!({"event": "done"}))
                    .with_config("url", url),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Execution(_)));
    }
}
