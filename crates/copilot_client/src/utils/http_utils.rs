use std::error::Error;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Proxy, Response, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::config::{Config, ProxyAuth};
use crate::masking::mask_authorization;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn apply_proxy_auth(proxy: Proxy, auth: Option<&ProxyAuth>) -> Proxy {
    let Some(auth) = auth else {
        return proxy;
    };
    if auth.username.is_empty() {
        return proxy;
    }
    proxy.basic_auth(&auth.username, &auth.password)
}

/// Headers the Copilot API expects from an editor integration.
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("editor-version", HeaderValue::from_static("vscode/1.99.2"));
    headers.insert(
        "editor-plugin-version",
        HeaderValue::from_static("copilot-chat/0.20.3"),
    );
    headers.insert(
        "user-agent",
        HeaderValue::from_static("GitHubCopilotChat/0.20.3"),
    );
    headers.insert(
        "copilot-integration-id",
        HeaderValue::from_static("vscode-chat"),
    );
    headers.insert("accept", HeaderValue::from_static("application/json"));
    headers
}

/// Base reqwest client: proxies, request timeout and default headers.
///
/// Proxies come only from `config`; the proxy environment variables are
/// already folded into it by `Config::load`.
pub fn build_http_client(config: &Config) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .no_proxy()
        .default_headers(default_headers())
        .timeout(config.request_timeout())
        .connect_timeout(CONNECT_TIMEOUT.min(config.request_timeout()));
    if !config.http_proxy.is_empty() {
        let proxy = Proxy::http(&config.http_proxy)?;
        builder = builder.proxy(apply_proxy_auth(proxy, config.http_proxy_auth.as_ref()));
    }
    if !config.https_proxy.is_empty() {
        let proxy = Proxy::https(&config.https_proxy)?;
        builder = builder.proxy(apply_proxy_auth(proxy, config.https_proxy_auth.as_ref()));
    }
    builder.build()
}

/// Client with transient-failure retries, used for the token exchange.
pub fn build_retry_client(client: Client) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(100), Duration::from_secs(5))
        .build_with_max_retries(3);

    ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

/// Client without retry middleware, for calls whose retries are decided by the caller.
pub fn build_plain_client(client: Client) -> ClientWithMiddleware {
    ClientBuilder::new(client).build()
}

/// Send one request, logging the outcome with credentials masked.
pub async fn execute_request(
    client: &ClientWithMiddleware,
    method: Method,
    url: Url,
    headers: HeaderMap,
    json_body: Option<&serde_json::Value>,
) -> reqwest_middleware::Result<Response> {
    let mut request_builder = client.request(method.clone(), url.clone()).headers(headers.clone());
    if let Some(body) = json_body {
        request_builder = request_builder.json(body);
    }

    info!("Sending {} request to {}", method, url);
    debug!("Request headers: {:?}", masked_headers(&headers));

    let start_time = Instant::now();
    match request_builder.send().await {
        Ok(resp) => {
            info!(
                "Got response from {} after {:?} with status {}",
                url,
                start_time.elapsed(),
                resp.status()
            );
            debug!("Response headers: {:?}", resp.headers());
            Ok(resp)
        }
        Err(e) => {
            error!("Failed HTTP request to {}: {}", url, e);
            if let Some(source) = e.source() {
                error!("Error source: {:?}", source);
            }
            if let reqwest_middleware::Error::Reqwest(inner) = &e {
                if inner.is_timeout() {
                    error!("Request timed out");
                }
                if inner.is_connect() {
                    error!("Connection error");
                }
            }
            Err(e)
        }
    }
}

/// Header list safe to log: the authorization value is masked.
pub fn masked_headers(headers: &HeaderMap) -> Vec<(HeaderName, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = value.to_str().unwrap_or("<binary>");
            let shown = if name == AUTHORIZATION {
                mask_authorization(value)
            } else {
                value.to_string()
            };
            (name.clone(), shown)
        })
        .collect()
}
