//! Asynchronous HTTP client used to talk to node agents.
//!
//! Node agents live on the same trusted network segment as the
//! coordinator, so this is plain HTTP over hyper with an optional shared
//! bearer token.

use anyhow::{bail, format_err, Error};
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Request, Response};
use http::HeaderValue;

#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Body>,
    user_agent: String,
    auth_token: Option<String>,
}

impl HttpClient {
    pub const DEFAULT_USER_AGENT_STRING: &'static str = "remora-coordinator/0.3";

    pub fn new() -> Self {
        Self {
            client: Client::builder().build_http(),
            user_agent: Self::DEFAULT_USER_AGENT_STRING.to_string(),
            auth_token: None,
        }
    }

    pub fn set_auth_token(&mut self, token: Option<String>) {
        self.auth_token = token;
    }

    pub async fn request(&self, mut request: Request<Body>) -> Result<Response<Body>, Error> {
        request
            .headers_mut()
            .insert(hyper::header::USER_AGENT, HeaderValue::from_str(&self.user_agent)?);
        if let Some(ref token) = self.auth_token {
            request.headers_mut().insert(
                hyper::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(self.client.request(request).await?)
    }

    pub async fn post(&self, uri: &str, body: Option<String>) -> Result<Response<Body>, Error> {
        let body = match body {
            Some(body) => Body::from(body),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(body)?;
        self.request(request).await
    }

    pub async fn put(&self, uri: &str, body: Option<String>) -> Result<Response<Body>, Error> {
        let body = match body {
            Some(body) => Body::from(body),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method("PUT")
            .uri(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(body)?;
        self.request(request).await
    }

    pub async fn get(&self, uri: &str) -> Result<Response<Body>, Error> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())?;
        self.request(request).await
    }

    pub async fn delete(&self, uri: &str) -> Result<Response<Body>, Error> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())?;
        self.request(request).await
    }

    /// GET returning the response body, failing on a non-success status.
    pub async fn get_string(&self, uri: &str) -> Result<String, Error> {
        let response = self.get(uri).await?;
        let status = response.status();
        if !status.is_success() {
            bail!("got bad status '{}' from {}", status, uri);
        }
        Self::response_body_string(response).await
    }

    pub async fn response_body_string(response: Response<Body>) -> Result<String, Error> {
        let buf = hyper::body::to_bytes(response).await?;
        String::from_utf8(buf.to_vec())
            .map_err(|err| format_err!("error converting HTTP response data: {}", err))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
