//! HTTP access to the SUT
//!
//! `request` is the single wire operation; everything else builds on it.
//! Responses are fully buffered so status, headers and body can be read any
//! number of times after a decode.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use arbor_common::NodeType;

use crate::error::{E2eError, E2eResult};
use crate::harness::Harness;
use crate::json::JsonExt;
use crate::results;

/// Bytes of body quoted in status-mismatch failures
pub const BODY_SNIPPET_LIMIT: usize = 500;

/// A buffered HTTP response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn status(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> E2eResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn value(&self) -> E2eResult<Value> {
        self.json()
    }

    /// Status and body as stored in the results log. Non-JSON bodies are
    /// kept as a snippet.
    pub fn to_record(&self) -> Value {
        let body = serde_json::from_slice::<Value>(&self.body)
            .unwrap_or_else(|_| Value::String(self.snippet(BODY_SNIPPET_LIMIT)));
        json!({ "status": self.status(), "body": body })
    }

    /// First `limit` bytes of the body, lossily decoded.
    pub fn snippet(&self, limit: usize) -> String {
        let end = self.body.len().min(limit);
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }
}

/// Fail unless the response has the expected status.
pub fn require_status(resp: &ApiResponse, expected: u16) -> E2eResult<()> {
    if resp.status() == expected {
        return Ok(());
    }
    Err(E2eError::UnexpectedStatus {
        method: resp.method.to_string(),
        path: resp.path.clone(),
        expected,
        actual: resp.status(),
        body: resp.snippet(BODY_SNIPPET_LIMIT),
    })
}

/// Authenticated session returned by register/login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: String,
}

impl Harness {
    /// Send one request. Transport errors are returned; any status is Ok.
    pub fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> E2eResult<ApiResponse> {
        let url = format!("{}{}", self.base_url(), path);
        let mut builder = self.client.request(method.clone(), &url);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send()?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let raw = resp.bytes()?;
        debug!("{} {} -> {}", method, path, status);

        let resp = ApiResponse {
            method,
            path: path.to_string(),
            status,
            headers,
            body: raw,
        };
        // Tokens stay out of the log.
        results::note_exchange(
            json!({ "method": resp.method.as_str(), "path": path, "body": body }),
            resp.to_record(),
        );
        Ok(resp)
    }

    /// Send a request and decode the JSON body into `T`.
    pub fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> E2eResult<(ApiResponse, T)> {
        let resp = self.request(method, path, body, token)?;
        let decoded = resp.json()?;
        Ok((resp, decoded))
    }

    /// Send a request and hand back the undecoded body.
    pub fn raw_body(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> E2eResult<(ApiResponse, Bytes)> {
        let resp = self.request(method, path, body, token)?;
        let raw = resp.body.clone();
        Ok((resp, raw))
    }

    pub fn get(&self, path: &str, token: Option<&str>) -> E2eResult<ApiResponse> {
        self.request(Method::GET, path, None, token)
    }

    pub fn post(&self, path: &str, body: &Value, token: Option<&str>) -> E2eResult<ApiResponse> {
        self.request(Method::POST, path, Some(body), token)
    }

    pub fn delete(&self, path: &str, token: Option<&str>) -> E2eResult<ApiResponse> {
        self.request(Method::DELETE, path, None, token)
    }

    // ========================================================================
    // Convenience operations
    // ========================================================================

    pub fn register(&self, handle: &str, password: &str) -> E2eResult<Session> {
        let resp = self.post(
            "/api/register",
            &json!({ "handle": handle, "password": password }),
            None,
        )?;
        require_status(&resp, 201)?;
        session_from(&resp.value()?)
    }

    pub fn login(&self, handle: &str, password: &str) -> E2eResult<Session> {
        let resp = self.post(
            "/api/login",
            &json!({ "handle": handle, "password": password }),
            None,
        )?;
        require_status(&resp, 200)?;
        session_from(&resp.value()?)
    }

    /// `GET /api/me` for the token's owner
    pub fn me(&self, token: &str) -> E2eResult<Value> {
        let resp = self.get("/api/me", Some(token))?;
        require_status(&resp, 200)?;
        resp.value()
    }

    /// Post a root question and return its node id.
    pub fn ask_question(&self, token: &str, body: &str, tags: &[&str]) -> E2eResult<String> {
        let resp = self.post("/api/ask", &json!({ "body": body, "tags": tags }), Some(token))?;
        require_status(&resp, 201)?;
        Ok(resp.value()?.require_str("id")?.to_string())
    }

    /// Answer `parent_id` and return the child's node id.
    pub fn answer_node(
        &self,
        token: &str,
        parent_id: &str,
        body: &str,
        node_type: NodeType,
    ) -> E2eResult<String> {
        let resp = self.post(
            "/api/answer",
            &json!({ "parent_id": parent_id, "body": body, "type": node_type.as_str() }),
            Some(token),
        )?;
        require_status(&resp, 201)?;
        Ok(resp.value()?.require_str("id")?.to_string())
    }

    /// Unauthenticated node fetch
    pub fn get_node(&self, node_id: &str) -> E2eResult<Value> {
        let resp = self.get(&format!("/api/node/{}", node_id), None)?;
        require_status(&resp, 200)?;
        resp.value()
    }

    pub fn delete_node(&self, token: &str, node_id: &str) -> E2eResult<ApiResponse> {
        self.delete(&format!("/api/node/{}", node_id), Some(token))
    }

    /// Clone a node and return the clone's id.
    pub fn clone_node(&self, token: &str, node_id: &str) -> E2eResult<String> {
        let resp = self.request(
            Method::POST,
            &format!("/api/node/{}/clone", node_id),
            None,
            Some(token),
        )?;
        require_status(&resp, 201)?;
        Ok(resp.value()?.require_str("id")?.to_string())
    }

    pub fn list_questions(&self, token: Option<&str>) -> E2eResult<Vec<Value>> {
        let resp = self.get("/api/questions", token)?;
        require_status(&resp, 200)?;
        Ok(resp.value()?.require_array("questions")?.clone())
    }

    pub fn get_tree(&self, node_id: &str, depth: u32) -> E2eResult<Value> {
        let resp = self.get(&format!("/api/tree/{}?depth={}", node_id, depth), None)?;
        require_status(&resp, 200)?;
        resp.value()
    }
}

fn session_from(body: &Value) -> E2eResult<Session> {
    let token = body.require_str("token")?.to_string();
    let user_id = body.require_str("user.id")?.to_string();
    if token.is_empty() || user_id.is_empty() {
        return Err(E2eError::assertion("session with empty token or user id"));
    }
    Ok(Session { token, user_id })
}
