// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CGI-style variable population and header mapping.
//!
//! Translates the FastCGI params mapping and stdin payload into the
//! engine's `$_SERVER` / `$_GET` / `$_POST` / `$_COOKIE` / `$_REQUEST`
//! globals, and translates the engine's response header store back into
//! CGI response header format.

use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

/// A form value: repeated keys become an ordered list, single-occurrence
/// keys stay scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    /// Single occurrence
    Scalar(String),
    /// Repeated key, values in arrival order
    List(Vec<String>),
}

impl FormValue {
    fn push(&mut self, value: String) {
        match self {
            FormValue::Scalar(first) => {
                *self = FormValue::List(vec![std::mem::take(first), value]);
            }
            FormValue::List(values) => values.push(value),
        }
    }

    /// The scalar value, or the last value of a list.
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FormValue::Scalar(v) => Some(v),
            FormValue::List(values) => values.last().map(String::as_str),
        }
    }
}

/// The CGI-like globals handed to the engine execution context.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    /// `$_SERVER`: every entry of the FastCGI params mapping
    pub server: HashMap<String, String>,
    /// `$_GET`: parsed from `QUERY_STRING`
    pub get: HashMap<String, FormValue>,
    /// `$_POST`: parsed from stdin for url-encoded form submissions
    pub post: HashMap<String, FormValue>,
    /// `$_COOKIE`: parsed from `HTTP_COOKIE`
    pub cookie: HashMap<String, String>,
    /// `$_REQUEST`: `$_GET` then `$_POST`, POST winning on collision
    pub request: HashMap<String, FormValue>,
    /// `$_FILES`: empty (multipart handling lives above the core)
    pub files: HashMap<String, String>,
    /// `$_ENV`: pre-registered process-wide variables
    pub env: HashMap<String, String>,
}

/// Builds the globals for one request.
///
/// `process_env` holds pre-registered process-wide variables copied into
/// every execution context. `request_time` stamps `REQUEST_TIME` /
/// `REQUEST_TIME_FLOAT` when the web server did not provide them.
pub fn build_globals(
    params: &HashMap<String, String>, stdin: &[u8], process_env: &HashMap<String, String>,
    request_time: SystemTime,
) -> Globals {
    let mut server = params.clone();
    if let Ok(elapsed) = request_time.duration_since(UNIX_EPOCH) {
        server
            .entry("REQUEST_TIME".to_owned())
            .or_insert_with(|| elapsed.as_secs().to_string());
        server
            .entry("REQUEST_TIME_FLOAT".to_owned())
            .or_insert_with(|| format!("{:.6}", elapsed.as_secs_f64()));
    }

    let get = params
        .get("QUERY_STRING")
        .map(|qs| parse_form_urlencoded(qs.as_bytes()))
        .unwrap_or_default();

    let post = if is_form_post(params) {
        parse_form_urlencoded(stdin)
    } else {
        HashMap::new()
    };

    let cookie = params
        .get("HTTP_COOKIE")
        .map(|raw| parse_cookies(raw))
        .unwrap_or_default();

    // $_REQUEST: GET first, POST overwrites on key collision.
    let mut request = get.clone();
    for (key, value) in &post {
        request.insert(key.clone(), value.clone());
    }

    Globals {
        server,
        get,
        post,
        cookie,
        request,
        files: HashMap::new(),
        env: process_env.clone(),
    }
}

fn is_form_post(params: &HashMap<String, String>) -> bool {
    let method_ok = matches!(
        params.get("REQUEST_METHOD").map(String::as_str),
        Some("POST" | "PUT" | "PATCH")
    );
    let type_ok = params
        .get("CONTENT_TYPE")
        .is_some_and(|ct| ct.contains("application/x-www-form-urlencoded"));
    method_ok && type_ok
}

/// Parses an `application/x-www-form-urlencoded` payload.
pub fn parse_form_urlencoded(payload: &[u8]) -> HashMap<String, FormValue> {
    let mut form: HashMap<String, FormValue> = HashMap::new();
    for piece in payload.split(|&b| b == b'&') {
        if piece.is_empty() {
            continue;
        }
        let (key, value) = match piece.iter().position(|&b| b == b'=') {
            Some(eq) => (&piece[..eq], &piece[eq + 1..]),
            None => (piece, &[][..]),
        };
        let key = url_decode(key);
        let value = url_decode(value);
        match form.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                form.insert(key, FormValue::Scalar(value));
            }
        }
    }
    form
}

/// Parses `HTTP_COOKIE`: split on `;`, trim, split each on the first `=`,
/// URL-decode the value.
pub fn parse_cookies(raw: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for piece in raw.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match piece.split_once('=') {
            Some((name, value)) => {
                cookies.insert(name.to_owned(), url_decode(value.as_bytes()));
            }
            None => {
                cookies.insert(piece.to_owned(), String::new());
            }
        }
    }
    cookies
}

/// Decodes percent-escapes and `+` as space.
pub fn url_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (
                hex_val(raw.get(i + 1).copied()),
                hex_val(raw.get(i + 2).copied()),
            ) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<u8>) -> Option<u8> {
    match b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Extracts HTTP request headers from the params mapping: every `HTTP_*`
/// param becomes a header with `HTTP_` stripped and underscores changed
/// to hyphens; `CONTENT_TYPE` and `CONTENT_LENGTH` are promoted as-is.
pub fn request_headers(params: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for (name, value) in params {
        if let Some(rest) = name.strip_prefix("HTTP_") {
            headers.push((rest.replace('_', "-"), value.clone()));
        }
    }
    if let Some(value) = params.get("CONTENT_TYPE") {
        headers.push(("Content-Type".to_owned(), value.clone()));
    }
    if let Some(value) = params.get("CONTENT_LENGTH") {
        headers.push(("Content-Length".to_owned(), value.clone()));
    }
    headers
}

/// The engine's HTTP response header store.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    status: Option<u16>,
    headers: Vec<(String, String)>,
}

impl ResponseHeaders {
    /// Sets the HTTP response status.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// The HTTP response status, if one was set.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Appends a header line.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replaces every header of the same name, appending if absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.into()));
    }

    fn has(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Serializes the store to CGI response header format: a `Status:`
    /// line when a status is set, each header line, a default
    /// `Content-Type` when none was produced, then the blank separator.
    pub fn format(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(status) = self.status {
            out.extend_from_slice(
                format!("Status: {} {}\r\n", status, reason_phrase(status)).as_bytes(),
            );
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.has("Content-Type") {
            out.extend_from_slice(b"Content-Type: text/html; charset=UTF-8\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// HTTP reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
