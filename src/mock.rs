//! Canonical in-memory form of an HTTP exchange: `MockRequest`/`MockResponse`,
//! their JSON shapes, their live-HTTP conversions, and the request equality
//! predicate used to decide a replay hit.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use serde::{Deserialize, Serialize};

/// A single captured cookie.
///
/// Field names are `PascalCase` on the wire to match the cassette format;
/// every optional field is omitted entirely (not `null`) when unset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cookie {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(
        rename = "CommentUri",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub comment_uri: Option<String>,
    #[serde(rename = "Discard", default, skip_serializing_if = "is_false")]
    pub discard: bool,
    #[serde(rename = "Expired", default, skip_serializing_if = "is_false")]
    pub expired: bool,
    #[serde(rename = "Expires", default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(rename = "Path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "Port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(rename = "Secure", default, skip_serializing_if = "is_false")]
    pub secure: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Cookie {
    /// Parse the cookies carried by a request's single `Cookie` header,
    /// e.g. `"session=abc; theme=dark"`.
    #[must_use]
    pub fn parse_request_header(value: &str) -> Vec<Self> {
        value
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some(Cookie {
                    name: name.trim().to_string(),
                    value: value.trim().to_string(),
                    domain: String::new(),
                    ..Default::default()
                })
            })
            .collect()
    }

    /// Parse a single `Set-Cookie` response header into a `Cookie`.
    /// Unrecognized attributes are ignored; this is a pragmatic subset
    /// sufficient for round-tripping cookies this proxy itself set.
    #[must_use]
    pub fn parse_set_cookie(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let (name, cookie_value) = parts.next()?.split_once('=')?;

        let mut cookie = Cookie {
            name: name.trim().to_string(),
            value: cookie_value.trim().to_string(),
            ..Default::default()
        };

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
            match key.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = val.to_string(),
                "path" => cookie.path = Some(val.to_string()),
                "expires" => cookie.expires = Some(val.to_string()),
                "secure" => cookie.secure = true,
                _ => {}
            }
        }

        Some(cookie)
    }

    /// Render this cookie as one `name=value` pair for an outbound `Cookie`
    /// header (attributes like `Domain`/`Path` are request-side-only in the
    /// wire protocol and are not re-sent).
    #[must_use]
    pub fn to_header_pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// A canonical HTTP request captured from, or about to be replayed onto, the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MockRequest {
    pub method: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "header_map::opt"
    )]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<Cookie>>,
}

/// A canonical HTTP response captured from, or about to be replayed onto, the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MockResponse {
    pub status_code: u16,
    pub status_description: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "response_content"
    )]
    pub content: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "header_map::opt"
    )]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<Cookie>>,
}

/// Header names the recorder must route through a dedicated match arm
/// rather than a blanket free-form header insertion, per the restricted
/// outbound-request header table.
const RESTRICTED_REQUEST_HEADERS: &[&str] = &[
    "accept",
    "connection",
    "content-length",
    "content-type",
    "date",
    "expect",
    "host",
    "if-modified-since",
    "referer",
    "transfer-encoding",
    "user-agent",
];

/// Header names the listener must route through a dedicated match arm when
/// replaying a `MockResponse` back onto the wire.
const RESTRICTED_RESPONSE_HEADERS: &[&str] =
    &["connection", "content-length", "content-type", "location", "transfer-encoding"];

impl MockRequest {
    /// Canonicalize a live incoming request into a `MockRequest` addressed at
    /// the upstream. `remote_base` is the upstream's original string form
    /// (e.g. `https://api.example.com`); `path_and_query` is the incoming
    /// request's path plus query string, unchanged. `upstream_authority`
    /// (host\[:port\]) rewrites the `Host` header; `upstream_host` (host
    /// only, no port) rewrites each cookie's domain -- the two are distinct
    /// per §4.3.
    #[must_use]
    pub fn from_live(
        method: &str,
        remote_base: &str,
        path_and_query: &str,
        upstream_authority: &str,
        upstream_host: &str,
        headers: &[(String, String)],
        cookies: &[Cookie],
        content: Option<String>,
    ) -> Self {
        let uri = format!("{remote_base}{path_and_query}");

        let mut rewritten = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("host") {
                rewritten.push((name.clone(), upstream_authority.to_string()));
            } else {
                rewritten.push((name.clone(), value.clone()));
            }
        }

        let cookies: Vec<Cookie> = cookies
            .iter()
            .cloned()
            .map(|mut c| {
                c.domain = upstream_host.to_string();
                c
            })
            .collect();

        Self {
            method: method.to_string(),
            uri,
            content,
            headers: if rewritten.is_empty() {
                None
            } else {
                Some(rewritten)
            },
            cookies: if cookies.is_empty() { None } else { Some(cookies) },
        }
    }

    /// Reconstruct the outbound HTTP request used while recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the method or URI cannot be parsed, or the
    /// request cannot be built.
    pub fn to_outbound(&self) -> crate::Result<Request<Full<Bytes>>> {
        let method: hyper::Method = self
            .method
            .parse()
            .map_err(|_| crate::PlayerError::UpstreamFailure(format!("invalid method: {}", self.method)))?;

        let mut builder = Request::builder().method(method).uri(&self.uri);

        if let Some(headers) = &self.headers {
            for (name, value) in headers {
                let lower = name.to_ascii_lowercase();
                if RESTRICTED_REQUEST_HEADERS.contains(&lower.as_str()) {
                    builder = apply_restricted_request_header(builder, &lower, value);
                } else {
                    builder = builder.header(name.as_str(), value.as_str());
                }
            }
        }

        if let Some(cookies) = &self.cookies {
            if !cookies.is_empty() {
                let has_cookie_header = self
                    .headers
                    .as_ref()
                    .is_some_and(|h| h.iter().any(|(n, _)| n.eq_ignore_ascii_case("cookie")));
                if !has_cookie_header {
                    let value = cookies
                        .iter()
                        .map(Cookie::to_header_pair)
                        .collect::<Vec<_>>()
                        .join("; ");
                    builder = builder.header("cookie", value);
                }
            }
        }

        let body = self.content.clone().unwrap_or_default();
        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| crate::PlayerError::UpstreamFailure(format!("failed to build request: {e}")))
    }
}

/// Apply one restricted outbound request header via its dedicated match arm.
///
/// `Content-Length` is intentionally not re-inserted: the body's byte length
/// drives the wire value, the same way a typed `ContentLength` setter would.
/// `Transfer-Encoding: chunked` is recorded as intent only — bodies are
/// buffered end to end, per the non-streaming scope of this proxy.
fn apply_restricted_request_header(
    builder: hyper::http::request::Builder,
    lower_name: &str,
    value: &str,
) -> hyper::http::request::Builder {
    match lower_name {
        "content-length" => builder,
        "connection" => {
            if value.eq_ignore_ascii_case("keep-alive") || value.eq_ignore_ascii_case("close") {
                builder.header("connection", value)
            } else {
                builder.header("connection", value)
            }
        }
        "expect" => {
            let remaining: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|tok| !tok.eq_ignore_ascii_case("100-continue"))
                .filter(|tok| !tok.is_empty())
                .collect();
            if remaining.is_empty() {
                builder
            } else {
                builder.header("expect", remaining.join(", "))
            }
        }
        _ => builder.header(lower_name, value),
    }
}

impl MockResponse {
    /// Canonicalize a live HTTP response into a `MockResponse`.
    #[must_use]
    pub fn from_live(
        status_code: u16,
        status_description: &str,
        headers: &[(String, String)],
        cookies: &[Cookie],
        content: Option<String>,
    ) -> Self {
        Self {
            status_code,
            status_description: status_description.to_string(),
            content,
            headers: if headers.is_empty() {
                None
            } else {
                Some(headers.to_vec())
            },
            cookies: if cookies.is_empty() {
                None
            } else {
                Some(cookies.to_vec())
            },
        }
    }

    /// Rebuild the listener's outbound response from a captured `MockResponse`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status code or response cannot be built.
    pub fn to_outbound(&self) -> crate::Result<Response<Full<Bytes>>> {
        let status = hyper::StatusCode::from_u16(self.status_code)
            .map_err(|_| crate::PlayerError::UpstreamFailure(format!("invalid status code: {}", self.status_code)))?;

        let mut builder = Response::builder().status(status);

        if let Some(headers) = &self.headers {
            for (name, value) in headers {
                let lower = name.to_ascii_lowercase();
                if RESTRICTED_RESPONSE_HEADERS.contains(&lower.as_str()) {
                    builder = apply_restricted_response_header(builder, &lower, value);
                } else {
                    builder = builder.header(name.as_str(), value.as_str());
                }
            }
        }

        let body = self.content.clone().unwrap_or_default();
        let mut response = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| crate::PlayerError::UpstreamFailure(format!("failed to build response: {e}")))?;

        // Replay the literal reason phrase, not just the status code, so a
        // recorded response is byte-comparable to the original on the wire.
        if let Ok(reason) = hyper::ext::ReasonPhrase::from_bytes(self.status_description.as_bytes()) {
            response.extensions_mut().insert(reason);
        }

        Ok(response)
    }
}

fn apply_restricted_response_header(
    builder: hyper::http::response::Builder,
    lower_name: &str,
    value: &str,
) -> hyper::http::response::Builder {
    match lower_name {
        "content-length" => builder,
        _ => builder.header(lower_name, value),
    }
}

/// Compare a live request against a recorded one per the matching predicate.
///
/// `recorded` is the Exchange's captured request; `live` is canonicalized
/// from the request currently being served.
#[must_use]
pub fn requests_match(live: &MockRequest, recorded: &MockRequest) -> bool {
    if live.method != recorded.method {
        return false;
    }
    if live.uri != recorded.uri {
        return false;
    }
    if live.content != recorded.content {
        return false;
    }

    let mut recorded_headers = recorded.headers.clone();
    if live.headers.is_none() {
        if let Some(headers) = &mut recorded_headers {
            headers.retain(|(name, value)| {
                !(name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("keep-alive"))
            });
            if headers.is_empty() {
                recorded_headers = None;
            }
        }
    }

    if !headers_match(live.headers.as_deref(), recorded_headers.as_deref()) {
        return false;
    }

    cookies_match(live.cookies.as_deref(), recorded.cookies.as_deref())
}

fn headers_match(live: Option<&[(String, String)]>, recorded: Option<&[(String, String)]>) -> bool {
    match (live, recorded) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.len() != b.len() {
                return false;
            }
            a.iter().all(|(name, value)| {
                b.iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                    .is_some_and(|(_, v)| v == value)
            })
        }
        _ => false,
    }
}

fn cookies_match(live: Option<&[Cookie]>, recorded: Option<&[Cookie]>) -> bool {
    match (live, recorded) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.len() != b.len() {
                return false;
            }
            a.iter()
                .all(|c| b.iter().any(|r| r.name == c.name && r.value == c.value))
        }
        _ => false,
    }
}

/// Serializes an ordered `Vec<(String, String)>` as a JSON object and back,
/// preserving insertion/document order (request equality depends on header
/// *count* parity via iteration, not on map ordering — see `requests_match`).
mod header_map {
    pub mod opt {
        use serde::de::{MapAccess, Visitor};
        use serde::ser::SerializeMap;
        use serde::{Deserializer, Serializer};
        use std::fmt;

        pub fn serialize<S>(
            headers: &Option<Vec<(String, String)>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let pairs = headers.as_ref().expect("skip_serializing_if guards None");
            let mut map = serializer.serialize_map(Some(pairs.len()))?;
            for (k, v) in pairs {
                map.serialize_entry(k, v)?;
            }
            map.end()
        }

        pub fn deserialize<'de, D>(
            deserializer: D,
        ) -> Result<Option<Vec<(String, String)>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct HeaderVisitor;

            impl<'de> Visitor<'de> for HeaderVisitor {
                type Value = Vec<(String, String)>;

                fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str("a JSON object of header name/value pairs")
                }

                fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
                where
                    A: MapAccess<'de>,
                {
                    let mut v = Vec::with_capacity(map.size_hint().unwrap_or(0));
                    while let Some((k, val)) = map.next_entry::<String, String>()? {
                        v.push((k, val));
                    }
                    Ok(v)
                }
            }

            deserializer.deserialize_map(HeaderVisitor).map(Some)
        }
    }
}

/// Response `content` is embedded as structured JSON when the captured text
/// parses as JSON, otherwise as a JSON string; request `content` is always a
/// plain JSON string (handled directly by `#[serde]` on `MockRequest`).
mod response_content {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(content: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = content.as_ref().expect("skip_serializing_if guards None");
        match serde_json::from_str::<Value>(text) {
            Ok(value) => value.serialize(serializer),
            Err(_) => serializer.serialize_str(text),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let text = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Some(text))
    }
}
