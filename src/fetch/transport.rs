//! HTTP transport for the object endpoints.
//!
//! The server speaks three media types on its object endpoints; the client
//! dispatches on the response `Content-Type`, never on what it asked for:
//!
//! | media type | meaning |
//! |---|---|
//! | `application/x-git-loose-object` | body is one loose object |
//! | `application/x-git-packfile` | body is a packfile |
//! | `application/x-gitvfs-batched-loose-objects` | framed (id, body) records |
//!
//! A single-object request may come back loose or packed; a multi-object
//! request may come back packed or batched. `Accept` advertises the batched
//! media type when the caller prefers it.
//!
//! `HttpObjectTransport` performs one attempt per call and classifies every
//! failure; `RetryingObjectClient` layers the bounded-retry policy on top
//! and re-requests only what is still missing.

use std::io::Read;
use std::sync::Arc;

use reqwest::blocking as reqw;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::Serialize;

use crate::object_id::OidBytes;
use crate::retry::{self, AttemptError, Invocation, RetryObserver};

use super::errors::TransportError;

/// Media type for a single loose object body.
pub const MEDIA_TYPE_LOOSE: &str = "application/x-git-loose-object";
/// Media type for a packfile body.
pub const MEDIA_TYPE_PACK: &str = "application/x-git-packfile";
/// Media type for a framed batched-loose-objects body.
pub const MEDIA_TYPE_BATCHED: &str = "application/x-gitvfs-batched-loose-objects";

/// Response body discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectContentType {
    /// One loose object.
    LooseObject,
    /// A packfile.
    PackFile,
    /// Framed loose objects.
    BatchedLooseObjects,
}

impl ObjectContentType {
    /// Maps a `Content-Type` header value to a discriminator.
    ///
    /// Parameters after `;` are ignored.
    #[must_use]
    pub fn from_media_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or(value).trim();
        match essence {
            MEDIA_TYPE_LOOSE => Some(Self::LooseObject),
            MEDIA_TYPE_PACK => Some(Self::PackFile),
            MEDIA_TYPE_BATCHED => Some(Self::BatchedLooseObjects),
            _ => None,
        }
    }

    /// The media type string for this discriminator.
    #[must_use]
    pub fn as_media_type(self) -> &'static str {
        match self {
            Self::LooseObject => MEDIA_TYPE_LOOSE,
            Self::PackFile => MEDIA_TYPE_PACK,
            Self::BatchedLooseObjects => MEDIA_TYPE_BATCHED,
        }
    }
}

/// A successfully opened object response, body unconsumed.
pub struct ObjectResponse {
    /// Dispatch discriminator from the response header.
    pub content_type: ObjectContentType,
    /// Streaming body. Reading it counts toward `bytes_downloaded`.
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for ObjectResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectResponse")
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// One advertised ref from `info/refs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefEntry {
    /// Tip object id.
    pub oid: OidBytes,
    /// Full ref name, e.g. `refs/heads/main`.
    pub name: String,
}

/// One-attempt transport to the object endpoints.
///
/// Implementations classify failures through `TransportError`; retry policy
/// lives in `RetryingObjectClient`.
pub trait ObjectTransport: Send + Sync {
    /// Requests a single object by id.
    fn get_loose(&self, oid: &OidBytes) -> Result<ObjectResponse, TransportError>;

    /// Requests a set of objects, optionally preferring a batched response.
    ///
    /// `commit_depth` asks the server to include ancestors of requested
    /// commits up to that depth.
    fn post_objects(
        &self,
        oids: &[OidBytes],
        commit_depth: u32,
        prefer_batched: bool,
    ) -> Result<ObjectResponse, TransportError>;

    /// Fetches the ref advertisement.
    fn get_refs(&self) -> Result<Vec<RefEntry>, TransportError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectsRequestBody<'a> {
    commit_depth: u32,
    object_ids: Vec<&'a str>,
}

/// Blocking HTTP implementation of `ObjectTransport`.
pub struct HttpObjectTransport {
    client: reqw::Client,
    base: reqwest::Url,
}

impl HttpObjectTransport {
    /// Creates a transport for endpoints under `base` with a default client.
    pub fn new(base: reqwest::Url) -> Self {
        Self::with_client(base, reqw::Client::new())
    }

    /// Creates a transport with a caller-configured client (auth headers,
    /// proxies, timeouts).
    pub fn with_client(base: reqwest::Url, client: reqw::Client) -> Self {
        Self { client, base }
    }

    fn endpoint(&self, path: &str) -> Result<reqwest::Url, TransportError> {
        self.base.join(path).map_err(|err| TransportError::Url {
            detail: err.to_string(),
        })
    }

    fn into_object_response(
        response: reqw::Response,
    ) -> Result<ObjectResponse, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
            });
        }
        let header = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(TransportError::MissingContentType)?;
        let content_type = ObjectContentType::from_media_type(&header).ok_or(
            TransportError::UnexpectedContentType {
                content_type: header,
            },
        )?;
        Ok(ObjectResponse {
            content_type,
            body: Box::new(response),
        })
    }
}

impl ObjectTransport for HttpObjectTransport {
    fn get_loose(&self, oid: &OidBytes) -> Result<ObjectResponse, TransportError> {
        let url = self.endpoint(&format!("gvfs/objects/{}", oid.to_hex()))?;
        let response = self.client.get(url).send()?;
        Self::into_object_response(response)
    }

    fn post_objects(
        &self,
        oids: &[OidBytes],
        commit_depth: u32,
        prefer_batched: bool,
    ) -> Result<ObjectResponse, TransportError> {
        let url = self.endpoint("gvfs/objects")?;
        let hex: Vec<String> = oids.iter().map(OidBytes::to_hex).collect();
        let body = ObjectsRequestBody {
            commit_depth,
            object_ids: hex.iter().map(String::as_str).collect(),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|err| TransportError::Io(std::io::Error::other(err)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let accept = if prefer_batched {
            // Batched first so a capable server picks it; pack is the
            // universally supported fallback.
            format!("{MEDIA_TYPE_BATCHED}, {MEDIA_TYPE_PACK}")
        } else {
            String::from(MEDIA_TYPE_PACK)
        };
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&accept).unwrap_or(HeaderValue::from_static(MEDIA_TYPE_PACK)),
        );

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(payload)
            .send()?;
        Self::into_object_response(response)
    }

    fn get_refs(&self) -> Result<Vec<RefEntry>, TransportError> {
        let url = self.endpoint("info/refs?service=git-upload-pack")?;
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
            });
        }
        let body = response.bytes()?;
        parse_ref_advertisement(&body)
    }
}

/// Parses a smart-HTTP ref advertisement into ref entries.
///
/// Handles pkt-line framing: 4 hex digits of length (including the prefix),
/// `0000` flush packets, a `# service=` comment line, and NUL-separated
/// capabilities after the first ref.
pub fn parse_ref_advertisement(body: &[u8]) -> Result<Vec<RefEntry>, TransportError> {
    let mut refs = Vec::new();
    let mut pos = 0usize;

    while pos + 4 <= body.len() {
        let len_str = std::str::from_utf8(&body[pos..pos + 4]).map_err(|_| {
            TransportError::RefAdvertisement {
                detail: "pkt length is not ASCII hex",
            }
        })?;
        let pkt_len = usize::from_str_radix(len_str, 16).map_err(|_| {
            TransportError::RefAdvertisement {
                detail: "pkt length is not ASCII hex",
            }
        })?;

        if pkt_len == 0 {
            // Flush packet.
            pos += 4;
            continue;
        }
        if pkt_len < 4 || pos + pkt_len > body.len() {
            return Err(TransportError::RefAdvertisement {
                detail: "pkt length out of bounds",
            });
        }

        let mut line = &body[pos + 4..pos + pkt_len];
        pos += pkt_len;

        if line.ends_with(b"\n") {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() || line.starts_with(b"#") {
            continue;
        }
        // Capabilities ride after NUL on the first ref line.
        let line = line.split(|&b| b == 0).next().unwrap_or(line);

        let text = std::str::from_utf8(line).map_err(|_| TransportError::RefAdvertisement {
            detail: "ref line is not UTF-8",
        })?;
        let (hex, name) =
            text.split_once(' ')
                .ok_or(TransportError::RefAdvertisement {
                    detail: "ref line has no separator",
                })?;
        let oid = OidBytes::from_hex(hex).map_err(|_| TransportError::RefAdvertisement {
            detail: "ref line has a bad object id",
        })?;
        refs.push(RefEntry {
            oid,
            name: name.to_string(),
        });
    }

    Ok(refs)
}

/// Bounded-retry download client over any `ObjectTransport`.
///
/// Each attempt opens a fresh response and hands it to the caller's
/// handler; the handler decides whether the attempt succeeded (for example,
/// a pack that streamed to disk but came out empty is a retryable failure).
pub struct RetryingObjectClient {
    transport: Arc<dyn ObjectTransport>,
    max_attempts: u32,
    backoff_base: f64,
}

impl RetryingObjectClient {
    /// Creates a client with the given retry policy.
    pub fn new(transport: Arc<dyn ObjectTransport>, max_attempts: u32, backoff_base: f64) -> Self {
        Self {
            transport,
            max_attempts,
            backoff_base,
        }
    }

    /// Downloads one object with bounded retries.
    ///
    /// # Errors
    /// Propagates `AttemptError::Fatal` from the handler.
    pub fn try_download_loose_object(
        &self,
        oid: &OidBytes,
        on_response: &mut dyn FnMut(u32, ObjectResponse) -> Result<(), AttemptError>,
        observer: Option<&dyn RetryObserver>,
    ) -> Result<Invocation<()>, AttemptError> {
        retry::invoke(
            |attempt| {
                let response = self
                    .transport
                    .get_loose(oid)
                    .map_err(TransportError::into_attempt_error)?;
                on_response(attempt, response)
            },
            self.max_attempts,
            self.backoff_base,
            observer,
        )
    }

    /// Downloads a set of objects with bounded retries.
    ///
    /// `remaining` is consulted before every attempt so a retry requests
    /// only the ids not yet received; when it comes back empty the download
    /// is already complete and the attempt succeeds without a request.
    ///
    /// # Errors
    /// Propagates `AttemptError::Fatal` from the handler.
    pub fn try_download_objects(
        &self,
        remaining: &mut dyn FnMut() -> Vec<OidBytes>,
        commit_depth: u32,
        prefer_batched: bool,
        on_response: &mut dyn FnMut(u32, ObjectResponse) -> Result<(), AttemptError>,
        observer: Option<&dyn RetryObserver>,
    ) -> Result<Invocation<()>, AttemptError> {
        retry::invoke(
            |attempt| {
                let wanted = remaining();
                if wanted.is_empty() {
                    return Ok(());
                }
                let response = self
                    .transport
                    .post_objects(&wanted, commit_depth, prefer_batched)
                    .map_err(TransportError::into_attempt_error)?;
                on_response(attempt, response)
            },
            self.max_attempts,
            self.backoff_base,
            observer,
        )
    }
}
