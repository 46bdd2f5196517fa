//! OCI Distribution API client.
//!
//! Blocking `reqwest` client speaking the `/v2/` protocol: blob HEAD/GET, chunked
//! uploads (POST, PATCH with `Content-Range`, final PUT with `?digest=`), and manifest
//! HEAD/GET/PUT with `Accept` negotiation. Authentication follows the registry's
//! `WWW-Authenticate` challenge (Bearer token or Basic) using credentials from a
//! [`CredentialResolver`]; tokens are cached per repository scope.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{
    ACCEPT, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE,
};
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use super::{verify_manifest_reference, ArtifactStore};
use crate::config::RegistryConfig;
use crate::credentials::{CredentialResolver, Credentials, Privileges};
use crate::digest::{verify, BlobRef, Digest, HashingWriter};
use crate::error::{CtaError, Result};
use crate::image::media_types::OCTET_STREAM;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

#[derive(Clone)]
enum Authorization {
    Basic(Credentials),
    Bearer(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct RegistryClient {
    host: String,
    base: Url,
    client: Client,
    credentials: Box<dyn CredentialResolver>,
    auth: Mutex<HashMap<String, Authorization>>,
}

impl RegistryClient {
    pub fn new(
        host: &str,
        config: &RegistryConfig,
        credentials: Box<dyn CredentialResolver>,
    ) -> Result<Self> {
        let scheme = if config.is_plain_http(host) {
            "http"
        } else {
            "https"
        };
        let base = Url::parse(&format!("{}://{}/", scheme, host)).map_err(|e| {
            CtaError::InvalidReference {
                reference: host.to_string(),
                reason: e.to_string(),
            }
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("cta/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            host: host.to_string(),
            base,
            client,
            credentials,
            auth: Mutex::new(HashMap::new()),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| CtaError::transport(format!("invalid URL path {}: {}", path, e), false))
    }

    /// Send a request, answering one authentication challenge if the registry asks.
    fn send(
        &self,
        repository: &str,
        privileges: Privileges,
        operation: &str,
        build: &dyn Fn(&Client) -> RequestBuilder,
    ) -> Result<Response> {
        let scope = scope_for(repository, privileges);
        let start = Instant::now();

        let cached = self.auth.lock().get(&scope).cloned();
        let mut response = authorize(build(&self.client), cached.as_ref()).send()?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(challenge) = challenge {
                let auth = self.authenticate(&challenge, &scope, privileges)?;
                self.auth.lock().insert(scope, auth.clone());
                response = authorize(build(&self.client), Some(&auth)).send()?;
            }
        }

        crate::log_remote_operation!(
            operation,
            response.status().as_u16(),
            start.elapsed().as_millis() as u64
        );
        Ok(response)
    }

    fn authenticate(
        &self,
        challenge: &str,
        scope: &str,
        privileges: Privileges,
    ) -> Result<Authorization> {
        let credentials = self.credentials.resolve(&self.host, privileges);
        let (scheme, params) = parse_challenge(challenge)?;

        match scheme.to_ascii_lowercase().as_str() {
            "basic" => credentials
                .map(Authorization::Basic)
                .ok_or_else(|| self.unauthorized()),
            "bearer" => {
                let realm = params.get("realm").ok_or_else(|| {
                    CtaError::transport("bearer challenge without realm", false)
                })?;
                let mut url = Url::parse(realm).map_err(|e| {
                    CtaError::transport(format!("invalid token realm {}: {}", realm, e), false)
                })?;
                {
                    let mut query = url.query_pairs_mut();
                    if let Some(service) = params.get("service") {
                        query.append_pair("service", service);
                    }
                    query.append_pair(
                        "scope",
                        params.get("scope").map(String::as_str).unwrap_or(scope),
                    );
                }

                let mut request = self.client.get(url);
                if let Some(creds) = &credentials {
                    request = request.basic_auth(&creds.username, Some(&creds.password));
                }
                let response = request.send()?;
                let status = response.status();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    return Err(self.unauthorized());
                }
                if !status.is_success() {
                    return Err(status_error(status, format!("token request to {}", realm)));
                }
                let token: TokenResponse = response.json()?;
                tracing::debug!(host = %self.host, scope, "Obtained registry token");
                token
                    .token
                    .or(token.access_token)
                    .map(Authorization::Bearer)
                    .ok_or_else(|| CtaError::transport("token response without token", false))
            }
            other => Err(CtaError::transport(
                format!("unsupported authentication scheme '{}'", other),
                false,
            )),
        }
    }

    fn unauthorized(&self) -> CtaError {
        CtaError::Unauthorized {
            host: self.host.clone(),
        }
    }

    /// Map a non-success status to the error taxonomy.
    fn check(&self, response: Response, what: impl FnOnce() -> String) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(self.unauthorized()),
            StatusCode::NOT_FOUND => Err(CtaError::not_found(what())),
            _ => {
                let body = response.text().unwrap_or_default();
                Err(status_error(status, format!("{}: {}", what(), body.trim())))
            }
        }
    }

    fn location(&self, response: &Response) -> Result<Url> {
        let location = header_str(response, LOCATION.as_str())
            .ok_or_else(|| CtaError::transport("upload response without Location", false))?;
        self.url(location)
    }
}

fn scope_for(repository: &str, privileges: Privileges) -> String {
    let actions = match privileges {
        Privileges::ReadOnly => "pull",
        Privileges::ReadWrite => "pull,push",
    };
    format!("repository:{}:{}", repository, actions)
}

fn authorize(request: RequestBuilder, auth: Option<&Authorization>) -> RequestBuilder {
    match auth {
        Some(Authorization::Basic(creds)) => {
            request.basic_auth(&creds.username, Some(&creds.password))
        }
        Some(Authorization::Bearer(token)) => request.bearer_auth(token),
        None => request,
    }
}

/// Split `Bearer realm="...",service="..."` into the scheme and its parameters.
fn parse_challenge(challenge: &str) -> Result<(String, HashMap<String, String>)> {
    let challenge = challenge.trim();
    let (scheme, rest) = challenge.split_once(' ').unwrap_or((challenge, ""));
    let pattern = Regex::new(r#"(\w+)="([^"]*)""#)
        .map_err(|e| CtaError::transport(e.to_string(), false))?;
    let params = pattern
        .captures_iter(rest)
        .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
        .collect();
    Ok((scheme.to_string(), params))
}

fn status_error(status: StatusCode, message: String) -> CtaError {
    let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
    CtaError::transport(format!("{} {}", status, message), retryable)
}

fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn header_len(response: &Response) -> Option<u64> {
    header_str(response, CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok())
}

fn header_media_type(response: &Response) -> Option<String> {
    header_str(response, CONTENT_TYPE.as_str())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Fill `buf` from `reader`; returns fewer bytes than `buf.len()` only at EOF.
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// The manifest's own `mediaType` field, falling back to the response header.
fn manifest_media_type(bytes: &[u8], header: Option<String>) -> String {
    #[derive(Deserialize)]
    struct MediaTypeField {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    }
    serde_json::from_slice::<MediaTypeField>(bytes)
        .ok()
        .and_then(|m| m.media_type)
        .or(header)
        .unwrap_or_else(|| crate::image::media_types::OCI_IMAGE_MANIFEST.to_string())
}

impl ArtifactStore for RegistryClient {
    fn stat_blob(&self, repository: &str, digest: &Digest) -> Result<Option<u64>> {
        let url = self.url(&format!("v2/{}/blobs/{}", repository, digest))?;
        let response = self.send(repository, Privileges::ReadOnly, "stat_blob", &|c: &Client| {
            c.head(url.clone())
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response, || format!("blob {} in {}", digest, repository))?;
        Ok(Some(header_len(&response).unwrap_or(0)))
    }

    fn upload_blob(
        &self,
        repository: &str,
        blob: &BlobRef,
        reader: &mut dyn Read,
        chunk_size: usize,
    ) -> Result<()> {
        let start_url = self.url(&format!("v2/{}/blobs/uploads/", repository))?;
        let response = self.send(repository, Privileges::ReadWrite, "upload_start", &|c: &Client| {
            c.post(start_url.clone()).header(CONTENT_LENGTH, "0")
        })?;
        let response = self.check(response, || format!("upload session in {}", repository))?;
        let mut location = self.location(&response)?;

        let mut hasher = HashingWriter::new(io::sink());
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut offset = 0u64;
        loop {
            let n = read_chunk(reader, &mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            hasher.write_all(chunk)?;

            let range = format!("{}-{}", offset, offset + n as u64 - 1);
            let url = location.clone();
            let response = self.send(repository, Privileges::ReadWrite, "upload_chunk", &|c: &Client| {
                c.patch(url.clone())
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_RANGE, range.as_str())
                    .body(chunk.to_vec())
            })?;
            let response =
                self.check(response, || format!("upload chunk {} of {}", range, blob.digest))?;
            location = self.location(&response)?;
            offset += n as u64;
            if n < buf.len() {
                break;
            }
        }

        let (_, actual, _) = hasher.finish();
        if let Err(e) = verify(&blob.digest, &actual) {
            match self.client.delete(location).send() {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => tracing::debug!(
                    host = %self.host,
                    repository,
                    status = %response.status(),
                    "Registry rejected upload abort"
                ),
                Err(err) => tracing::debug!(
                    host = %self.host,
                    repository,
                    error = %err,
                    "Upload abort failed"
                ),
            }
            return Err(e);
        }

        let mut finish_url = location;
        finish_url
            .query_pairs_mut()
            .append_pair("digest", blob.digest.as_str());
        let response = self.send(repository, Privileges::ReadWrite, "upload_finish", &|c: &Client| {
            c.put(finish_url.clone()).header(CONTENT_LENGTH, "0")
        })?;
        self.check(response, || format!("finishing upload of {}", blob.digest))?;

        tracing::debug!(
            host = %self.host,
            repository,
            digest = %blob.digest,
            size_bytes = offset,
            "Blob uploaded"
        );
        Ok(())
    }

    fn fetch_blob(&self, repository: &str, digest: &Digest) -> Result<Box<dyn Read + Send + '_>> {
        let url = self.url(&format!("v2/{}/blobs/{}", repository, digest))?;
        let response = self.send(repository, Privileges::ReadOnly, "fetch_blob", &|c: &Client| {
            c.get(url.clone())
        })?;
        let response = self.check(response, || format!("blob {} in {}", digest, repository))?;
        Ok(Box::new(response))
    }

    fn head_manifest(
        &self,
        repository: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<Option<BlobRef>> {
        let url = self.url(&format!("v2/{}/manifests/{}", repository, reference))?;
        let accept_value = accept.join(", ");
        let response = self.send(repository, Privileges::ReadOnly, "head_manifest", &|c: &Client| {
            c.head(url.clone()).header(ACCEPT, accept_value.as_str())
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response =
            self.check(response, || format!("manifest {}:{}", repository, reference))?;

        let digest = header_str(&response, DOCKER_CONTENT_DIGEST)
            .map(Digest::parse)
            .transpose()?;
        match (digest, header_len(&response), header_media_type(&response)) {
            (Some(digest), Some(size), Some(media_type)) => {
                Ok(Some(BlobRef::new(media_type, digest, size)))
            }
            // Not every registry answers HEAD with a digest; fall back to GET.
            _ => Ok(Some(self.fetch_manifest(repository, reference, accept)?.0)),
        }
    }

    fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<(BlobRef, Vec<u8>)> {
        let url = self.url(&format!("v2/{}/manifests/{}", repository, reference))?;
        let accept_value = accept.join(", ");
        let response = self.send(repository, Privileges::ReadOnly, "fetch_manifest", &|c: &Client| {
            c.get(url.clone()).header(ACCEPT, accept_value.as_str())
        })?;
        let response =
            self.check(response, || format!("manifest {}:{}", repository, reference))?;
        let header = header_media_type(&response);
        let bytes = response.bytes()?.to_vec();

        let descriptor = BlobRef::for_bytes(manifest_media_type(&bytes, header), &bytes);
        verify_manifest_reference(reference, &descriptor)?;
        Ok((descriptor, bytes))
    }

    fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<BlobRef> {
        let descriptor = BlobRef::for_bytes(media_type, bytes);
        verify_manifest_reference(reference, &descriptor)?;

        let url = self.url(&format!("v2/{}/manifests/{}", repository, reference))?;
        let response = self.send(repository, Privileges::ReadWrite, "push_manifest", &|c: &Client| {
            c.put(url.clone())
                .header(CONTENT_TYPE, media_type)
                .body(bytes.to_vec())
        })?;
        self.check(response, || format!("manifest {}:{}", repository, reference))?;

        tracing::info!(
            host = %self.host,
            repository,
            reference,
            digest = %descriptor.digest,
            "Manifest pushed"
        );
        Ok(descriptor)
    }

    fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("v2/{}/tags/list", repository))?;
        let response = self.send(repository, Privileges::ReadOnly, "list_tags", &|c: &Client| {
            c.get(url.clone())
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = self.check(response, || format!("tags of {}", repository))?;
        let list: TagList = response.json()?;
        Ok(list.tags.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let (scheme, params) = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:echo:pull""#,
        )
        .unwrap();
        assert_eq!(scheme, "Bearer");
        assert_eq!(params["realm"], "https://auth.example.com/token");
        assert_eq!(params["service"], "registry.example.com");
        assert_eq!(params["scope"], "repository:echo:pull");
    }

    #[test]
    fn test_parse_basic_challenge() {
        let (scheme, params) = parse_challenge(r#"Basic realm="Registry Realm""#).unwrap();
        assert_eq!(scheme, "Basic");
        assert_eq!(params["realm"], "Registry Realm");
    }

    #[test]
    fn test_scope_for_privileges() {
        assert_eq!(scope_for("a/b", Privileges::ReadOnly), "repository:a/b:pull");
        assert_eq!(
            scope_for("a/b", Privileges::ReadWrite),
            "repository:a/b:pull,push"
        );
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(crate::error::is_retryable(&status_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "x".into()
        )));
        assert!(crate::error::is_retryable(&status_error(
            StatusCode::TOO_MANY_REQUESTS,
            "x".into()
        )));
        assert!(!crate::error::is_retryable(&status_error(
            StatusCode::BAD_REQUEST,
            "x".into()
        )));
    }

    #[test]
    fn test_read_chunk_fills_buffer() {
        let data = vec![1u8; 10];
        let mut reader: &[u8] = &data;
        let mut buf = [0u8; 4];
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 2);
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_manifest_media_type_prefers_document_field() {
        let bytes = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#;
        assert_eq!(
            manifest_media_type(bytes, Some("application/json".into())),
            "application/vnd.docker.distribution.manifest.v2+json"
        );
        assert_eq!(
            manifest_media_type(b"{}", Some("application/vnd.oci.image.index.v1+json".into())),
            "application/vnd.oci.image.index.v1+json"
        );
    }

    #[test]
    fn test_plain_http_for_localhost() {
        let client = RegistryClient::new(
            "localhost:5000",
            &RegistryConfig::default(),
            Box::new(crate::credentials::ResolverChain::new()),
        )
        .unwrap();
        assert_eq!(client.url("v2/").unwrap().as_str(), "http://localhost:5000/v2/");
    }
}
