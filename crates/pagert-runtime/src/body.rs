//! Request metadata and body parsing.
//!
//! Url-encoded bodies are read whole. Multipart bodies are parsed incrementally
//! with a bounded buffer: part bytes that cannot belong to the closing boundary
//! are handed on as they arrive. A file part gets its temp file, already created
//! and registered with the [`UploadLedger`], as soon as its headers are parsed and
//! its bytes are streamed into it. Deleting a registered file unlinks it, so
//! writes still queued for it never bring it back.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};

use crate::error::BodyError;
use crate::uploads::{UploadFile, UploadLedger};

pub type RequestBody = Box<dyn AsyncRead + Send + Unpin>;

const READ_CHUNK_BYTES: usize = 16 * 1024;
const MAX_PART_HEADER_BYTES: usize = 16 * 1024;

pub struct PageRequest {
    pub method: String,
    /// Request target: path plus optional `?query`.
    pub url: String,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
}

impl PageRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        PageRequest {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.trim().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body<R>(mut self, body: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.body = Some(Box::new(body));
        self
    }

    pub fn path(&self) -> &str {
        match self.url.split_once('?') {
            Some((path, _)) => path,
            None => &self.url,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

impl std::fmt::Debug for PageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Request parameters; keys may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, Vec<String>>,
}

impl Params {
    pub fn from_query(query: &str) -> Self {
        let mut params = Params::default();
        params.extend_urlencoded(query.as_bytes());
        params
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    pub fn extend_urlencoded(&mut self, input: &[u8]) {
        for (k, v) in url::form_urlencoded::parse(input) {
            self.insert(k.into_owned(), v.into_owned());
        }
    }

    pub fn extend(&mut self, other: Params) {
        for (k, vs) in other.values {
            self.values.entry(k).or_default().extend(vs);
        }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|vs| vs.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ParsedBody {
    pub params: Params,
    /// Body bytes of content types that are neither url-encoded nor multipart.
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyKind {
    UrlEncoded,
    Multipart { boundary: String },
    MultipartWithoutBoundary,
    Raw,
}

fn body_kind(content_type: Option<&str>) -> BodyKind {
    let Some(ct) = content_type else {
        return BodyKind::Raw;
    };
    let mut pieces = ct.split(';');
    let essence = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.as_str() {
        "application/x-www-form-urlencoded" => BodyKind::UrlEncoded,
        "multipart/form-data" => {
            for piece in pieces {
                let Some((k, v)) = piece.split_once('=') else {
                    continue;
                };
                if k.trim().eq_ignore_ascii_case("boundary") {
                    let b = v.trim().trim_matches('"');
                    if !b.is_empty() {
                        return BodyKind::Multipart {
                            boundary: b.to_string(),
                        };
                    }
                }
            }
            BodyKind::MultipartWithoutBoundary
        }
        _ => BodyKind::Raw,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PartHeaders {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
}

enum MultipartState {
    Preamble,
    AfterDelimiter,
    Headers,
    Body(PartSink),
    Done,
}

/// Destination of the bytes of the part being received.
enum PartSink {
    Field { name: String, value: Vec<u8> },
    File {
        upload: Arc<UploadFile>,
        file: tokio::fs::File,
    },
    Discard,
}

impl PartSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), BodyError> {
        match self {
            PartSink::Field { value, .. } => value.extend_from_slice(bytes),
            PartSink::File { upload, file } => {
                file.write_all(bytes)
                    .await
                    .map_err(|source| BodyError::Store {
                        path: upload.temp_path.clone(),
                        source,
                    })?;
                upload.record_written(bytes.len() as u64);
            }
            PartSink::Discard => {}
        }
        Ok(())
    }

    async fn finish(self, params: &mut Params) -> Result<(), BodyError> {
        match self {
            PartSink::Field { name, value } => {
                params.insert(name, String::from_utf8_lossy(&value).into_owned());
            }
            PartSink::File { upload, mut file } => {
                file.flush().await.map_err(|source| BodyError::Store {
                    path: upload.temp_path.clone(),
                    source,
                })?;
            }
            PartSink::Discard => {}
        }
        Ok(())
    }
}

/// Streams one request body. Dropping the [`BodyParser::parse`] future stops the
/// read; [`BodyParser::cancel`] additionally discards everything buffered.
pub struct BodyParser {
    kind: BodyKind,
    reader: Option<RequestBody>,
    buf: Vec<u8>,
    received: u64,
    upload_dir: PathBuf,
    uploads: UploadLedger,
    cancelled: bool,
}

impl BodyParser {
    pub fn new(
        content_type: Option<&str>,
        body: Option<RequestBody>,
        upload_dir: PathBuf,
        uploads: UploadLedger,
    ) -> Self {
        BodyParser {
            kind: body_kind(content_type),
            reader: body,
            buf: Vec::new(),
            received: 0,
            upload_dir,
            uploads,
            cancelled: false,
        }
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.reader = None;
        self.buf = Vec::new();
    }

    pub async fn parse(&mut self) -> Result<ParsedBody, BodyError> {
        if self.cancelled {
            return Err(BodyError::Cancelled);
        }
        if self.reader.is_none() {
            return Ok(ParsedBody::default());
        }
        match self.kind.clone() {
            BodyKind::UrlEncoded => {
                self.read_to_end().await?;
                let mut params = Params::default();
                params.extend_urlencoded(&self.buf);
                self.buf.clear();
                Ok(ParsedBody {
                    params,
                    raw: Vec::new(),
                })
            }
            BodyKind::Raw => {
                self.read_to_end().await?;
                Ok(ParsedBody {
                    params: Params::default(),
                    raw: std::mem::take(&mut self.buf),
                })
            }
            BodyKind::MultipartWithoutBoundary => Err(BodyError::MissingBoundary),
            BodyKind::Multipart { boundary } => self.parse_multipart(&boundary).await,
        }
    }

    async fn read_chunk(&mut self) -> Result<usize, BodyError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(BodyError::Cancelled);
        };
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        let n = reader.read(&mut chunk).await.map_err(BodyError::Read)?;
        self.buf.extend_from_slice(&chunk[..n]);
        self.received += n as u64;
        Ok(n)
    }

    async fn read_to_end(&mut self) -> Result<(), BodyError> {
        while self.read_chunk().await? != 0 {}
        Ok(())
    }

    async fn parse_multipart(&mut self, boundary: &str) -> Result<ParsedBody, BodyError> {
        let delimiter = format!("--{boundary}").into_bytes();
        let mut part_end = b"\r\n".to_vec();
        part_end.extend_from_slice(&delimiter);

        let mut params = Params::default();
        let mut state = MultipartState::Preamble;
        loop {
            let (next, advanced) = match std::mem::replace(&mut state, MultipartState::Done) {
                MultipartState::Preamble => match find(&self.buf, &delimiter) {
                    Some(pos) => {
                        self.buf.drain(..pos + delimiter.len());
                        (MultipartState::AfterDelimiter, true)
                    }
                    None => {
                        keep_tail(&mut self.buf, delimiter.len() - 1);
                        (MultipartState::Preamble, false)
                    }
                },
                MultipartState::AfterDelimiter => {
                    if self.buf.len() < 2 {
                        (MultipartState::AfterDelimiter, false)
                    } else if self.buf.starts_with(b"--") {
                        (MultipartState::Done, true)
                    } else if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        (MultipartState::Headers, true)
                    } else {
                        return Err(BodyError::BadPartHeaders(
                            "expected CRLF after boundary".to_string(),
                        ));
                    }
                }
                MultipartState::Headers => match find(&self.buf, b"\r\n\r\n") {
                    Some(pos) => {
                        let headers = parse_part_headers(&self.buf[..pos])?;
                        self.buf.drain(..pos + 4);
                        (MultipartState::Body(self.open_part(headers)?), true)
                    }
                    None if self.buf.len() > MAX_PART_HEADER_BYTES => {
                        return Err(BodyError::BadPartHeaders(format!(
                            "part headers exceed {MAX_PART_HEADER_BYTES} bytes"
                        )));
                    }
                    None => (MultipartState::Headers, false),
                },
                MultipartState::Body(mut sink) => match find(&self.buf, &part_end) {
                    Some(pos) => {
                        sink.write(&self.buf[..pos]).await?;
                        self.buf.drain(..pos + part_end.len());
                        sink.finish(&mut params).await?;
                        (MultipartState::AfterDelimiter, true)
                    }
                    None => {
                        // Only a suffix shorter than the boundary can still start it.
                        let settled = self.buf.len().saturating_sub(part_end.len() - 1);
                        if settled > 0 {
                            sink.write(&self.buf[..settled]).await?;
                            self.buf.drain(..settled);
                        }
                        (MultipartState::Body(sink), false)
                    }
                },
                MultipartState::Done => {
                    self.buf.clear();
                    return Ok(ParsedBody {
                        params,
                        raw: Vec::new(),
                    });
                }
            };
            state = next;
            if advanced {
                continue;
            }
            if self.read_chunk().await? == 0 {
                return Err(BodyError::UnexpectedEnd);
            }
        }
    }

    /// Picks where a part's bytes go. A file part's temp file is created and
    /// registered here, before any of its bytes are written.
    fn open_part(&self, headers: PartHeaders) -> Result<PartSink, BodyError> {
        let Some(filename) = headers.filename else {
            return Ok(PartSink::Field {
                name: headers.name,
                value: Vec::new(),
            });
        };
        if filename.is_empty() {
            return Ok(PartSink::Discard);
        }

        let media_type = headers
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let (upload, file) =
            UploadFile::create(&self.upload_dir, headers.name, filename, media_type).map_err(
                |source| BodyError::Store {
                    path: self.upload_dir.clone(),
                    source,
                },
            )?;
        let upload = self.uploads.push(upload);
        Ok(PartSink::File {
            upload,
            file: tokio::fs::File::from_std(file),
        })
    }
}

fn keep_tail(buf: &mut Vec<u8>, keep: usize) {
    if buf.len() > keep {
        buf.drain(..buf.len() - keep);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_part_headers(block: &[u8]) -> Result<PartHeaders, BodyError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| BodyError::BadPartHeaders("headers are not UTF-8".to_string()))?;

    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(BodyError::BadPartHeaders(format!(
                "header line without ':': {line:?}"
            )));
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            let attrs = parse_disposition(value);
            name = attrs.iter().find(|(k, _)| k == "name").map(|(_, v)| v.clone());
            filename = attrs
                .iter()
                .find(|(k, _)| k == "filename")
                .map(|(_, v)| v.clone());
        } else if key.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string());
        }
    }

    let Some(name) = name else {
        return Err(BodyError::BadPartHeaders(
            "part has no content-disposition name".to_string(),
        ));
    };
    Ok(PartHeaders {
        name,
        filename,
        content_type,
    })
}

/// Splits `form-data; name="a"; filename="b;c.txt"` into lowercased key/value pairs,
/// honoring quotes and backslash escapes inside them.
fn parse_disposition(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = value.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ';') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let mut val = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                val.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => val.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ';' {
                        break;
                    }
                    val.push(c);
                    chars.next();
                }
            }
        }
        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            out.push((key, val.trim().to_string()));
        }
    }
    out
}
