//! ICAP request framing.
//!
//! Bounds-checked parsing of the ICAP request line, headers, the
//! `Encapsulated` offset list, and the chunked transfer coding used for
//! encapsulated bodies. Any framing violation is a
//! [`TollgateError::Protocol`], which the server answers by rejecting the
//! connection.

use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::error::{Result, TollgateError};

/// Upper bound on a single header line; longer lines are a framing error.
const MAX_LINE: usize = 16 * 1024;
/// Upper bound on an encapsulated header section.
const MAX_HEADER_SECTION: usize = 64 * 1024;
/// Upper bound on a single body chunk.
const MAX_CHUNK: usize = 8 * 1024 * 1024;

/// ICAP methods this service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcapMethod {
    Options,
    ReqMod,
    RespMod,
}

/// The encapsulated-section kinds named by the `Encapsulated` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    ReqHdr,
    ResHdr,
    ReqBody,
    ResBody,
    NullBody,
    OptBody,
}

impl SectionKind {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "req-hdr" => SectionKind::ReqHdr,
            "res-hdr" => SectionKind::ResHdr,
            "req-body" => SectionKind::ReqBody,
            "res-body" => SectionKind::ResBody,
            "null-body" => SectionKind::NullBody,
            "opt-body" => SectionKind::OptBody,
            other => {
                return Err(TollgateError::Protocol(format!(
                    "unknown encapsulated section: {}",
                    other
                )))
            }
        })
    }

    pub fn is_body(&self) -> bool {
        matches!(
            self,
            SectionKind::ReqBody | SectionKind::ResBody | SectionKind::OptBody
        )
    }
}

/// A parsed ICAP request head.
#[derive(Debug)]
pub struct IcapRequest {
    pub method: IcapMethod,
    pub uri: String,
    /// Header names lowercased, order preserved.
    pub headers: Vec<(String, String)>,
    /// `Encapsulated` entries in declared (ascending-offset) order.
    pub encapsulated: Vec<(SectionKind, usize)>,
}

impl IcapRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn allow_204(&self) -> bool {
        self.header("allow")
            .map(|v| v.split(',').any(|t| t.trim() == "204"))
            .unwrap_or(false)
    }

    /// Declared preview size, when the client negotiated one.
    pub fn preview(&self) -> Option<usize> {
        self.header("preview").and_then(|v| v.trim().parse().ok())
    }

    /// The body section kind, if any body is encapsulated.
    pub fn body_kind(&self) -> Option<SectionKind> {
        self.encapsulated
            .iter()
            .map(|(k, _)| *k)
            .find(SectionKind::is_body)
    }
}

async fn read_crlf_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let byte = {
            let mut one = [0u8; 1];
            match reader.read_exact(&mut one).await {
                Ok(_) => one[0],
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && line.is_empty() => {
                    return Ok(None);
                }
                Err(e) => return Err(TollgateError::Protocol(format!("read: {}", e))),
            }
        };
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let s = String::from_utf8(line)
                .map_err(|_| TollgateError::Protocol("non-UTF8 header line".to_string()))?;
            return Ok(Some(s));
        }
        line.push(byte);
        if line.len() > MAX_LINE {
            return Err(TollgateError::Protocol("header line too long".to_string()));
        }
    }
}

/// Read one ICAP request head. `Ok(None)` on clean connection close.
pub async fn read_icap_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<IcapRequest>> {
    let request_line = loop {
        match read_crlf_line(reader).await? {
            None => return Ok(None),
            // Tolerate stray blank lines between pipelined requests.
            Some(l) if l.is_empty() => continue,
            Some(l) => break l,
        }
    };

    let mut parts = request_line.split_whitespace();
    let method = match parts.next() {
        Some("OPTIONS") => IcapMethod::Options,
        Some("REQMOD") => IcapMethod::ReqMod,
        Some("RESPMOD") => IcapMethod::RespMod,
        Some(other) => {
            return Err(TollgateError::Protocol(format!(
                "unsupported method: {}",
                other
            )))
        }
        None => return Err(TollgateError::Protocol("empty request line".to_string())),
    };
    let uri = parts
        .next()
        .ok_or_else(|| TollgateError::Protocol("missing URI".to_string()))?
        .to_string();
    match parts.next() {
        Some(v) if v.starts_with("ICAP/1.") => {}
        _ => return Err(TollgateError::Protocol("bad ICAP version".to_string())),
    }

    let mut headers = Vec::new();
    loop {
        let line = read_crlf_line(reader)
            .await?
            .ok_or_else(|| TollgateError::Protocol("EOF inside headers".to_string()))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TollgateError::Protocol(format!("malformed header: {}", line)))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    let encapsulated = match headers.iter().find(|(n, _)| n == "encapsulated") {
        Some((_, v)) => parse_encapsulated(v)?,
        None if method == IcapMethod::Options => Vec::new(),
        None => {
            return Err(TollgateError::Protocol(
                "missing Encapsulated header".to_string(),
            ))
        }
    };

    Ok(Some(IcapRequest {
        method,
        uri,
        headers,
        encapsulated,
    }))
}

fn parse_encapsulated(value: &str) -> Result<Vec<(SectionKind, usize)>> {
    let mut out = Vec::new();
    let mut last_offset = None;
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, offset) = entry.split_once('=').ok_or_else(|| {
            TollgateError::Protocol(format!("malformed Encapsulated entry: {}", entry))
        })?;
        let offset: usize = offset.trim().parse().map_err(|_| {
            TollgateError::Protocol(format!("bad Encapsulated offset: {}", entry))
        })?;
        if let Some(last) = last_offset {
            if offset < last {
                return Err(TollgateError::Protocol(
                    "Encapsulated offsets not ascending".to_string(),
                ));
            }
        }
        last_offset = Some(offset);
        out.push((SectionKind::parse(name.trim())?, offset));
    }
    Ok(out)
}

/// Read the fixed-length encapsulated header sections (everything before
/// the body). Returns them in declared order alongside their kinds.
pub async fn read_header_sections<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    encapsulated: &[(SectionKind, usize)],
) -> Result<Vec<(SectionKind, Vec<u8>)>> {
    let mut out = Vec::new();
    for window in encapsulated.windows(2) {
        let (kind, start) = window[0];
        let (_, end) = window[1];
        if kind.is_body() || kind == SectionKind::NullBody {
            return Err(TollgateError::Protocol(
                "body section before last Encapsulated entry".to_string(),
            ));
        }
        let len = end - start;
        if len > MAX_HEADER_SECTION {
            return Err(TollgateError::Protocol(
                "encapsulated header section too large".to_string(),
            ));
        }
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| TollgateError::Protocol(format!("header section read: {}", e)))?;
        out.push((kind, buf));
    }
    Ok(out)
}

/// How a chunked body segment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEnd {
    /// Normal terminator; no more body follows in this segment.
    Final,
    /// Preview terminator carrying `ieof`: the preview was the whole body.
    PreviewIeof,
}

/// One step of a chunked body read.
#[derive(Debug)]
pub enum ChunkItem {
    Data(Vec<u8>),
    End(ChunkEnd),
}

/// Read the next chunk of a chunked body. Yields `End` on the zero chunk,
/// after consuming any trailers.
pub async fn read_chunk<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ChunkItem> {
    let line = read_crlf_line(reader)
        .await?
        .ok_or_else(|| TollgateError::Protocol("EOF inside chunked body".to_string()))?;
    let (size_part, ext) = match line.split_once(';') {
        Some((s, e)) => (s.trim(), e.trim()),
        None => (line.trim(), ""),
    };
    let size = usize::from_str_radix(size_part, 16)
        .map_err(|_| TollgateError::Protocol(format!("bad chunk size: {}", line)))?;
    if size > MAX_CHUNK {
        return Err(TollgateError::Protocol("chunk too large".to_string()));
    }
    if size == 0 {
        let ieof = ext.eq_ignore_ascii_case("ieof");
        // Consume optional trailers up to the blank line.
        loop {
            let t = read_crlf_line(reader)
                .await?
                .ok_or_else(|| TollgateError::Protocol("EOF in trailers".to_string()))?;
            if t.is_empty() {
                break;
            }
        }
        return Ok(ChunkItem::End(if ieof {
            ChunkEnd::PreviewIeof
        } else {
            ChunkEnd::Final
        }));
    }
    let mut buf = vec![0u8; size];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TollgateError::Protocol(format!("chunk read: {}", e)))?;
    let mut crlf = [0u8; 2];
    reader
        .read_exact(&mut crlf)
        .await
        .map_err(|e| TollgateError::Protocol(format!("chunk trailer read: {}", e)))?;
    if &crlf != b"\r\n" {
        return Err(TollgateError::Protocol("missing chunk CRLF".to_string()));
    }
    Ok(ChunkItem::Data(buf))
}
