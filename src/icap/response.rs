//! ICAP response emission.
//!
//! Small writers for the handful of response shapes the gateway produces:
//! `100 Continue`, `204 No Content`, `400 Bad Request`, the OPTIONS
//! capability advertisement, and `200 OK` with an encapsulated HTTP
//! message. Also synthesizes the HTTP 403 bodies used for policy blocks.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TollgateError};
use crate::icap::body::SpillBuffer;
use crate::ott::{approval_command, BlockedRequest};

/// Block size for chunk emission and spill streaming.
const STREAM_BLOCK: usize = 64 * 1024;

async fn write_all<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    w.write_all(data).await.map_err(TollgateError::Io)?;
    Ok(())
}

pub async fn write_continue<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    write_all(w, b"ICAP/1.0 100 Continue\r\n\r\n").await?;
    w.flush().await.map_err(TollgateError::Io)
}

pub async fn write_no_content<W: AsyncWrite + Unpin>(w: &mut W, istag: &str) -> Result<()> {
    let head = format!(
        "ICAP/1.0 204 No Content\r\nISTag: \"{}\"\r\nEncapsulated: null-body=0\r\n\r\n",
        istag
    );
    write_all(w, head.as_bytes()).await?;
    w.flush().await.map_err(TollgateError::Io)
}

pub async fn write_bad_request<W: AsyncWrite + Unpin>(w: &mut W, istag: &str) -> Result<()> {
    let head = format!(
        "ICAP/1.0 400 Bad Request\r\nISTag: \"{}\"\r\nEncapsulated: null-body=0\r\n\r\n",
        istag
    );
    write_all(w, head.as_bytes()).await?;
    w.flush().await.map_err(TollgateError::Io)
}

pub async fn write_options<W: AsyncWrite + Unpin>(
    w: &mut W,
    istag: &str,
    service: &str,
    preview: usize,
) -> Result<()> {
    let head = format!(
        "ICAP/1.0 200 OK\r\n\
         Methods: REQMOD, RESPMOD\r\n\
         Service: {}\r\n\
         ISTag: \"{}\"\r\n\
         Allow: 204\r\n\
         Preview: {}\r\n\
         Transfer-Complete: *\r\n\
         Encapsulated: null-body=0\r\n\
         \r\n",
        service, istag, preview
    );
    write_all(w, head.as_bytes()).await?;
    w.flush().await.map_err(TollgateError::Io)
}

/// Which side of the HTTP exchange the encapsulated message belongs to.
#[derive(Debug, Clone, Copy)]
pub enum Side {
    Request,
    Response,
}

impl Side {
    fn hdr_label(self) -> &'static str {
        match self {
            Side::Request => "req-hdr",
            Side::Response => "res-hdr",
        }
    }

    fn body_label(self) -> &'static str {
        match self {
            Side::Request => "req-body",
            Side::Response => "res-body",
        }
    }
}

/// Write a `200 OK` carrying an encapsulated HTTP head and optional body.
/// The body is emitted with the chunked coding, as the protocol requires.
pub async fn write_encapsulated<W: AsyncWrite + Unpin>(
    w: &mut W,
    istag: &str,
    side: Side,
    http_head: &[u8],
    body: Option<&[u8]>,
) -> Result<()> {
    let encapsulated = match body {
        Some(_) => format!(
            "{}=0, {}={}",
            side.hdr_label(),
            side.body_label(),
            http_head.len()
        ),
        None => format!("{}=0, null-body={}", side.hdr_label(), http_head.len()),
    };
    let head = format!(
        "ICAP/1.0 200 OK\r\nISTag: \"{}\"\r\nEncapsulated: {}\r\n\r\n",
        istag, encapsulated
    );
    write_all(w, head.as_bytes()).await?;
    write_all(w, http_head).await?;
    if let Some(body) = body {
        write_chunked(w, body).await?;
    }
    w.flush().await.map_err(TollgateError::Io)
}

/// Emit a body in the chunked coding, in at most 64 KiB chunks.
pub async fn write_chunked<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<()> {
    for piece in body.chunks(STREAM_BLOCK) {
        write_chunk(w, piece).await?;
    }
    write_all(w, b"0\r\n\r\n").await
}

async fn write_chunk<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    let size = format!("{:x}\r\n", data.len());
    write_all(w, size.as_bytes()).await?;
    write_all(w, data).await?;
    write_all(w, b"\r\n").await
}

/// Write a `200 OK` whose encapsulated body streams out of a spill
/// buffer block by block, never materializing the whole payload.
///
/// `head_patch` and `tail_patch`, when non-empty, replace the leading
/// and trailing spans of the body byte for byte. Token redaction is
/// length-preserving, so the patched stream keeps the original length.
pub async fn write_encapsulated_spill<W: AsyncWrite + Unpin>(
    w: &mut W,
    istag: &str,
    side: Side,
    http_head: &[u8],
    body: &mut SpillBuffer,
    head_patch: &[u8],
    tail_patch: &[u8],
) -> Result<()> {
    let head = format!(
        "ICAP/1.0 200 OK\r\nISTag: \"{}\"\r\nEncapsulated: {}=0, {}={}\r\n\r\n",
        istag,
        side.hdr_label(),
        side.body_label(),
        http_head.len()
    );
    write_all(w, head.as_bytes()).await?;
    write_all(w, http_head).await?;

    if !head_patch.is_empty() {
        write_chunk(w, head_patch).await?;
    }
    let middle_end = body.len().saturating_sub(tail_patch.len() as u64);
    body.seek_to(head_patch.len() as u64).await?;
    let mut remaining = middle_end.saturating_sub(head_patch.len() as u64);
    let mut block = vec![0u8; STREAM_BLOCK];
    while remaining > 0 {
        let want = remaining.min(STREAM_BLOCK as u64) as usize;
        let n = body.read_block(&mut block[..want]).await?;
        if n == 0 {
            return Err(TollgateError::Protocol(
                "spill body ended before its recorded length".to_string(),
            ));
        }
        write_chunk(w, &block[..n]).await?;
        remaining -= n as u64;
    }
    if !tail_patch.is_empty() {
        write_chunk(w, tail_patch).await?;
    }
    write_all(w, b"0\r\n\r\n").await?;
    w.flush().await.map_err(TollgateError::Io)
}

/// Synthesized HTTP 403 for a policy block. The identifying headers are
/// for the proxy and log layer; the body tells the agent the request id
/// and the operator command, never the matched pattern text.
pub fn blocked_http(blocked: &BlockedRequest) -> (Vec<u8>, Vec<u8>) {
    let body = format!(
        "Request blocked ({}): {}.\n\
         An operator can approve it by sending exactly this text to the same destination:\n\
         \n    {}\n",
        blocked.request_id,
        blocked.reason,
        approval_command(&blocked.request_id)
    );
    let pattern_header = match &blocked.pattern {
        Some(p) => format!("X-Tollgate-Pattern: {}\r\n", p),
        None => String::new(),
    };
    let head = format!(
        "HTTP/1.1 403 Forbidden\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         X-Tollgate-Request-Id: {}\r\n\
         X-Tollgate-Reason: {}\r\n\
         {}Connection: close\r\n\
         \r\n",
        body.len(),
        blocked.request_id,
        blocked.reason,
        pattern_header
    );
    (head.into_bytes(), body.into_bytes())
}

/// Synthesized HTTP 403 for content the scanner flagged or could not
/// clear. Not approvable, so it carries no request id.
pub fn denied_http(reason: &str, detail: &str) -> (Vec<u8>, Vec<u8>) {
    let body = format!("Content denied: {}.\n", detail);
    let head = format!(
        "HTTP/1.1 403 Forbidden\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         X-Tollgate-Reason: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len(),
        reason
    );
    (head.into_bytes(), body.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ott::RequestId;
    use chrono::Utc;

    fn sample_blocked() -> BlockedRequest {
        BlockedRequest {
            request_id: RequestId::mint().unwrap(),
            reason: "credential_detected".to_string(),
            destination: "evil.example".to_string(),
            pattern: Some("anthropic-api-key".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn no_content_carries_istag_and_null_body() {
        let mut out = Vec::new();
        write_no_content(&mut out, "tollgate-1").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("ICAP/1.0 204 No Content\r\n"));
        assert!(text.contains("ISTag: \"tollgate-1\"\r\n"));
        assert!(text.contains("Encapsulated: null-body=0\r\n"));
    }

    #[tokio::test]
    async fn encapsulated_offsets_match_head_length() {
        let head = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        let mut out = Vec::new();
        write_encapsulated(&mut out, "t", Side::Response, head, Some(b"nope"))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("Encapsulated: res-hdr=0, res-body={}\r\n", head.len())));
        assert!(text.contains("4\r\nnope\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn chunked_splits_large_bodies() {
        let body = vec![b'x'; 70 * 1024];
        let mut out = Vec::new();
        write_chunked(&mut out, &body).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("10000\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn spill_body_streams_without_patches() {
        let mut body = SpillBuffer::new();
        body.push(b"hello spill world").await.unwrap();
        let mut out = Vec::new();
        write_encapsulated_spill(
            &mut out,
            "t",
            Side::Response,
            b"HTTP/1.1 200 OK\r\n\r\n",
            &mut body,
            &[],
            &[],
        )
        .await
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Encapsulated: res-hdr=0, res-body=19\r\n"));
        assert!(text.contains("11\r\nhello spill world\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn spill_body_grafts_patched_head_and_tail() {
        let mut body = SpillBuffer::new();
        body.push(b"secret middle secret").await.unwrap();
        let mut out = Vec::new();
        write_encapsulated_spill(
            &mut out,
            "t",
            Side::Response,
            b"HTTP/1.1 200 OK\r\n\r\n",
            &mut body,
            b"******",
            b"******",
        )
        .await
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        // Same total length, middle untouched, both spans replaced.
        assert!(text.contains("6\r\n******\r\n8\r\n middle \r\n6\r\n******\r\n0\r\n\r\n"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn blocked_http_names_id_and_command_but_not_pattern_in_body() {
        let blocked = sample_blocked();
        let (head, body) = blocked_http(&blocked);
        let head = String::from_utf8(head).unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(head.contains("403 Forbidden"));
        assert!(head.contains(&format!("X-Tollgate-Request-Id: {}\r\n", blocked.request_id)));
        assert!(head.contains("X-Tollgate-Pattern: anthropic-api-key\r\n"));
        assert!(body.contains(&format!("tollgate approve {}", blocked.request_id)));
        assert!(!body.contains("anthropic-api-key"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
    }

    #[test]
    fn denied_http_has_no_request_id() {
        let (head, _) = denied_http("malware_detected", "Eicar-Test-Signature");
        let head = String::from_utf8(head).unwrap();
        assert!(!head.contains("X-Tollgate-Request-Id"));
        assert!(head.contains("X-Tollgate-Reason: malware_detected\r\n"));
    }
}
