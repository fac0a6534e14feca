//! Per-request adaptation logic.
//!
//! REQMOD inspects outbound request bodies: credential and domain policy
//! first, then the approval-command rewrite. RESPMOD inspects inbound
//! response bodies: decompression guard, malware scan, then the token
//! approval and redaction pass. Both directions answer `204 No Content`
//! when nothing changed and the client allows it.
//!
//! Fail-closed is the default: a scan error or an unreachable policy
//! store withholds content. The only fail-open path is a scan error on a
//! destination under the configured trusted-download suffixes, and that
//! path is audited.

use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, warn};

use crate::audit::AuditEvent;
use crate::decompress;
use crate::dlp::DlpDecision;
use crate::error::{Result, TollgateError};
use crate::icap::body::{BoundedBuffer, SpillBuffer};
use crate::icap::parser::{
    read_chunk, read_header_sections, ChunkEnd, ChunkItem, IcapRequest, SectionKind,
};
use crate::icap::http::HttpHead;
use crate::icap::response::{self, Side};
use crate::scan::ScanVerdict;
use crate::state::AppState;

/// Read an encapsulated chunked body, honoring preview negotiation: when
/// the preview segment ends without `ieof`, answer `100 Continue` and
/// read the remainder.
async fn read_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    req: &IcapRequest,
    spill: &mut SpillBuffer,
    bounded: Option<&mut BoundedBuffer>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bounded = bounded;
    let mut continued = false;
    loop {
        match read_chunk(reader).await? {
            ChunkItem::Data(data) => {
                spill.push(&data).await?;
                if let Some(b) = bounded.as_deref_mut() {
                    b.push(&data);
                }
            }
            ChunkItem::End(ChunkEnd::PreviewIeof) => return Ok(()),
            ChunkItem::End(ChunkEnd::Final) => {
                if req.preview().is_some() && !continued {
                    // Preview exhausted without ieof: ask for the rest.
                    response::write_continue(writer).await?;
                    continued = true;
                    continue;
                }
                return Ok(());
            }
        }
    }
}

fn find_section(sections: &[(SectionKind, Vec<u8>)], kind: SectionKind) -> Option<&[u8]> {
    sections
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, b)| b.as_slice())
}

pub async fn handle_reqmod<R, W>(
    reader: &mut R,
    writer: &mut W,
    state: &AppState,
    req: &IcapRequest,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let istag = &state.config.icap.istag;
    let sections = read_header_sections(reader, &req.encapsulated).await?;
    let head_bytes = find_section(&sections, SectionKind::ReqHdr)
        .ok_or_else(|| TollgateError::Protocol("REQMOD without req-hdr".to_string()))?
        .to_vec();
    let http = HttpHead::parse(&head_bytes)?;
    let host = http.host().unwrap_or_default();

    let mut spill = SpillBuffer::new();
    let mut bounded = BoundedBuffer::new(&state.config.limits);
    let has_body = req.body_kind() == Some(SectionKind::ReqBody);
    if has_body {
        read_body(reader, writer, req, &mut spill, Some(&mut bounded)).await?;
    }
    let body = bounded.window();
    let oversized = bounded.truncated();
    if oversized {
        debug!(
            "request to {} oversized ({} bytes); inspecting capped window",
            host,
            bounded.total()
        );
    }

    let level = state.security.get();
    let decision = state.dlp.evaluate(&body, &host, level);
    let verdict = match decision {
        DlpDecision::Allow => None,
        DlpDecision::Block { reason, pattern } => Some((reason, pattern)),
        DlpDecision::Prompt { reason } => Some((reason, None)),
    };
    if let Some((reason, pattern)) = verdict {
        let approved = match state.ott.is_host_approved(&host).await {
            Ok(v) => v,
            Err(e) => {
                warn!("approval marker lookup for {} failed: {}", host, e);
                false
            }
        };
        if !approved {
            return match state.ott.block(&host, &reason, pattern.as_deref()).await {
                Ok(blocked) => {
                    let (http_head, http_body) = response::blocked_http(&blocked);
                    response::write_encapsulated(
                        writer,
                        istag,
                        Side::Response,
                        &http_head,
                        Some(&http_body),
                    )
                    .await
                }
                Err(e) => {
                    // Store down: still withhold, just without a record.
                    warn!("block record for {} failed: {}", host, e);
                    let (http_head, http_body) =
                        response::denied_http(&reason, "policy store unavailable");
                    response::write_encapsulated(
                        writer,
                        istag,
                        Side::Response,
                        &http_head,
                        Some(&http_body),
                    )
                    .await
                }
            };
        }
        debug!("destination {} carries an approval marker; allowing", host);
    }

    let rewritten = if oversized {
        // Approval commands are short operator messages; nothing to arm
        // inside a payload past the scan cap.
        None
    } else {
        match state.ott.rewrite_pass(&body, &host).await {
            Ok(r) => r,
            Err(e) => {
                // Arming failed; the command text passes through unrewritten
                // and no token exists, so nothing can be approved with it.
                warn!("rewrite pass for {} failed: {}", host, e);
                None
            }
        }
    };

    match rewritten {
        Some(new_body) => {
            // Substitution is length-preserving, so the original head
            // (and its Content-Length) still fits.
            response::write_encapsulated(writer, istag, Side::Request, &head_bytes, Some(&new_body))
                .await
        }
        None if req.allow_204() => response::write_no_content(writer, istag).await,
        None if oversized => {
            response::write_encapsulated_spill(
                writer,
                istag,
                Side::Request,
                &head_bytes,
                &mut spill,
                &[],
                &[],
            )
            .await
        }
        None => {
            let body_opt = has_body.then_some(body.as_slice());
            response::write_encapsulated(writer, istag, Side::Request, &head_bytes, body_opt).await
        }
    }
}

pub async fn handle_respmod<R, W>(
    reader: &mut R,
    writer: &mut W,
    state: &AppState,
    req: &IcapRequest,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let istag = &state.config.icap.istag;
    let sections = read_header_sections(reader, &req.encapsulated).await?;
    let res_head_bytes = find_section(&sections, SectionKind::ResHdr)
        .ok_or_else(|| TollgateError::Protocol("RESPMOD without res-hdr".to_string()))?
        .to_vec();
    let res_http = HttpHead::parse(&res_head_bytes)?;
    let host = find_section(&sections, SectionKind::ReqHdr)
        .and_then(|raw| HttpHead::parse(raw).ok())
        .and_then(|h| h.host())
        .unwrap_or_default();

    let has_body = req.body_kind() == Some(SectionKind::ResBody);
    if !has_body {
        return if req.allow_204() {
            response::write_no_content(writer, istag).await
        } else {
            response::write_encapsulated(writer, istag, Side::Response, &res_head_bytes, None)
                .await
        };
    }

    let mut spill = SpillBuffer::new();
    let mut bounded = BoundedBuffer::new(&state.config.limits);
    read_body(reader, writer, req, &mut spill, Some(&mut bounded)).await?;
    let window = bounded.window();
    let oversized = bounded.truncated();
    if oversized {
        debug!(
            "response from {} oversized ({} bytes); inspecting capped window",
            host,
            bounded.total()
        );
    }

    // Decompression guard. A bomb, an undecodable stream, or a gzip body
    // past the scan cap leaves the payload opaque: no token pass, original
    // bytes forwarded.
    let was_gzip = res_http.is_gzip_encoded() || decompress::is_gzip(&window);
    let mut opaque = false;
    let decoded = if was_gzip && oversized {
        debug!("gzip body from {} exceeds the scan cap; leaving opaque", host);
        opaque = true;
        None
    } else if was_gzip && !window.is_empty() {
        match decompress::inflate_bounded(&window, &state.config.limits) {
            Ok(plain) => Some(plain),
            Err(TollgateError::DecompressionBomb {
                consumed,
                produced,
                limit,
            }) => {
                warn!(
                    "decompression bomb from {}: {} -> {} bytes ({}); skipping content passes",
                    host, consumed, produced, limit
                );
                opaque = true;
                None
            }
            Err(e) => {
                debug!("gzip decode from {} failed ({}); treating as opaque", host, e);
                opaque = true;
                None
            }
        }
    } else {
        None
    };

    // Malware scan over the (possibly capped) raw window.
    if !window.is_empty() {
        match state.scanner.scan(&window).await {
            Ok(ScanVerdict::Clean) => {}
            Ok(ScanVerdict::Infected(signature)) => {
                state
                    .audit
                    .append(AuditEvent::ScanInfected {
                        destination: host.clone(),
                        signature: signature.clone(),
                    })
                    .await?;
                let (http_head, http_body) = response::denied_http("malware_detected", &signature);
                return response::write_encapsulated(
                    writer,
                    istag,
                    Side::Response,
                    &http_head,
                    Some(&http_body),
                )
                .await;
            }
            Err(e) => {
                if state.fail_open.contains(&host) {
                    state
                        .audit
                        .append(AuditEvent::ScanFailOpen {
                            destination: host.clone(),
                            detail: e.to_string(),
                        })
                        .await?;
                    warn!("scan unavailable for trusted host {}; passing through", host);
                } else {
                    warn!("scan unavailable for {}; withholding content: {}", host, e);
                    let (http_head, http_body) =
                        response::denied_http("scan_unavailable", "content could not be scanned");
                    return response::write_encapsulated(
                        writer,
                        istag,
                        Side::Response,
                        &http_head,
                        Some(&http_body),
                    )
                    .await;
                }
            }
        }
    }

    // Token approval and redaction over the cleartext. An oversized body
    // is inspected through its window; redacted spans are grafted back
    // over the streamed original, which the length-preserving
    // substitution makes safe.
    let mut out_body: Option<Vec<u8>> = None;
    let mut patches: Option<(Vec<u8>, Vec<u8>)> = None;
    if !opaque {
        if oversized {
            match state.ott.approve_pass(&window, &host).await {
                Ok((redacted, _)) => {
                    if redacted != window {
                        let split = bounded.head_len();
                        patches =
                            Some((redacted[..split].to_vec(), redacted[split..].to_vec()));
                    }
                }
                Err(e) => {
                    warn!("approval pass for {} failed: {}", host, e);
                }
            }
        } else {
            let content = decoded.as_deref().unwrap_or(&window);
            match state.ott.approve_pass(content, &host).await {
                Ok((redacted, outcomes)) => {
                    if redacted != content {
                        debug!(
                            "redacted {} token span(s) in response from {}",
                            outcomes.len().max(1),
                            host
                        );
                        if decoded.is_some() {
                            // Re-encode; on failure forward the original
                            // compressed bytes (pre-substitution).
                            match decompress::gzip_compress(&redacted) {
                                Ok(re) => out_body = Some(re),
                                Err(e) => {
                                    warn!(
                                        "re-encode for {} failed: {}; forwarding original",
                                        host, e
                                    );
                                }
                            }
                        } else {
                            out_body = Some(redacted);
                        }
                    }
                }
                Err(e) => {
                    warn!("approval pass for {} failed: {}", host, e);
                }
            }
        }
    }

    match (out_body, patches) {
        (Some(new_body), _) => {
            let new_head = res_http.serialize_with_length(new_body.len() as u64);
            response::write_encapsulated(writer, istag, Side::Response, &new_head, Some(&new_body))
                .await
        }
        (None, Some((head_patch, tail_patch))) => {
            response::write_encapsulated_spill(
                writer,
                istag,
                Side::Response,
                &res_head_bytes,
                &mut spill,
                &head_patch,
                &tail_patch,
            )
            .await
        }
        (None, None) if req.allow_204() => response::write_no_content(writer, istag).await,
        (None, None) if oversized => {
            response::write_encapsulated_spill(
                writer,
                istag,
                Side::Response,
                &res_head_bytes,
                &mut spill,
                &[],
                &[],
            )
            .await
        }
        (None, None) => {
            response::write_encapsulated(
                writer,
                istag,
                Side::Response,
                &res_head_bytes,
                Some(&window),
            )
            .await
        }
    }
}
