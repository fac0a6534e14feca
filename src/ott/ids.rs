//! Request-id and token newtypes.
//!
//! Both shapes are validated on every parse, so malformed text is rejected
//! before any store access. Minting draws from the OS CSPRNG only; if that
//! fails the request fails, there is no fallback generator.

use std::fmt;
use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

const BASE62: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn request_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^req-[a-f0-9]{8}$").unwrap())
}

fn ott_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ott-[A-Za-z0-9]{8}$").unwrap())
}

/// Identifier of a blocked request, `req-` plus 8 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    pub fn parse(s: &str) -> Result<Self> {
        if request_id_re().is_match(s) {
            Ok(RequestId(s.to_string()))
        } else {
            Err(TollgateError::Validation("malformed request id".to_string()))
        }
    }

    /// Mint a fresh id from 4 CSPRNG bytes.
    pub fn mint() -> Result<Self> {
        let mut bytes = [0u8; 4];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| TollgateError::Crypto(format!("CSPRNG unavailable: {}", e)))?;
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(RequestId(format!("req-{}", hex)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RequestId {
    type Error = TollgateError;

    fn try_from(s: String) -> Result<Self> {
        RequestId::parse(&s)
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> String {
        id.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A one-time token code, `ott-` plus 8 base62 characters. Same rendered
/// length as a request id, so the in-place rewrite preserves framing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OttCode(String);

impl OttCode {
    pub fn parse(s: &str) -> Result<Self> {
        if ott_code_re().is_match(s) {
            Ok(OttCode(s.to_string()))
        } else {
            Err(TollgateError::Validation("malformed token code".to_string()))
        }
    }

    /// Mint a fresh code, 8 base62 characters drawn by rejection sampling
    /// so every character is uniform.
    pub fn mint() -> Result<Self> {
        let mut chars = String::with_capacity(8);
        let mut buf = [0u8; 16];
        while chars.len() < 8 {
            OsRng
                .try_fill_bytes(&mut buf)
                .map_err(|e| TollgateError::Crypto(format!("CSPRNG unavailable: {}", e)))?;
            for b in buf {
                // 248 is the largest multiple of 62 below 256.
                if b < 248 && chars.len() < 8 {
                    chars.push(BASE62[(b % 62) as usize] as char);
                }
            }
        }
        Ok(OttCode(format!("ott-{}", chars)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OttCode {
    type Error = TollgateError;

    fn try_from(s: String) -> Result<Self> {
        OttCode::parse(&s)
    }
}

impl From<OttCode> for String {
    fn from(code: OttCode) -> String {
        code.0
    }
}

impl fmt::Display for OttCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
