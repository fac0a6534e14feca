//! Scan-backend client.
//!
//! Speaks the scanner daemon's stream protocol: a fixed handshake, then the
//! body in fixed-size chunks each prefixed by a 4-byte big-endian length,
//! terminated by a zero-length chunk, answered with a single-line textual
//! verdict containing `OK` or `FOUND <name>`. Every call runs under the
//! configured per-call timeout and through the shared [`CircuitBreaker`].

pub mod breaker;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ScannerConfig;
use crate::error::{Result, TollgateError};
use breaker::CircuitBreaker;

/// Opening handshake selecting the length-prefixed stream command.
const HANDSHAKE: &[u8] = b"zINSTREAM\0";

/// Scanner verdict for one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    /// Signature name reported by the daemon.
    Infected(String),
}

/// Circuit-breaker-wrapped client for one scan backend.
pub struct ScanClient {
    config: ScannerConfig,
    breaker: CircuitBreaker,
}

impl ScanClient {
    pub fn new(config: ScannerConfig) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold, config.cooldown());
        Self { config, breaker }
    }

    /// Scan a buffer. `Err(CircuitOpen)` means no connection was attempted.
    pub async fn scan(&self, body: &[u8]) -> Result<ScanVerdict> {
        if !self.breaker.try_acquire() {
            return Err(TollgateError::CircuitOpen);
        }
        match timeout(self.config.timeout(), self.scan_stream(body)).await {
            Ok(Ok(verdict)) => {
                self.breaker.record_success();
                Ok(verdict)
            }
            Ok(Err(e)) => {
                warn!("scan backend call failed: {}", e);
                self.breaker.record_failure();
                Err(e)
            }
            Err(_) => {
                warn!("scan backend call timed out");
                self.breaker.record_failure();
                Err(TollgateError::ScanBackend(format!(
                    "timeout after {}s",
                    self.config.timeout_secs
                )))
            }
        }
    }

    /// Breaker state, for diagnostics and tests.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn scan_stream(&self, body: &[u8]) -> Result<ScanVerdict> {
        let stream = TcpStream::connect(&self.config.address)
            .await
            .map_err(|e| TollgateError::ScanBackend(format!("connect: {}", e)))?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(HANDSHAKE)
            .await
            .map_err(|e| TollgateError::ScanBackend(format!("handshake: {}", e)))?;

        for chunk in body.chunks(self.config.chunk_size.max(1)) {
            let len = (chunk.len() as u32).to_be_bytes();
            write_half
                .write_all(&len)
                .await
                .map_err(|e| TollgateError::ScanBackend(format!("chunk header: {}", e)))?;
            write_half
                .write_all(chunk)
                .await
                .map_err(|e| TollgateError::ScanBackend(format!("chunk body: {}", e)))?;
        }
        write_half
            .write_all(&0u32.to_be_bytes())
            .await
            .map_err(|e| TollgateError::ScanBackend(format!("terminator: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| TollgateError::ScanBackend(format!("flush: {}", e)))?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| TollgateError::ScanBackend(format!("verdict read: {}", e)))?;
        if n == 0 {
            return Err(TollgateError::ScanBackend(
                "connection closed before verdict".to_string(),
            ));
        }
        debug!("scanner verdict line: {}", line.trim_end());
        parse_verdict(&line)
    }
}

/// Classify the verdict line. `FOUND` wins over `OK` so a hit in a
/// multi-part line is never misread as clean.
fn parse_verdict(line: &str) -> Result<ScanVerdict> {
    let line = line.trim_end_matches(['\r', '\n', '\0']);
    if let Some(pos) = line.rfind(" FOUND") {
        let before = &line[..pos];
        let name = before
            .rsplit(": ")
            .next()
            .unwrap_or(before)
            .trim()
            .to_string();
        return Ok(ScanVerdict::Infected(name));
    }
    if line.contains("OK") {
        return Ok(ScanVerdict::Clean);
    }
    Err(TollgateError::ScanBackend(format!(
        "unexpected verdict: {}",
        line
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(address: String) -> ScannerConfig {
        ScannerConfig {
            address,
            timeout_secs: 2,
            chunk_size: 8,
            failure_threshold: 2,
            cooldown_secs: 60,
            fail_open_domains: vec![],
        }
    }

    #[test]
    fn parses_ok_verdict() {
        assert_eq!(parse_verdict("stream: OK\n").unwrap(), ScanVerdict::Clean);
    }

    #[test]
    fn parses_found_verdict_with_name() {
        let v = parse_verdict("stream: Eicar-Test-Signature FOUND\n").unwrap();
        assert_eq!(v, ScanVerdict::Infected("Eicar-Test-Signature".to_string()));
    }

    #[test]
    fn found_wins_over_ok_in_the_same_line() {
        let v = parse_verdict("stream: LOOKS-OK-BUT Eicar FOUND").unwrap();
        assert!(matches!(v, ScanVerdict::Infected(_)));
    }

    #[test]
    fn garbage_verdict_is_an_error() {
        assert!(parse_verdict("ERROR: size limit exceeded").is_err());
    }

    /// Mock daemon: validates framing, replies with a fixed verdict line.
    async fn spawn_mock_daemon(verdict: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut handshake = [0u8; 10];
                    socket.read_exact(&mut handshake).await.unwrap();
                    assert_eq!(&handshake, HANDSHAKE);
                    let mut received = Vec::new();
                    loop {
                        let mut len_buf = [0u8; 4];
                        socket.read_exact(&mut len_buf).await.unwrap();
                        let len = u32::from_be_bytes(len_buf) as usize;
                        if len == 0 {
                            break;
                        }
                        let mut chunk = vec![0u8; len];
                        socket.read_exact(&mut chunk).await.unwrap();
                        received.extend_from_slice(&chunk);
                    }
                    socket.write_all(verdict.as_bytes()).await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn clean_scan_round_trip() {
        let addr = spawn_mock_daemon("stream: OK\n").await;
        let client = ScanClient::new(test_config(addr));
        // 20 bytes across chunk_size=8 exercises the chunking path.
        let verdict = client.scan(b"hello scanner daemon").await.unwrap();
        assert_eq!(verdict, ScanVerdict::Clean);
        assert_eq!(client.breaker().state(), breaker::CircuitState::Closed);
    }

    #[tokio::test]
    async fn infected_scan_reports_signature() {
        let addr = spawn_mock_daemon("stream: Eicar-Test-Signature FOUND\n").await;
        let client = ScanClient::new(test_config(addr));
        let verdict = client.scan(b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$").await.unwrap();
        assert_eq!(verdict, ScanVerdict::Infected("Eicar-Test-Signature".to_string()));
    }

    #[tokio::test]
    async fn consecutive_failures_open_the_circuit() {
        // Nothing listens on this address.
        let client = ScanClient::new(test_config("127.0.0.1:1".to_string()));
        assert!(client.scan(b"x").await.is_err());
        assert!(client.scan(b"x").await.is_err());
        assert_eq!(client.breaker().state(), breaker::CircuitState::Open);
        // Third call is rejected without a connection attempt.
        match client.scan(b"x").await {
            Err(TollgateError::CircuitOpen) => {}
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_body_sends_only_the_terminator() {
        let addr = spawn_mock_daemon("stream: OK\n").await;
        let client = ScanClient::new(test_config(addr));
        let verdict = client.scan(b"").await.unwrap();
        assert_eq!(verdict, ScanVerdict::Clean);
    }
}
