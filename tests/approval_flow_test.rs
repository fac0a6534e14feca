//! End-to-end one-time-token flow: block, arm, gate, approve, release.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tollgate::config::AppConfig;
use tollgate::dlp::SecurityLevel;
use tollgate::icap::IcapServer;
use tollgate::state::AppState;
use tollgate::store::{MemoryStore, PolicyStore, AUDIT_LOG_KEY};

const FIXTURE: &str = r#"
[icap]
listen = "127.0.0.1:0"

[scanner]
address = "SCANNER_ADDR"
timeout_secs = 2

[store]
mode = "memory"

[ott]
time_gate_secs = 2

[[patterns]]
name = "anthropic"
credential = "sk-ant-[A-Za-z0-9_-]{20,}"
allow_domains = "(^|\\.)api\\.anthropic\\.com$"

[domains]
known_suffixes = [".anthropic.com"]
"#;

async fn spawn_clean_scanner() -> String {
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
                loop {
                    let mut len_buf = [0u8; 4];
                    socket.read_exact(&mut len_buf).await.unwrap();
                    let len = u32::from_be_bytes(len_buf) as usize;
                    if len == 0 {
                        break;
                    }
                    let mut chunk = vec![0u8; len];
                    socket.read_exact(&mut chunk).await.unwrap();
                }
                socket.write_all(b"stream: OK\n").await.unwrap();
            });
        }
    });
    addr
}

async fn send_icap(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

fn chunked(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n0\r\n\r\n");
    out
}

fn reqmod(host: &str, body: &[u8]) -> Vec<u8> {
    let http_head = format!(
        "POST /messages HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n\r\n",
        host,
        body.len()
    );
    let mut out = format!(
        "REQMOD icap://gw/tollgate ICAP/1.0\r\nHost: gw\r\nAllow: 204\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n",
        http_head.len()
    )
    .into_bytes();
    out.extend_from_slice(http_head.as_bytes());
    out.extend_from_slice(&chunked(body));
    out
}

fn respmod(host: &str, body: &[u8]) -> Vec<u8> {
    let req_head = format!("GET /inbox HTTP/1.1\r\nHost: {}\r\n\r\n", host);
    let res_head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    let mut out = format!(
        "RESPMOD icap://gw/tollgate ICAP/1.0\r\nHost: gw\r\nAllow: 204\r\nEncapsulated: req-hdr=0, res-hdr={}, res-body={}\r\n\r\n",
        req_head.len(),
        req_head.len() + res_head.len()
    )
    .into_bytes();
    out.extend_from_slice(req_head.as_bytes());
    out.extend_from_slice(res_head.as_bytes());
    out.extend_from_slice(&chunked(body));
    out
}

#[tokio::test]
async fn blocked_request_is_released_through_token_approval() {
    let scanner = spawn_clean_scanner().await;
    let toml = FIXTURE.replace("SCANNER_ADDR", &scanner);
    let config = AppConfig::from_toml(&toml).unwrap();
    let mem = Arc::new(MemoryStore::new());
    let store: Arc<dyn PolicyStore> = Arc::clone(&mem) as Arc<dyn PolicyStore>;
    let state = AppState::with_store(config, store).unwrap();
    // Keep domain novelty out of the way; this exercises the token flow.
    state.security.set(SecurityLevel::Relaxed);
    let addr = IcapServer::new(Arc::clone(&state)).start().await.unwrap();

    let credential_body = b"payload with x-api-key: sk-ant-REDACTED";

    // 1. Credential to a foreign destination is blocked; capture the id.
    let blocked = send_icap(addr, &reqmod("chat.partner.example", credential_body)).await;
    assert!(blocked.contains("403 Forbidden"), "{}", blocked);
    let id_re = Regex::new(r"req-[a-f0-9]{8}").unwrap();
    let request_id = id_re.find(&blocked).unwrap().as_str().to_string();

    // 2. The agent relays the operator command outbound; the gateway arms
    //    a token and substitutes it into the forwarded body.
    let command_body = format!("operator says: tollgate approve {}", request_id);
    let armed = send_icap(addr, &reqmod("chat.partner.example", command_body.as_bytes())).await;
    assert!(armed.contains("ICAP/1.0 200 OK"), "{}", armed);
    assert!(!armed.contains(&request_id), "id must be substituted: {}", armed);
    let ott_re = Regex::new(r"ott-[A-Za-z0-9]{8}").unwrap();
    let token = ott_re.find(&armed).unwrap().as_str().to_string();

    // 3. An immediate echo of the token is rejected by the time gate, and
    //    the token text is redacted from what the agent sees.
    let echo = send_icap(addr, &respmod("chat.partner.example", token.as_bytes())).await;
    assert!(echo.contains("ICAP/1.0 200 OK"), "{}", echo);
    assert!(!echo.contains(&token), "token must be redacted: {}", echo);
    assert!(echo.contains("ott-********"), "{}", echo);
    assert!(
        !state.ott.is_host_approved("chat.partner.example").await.unwrap(),
        "gate must hold before it elapses"
    );

    // 4. After the gate, a token from the wrong origin is still rejected.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    let wrong = send_icap(addr, &respmod("attacker.example", token.as_bytes())).await;
    assert!(!wrong.contains(&token), "{}", wrong);
    assert!(
        !state.ott.is_host_approved("chat.partner.example").await.unwrap(),
        "wrong origin must not approve"
    );

    // 5. From the bound origin the token approves, once.
    let approve_body = format!("confirmation {}", token);
    let approved = send_icap(addr, &respmod("chat.partner.example", approve_body.as_bytes())).await;
    assert!(!approved.contains(&token), "{}", approved);
    assert!(state.ott.is_host_approved("chat.partner.example").await.unwrap());

    // 6. The original request now passes while the marker lasts.
    let released = send_icap(addr, &reqmod("chat.partner.example", credential_body)).await;
    assert!(released.contains("204 No Content"), "{}", released);

    // 7. The audit trail shows the whole life cycle in order, with the
    //    archived evidence on the approval entry.
    let events: Vec<serde_json::Value> = mem
        .list(AUDIT_LOG_KEY)
        .await
        .iter()
        .map(|e| serde_json::from_str(e).unwrap())
        .collect();
    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["request_blocked", "token_armed", "approved"]);
    assert_eq!(events[2]["archived"]["request_id"], request_id);
    assert_eq!(events[2]["origin_host"], "chat.partner.example");

    // 8. A replay of the consumed token is a silent no-op.
    let replay = send_icap(addr, &respmod("chat.partner.example", approve_body.as_bytes())).await;
    assert!(!replay.contains(&token), "{}", replay);
    let count_after = mem.list(AUDIT_LOG_KEY).await.len();
    assert_eq!(count_after, 3, "replay must not add audit entries");
}
