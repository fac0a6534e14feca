//! ICAP service front end.
//!
//! Listens for proxy connections and serves OPTIONS, REQMOD, and RESPMOD
//! over each one until the peer closes. Framing errors answer
//! `400 Bad Request` and drop the connection; adaptation semantics live
//! in [`handler`].

pub mod body;
pub mod handler;
pub mod http;
pub mod parser;
pub mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::error::{Result, TollgateError};
use crate::state::AppState;
use parser::IcapMethod;

pub struct IcapServer {
    state: Arc<AppState>,
}

impl IcapServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Bind the listener and start serving. Returns the actual bound
    /// address, useful when the configured port is 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.state.config.icap.listen)
            .await
            .map_err(TollgateError::Io)?;
        let local_addr = listener.local_addr().map_err(TollgateError::Io)?;
        info!("tollgate ICAP service listening on {}", local_addr);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            accept_loop(listener, state).await;
        });

        Ok(local_addr)
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        error!("connection from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
            }
        }
    }
}

/// Serve one proxy connection until clean close or error.
async fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);
    let istag = state.config.icap.istag.clone();

    loop {
        let req = match parser::read_icap_request(&mut reader).await {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(e) => {
                // Best effort; the connection is torn down either way.
                let _ = response::write_bad_request(&mut writer, &istag).await;
                return Err(e);
            }
        };

        let served = match req.method {
            IcapMethod::Options => {
                response::write_options(
                    &mut writer,
                    &istag,
                    &state.config.icap.service,
                    state.config.icap.preview,
                )
                .await
            }
            IcapMethod::ReqMod => {
                handler::handle_reqmod(&mut reader, &mut writer, &state, &req).await
            }
            IcapMethod::RespMod => {
                handler::handle_respmod(&mut reader, &mut writer, &state, &req).await
            }
        };

        if let Err(e) = served {
            if matches!(e, TollgateError::Protocol(_)) {
                let _ = response::write_bad_request(&mut writer, &istag).await;
            }
            return Err(e);
        }
    }
}
