//! # RESP TCP Server
//!
//! Purpose: Accept RESP2 connections and hand each parsed command to the
//! `Dispatcher`. One task per connection; no shared mutable state beyond what
//! `Dispatcher`/`Node` already guard internally.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::node::Node;
use crate::protocol::{RespError, RespParser};

const READ_CHUNK: usize = 8 * 1024;

/// Binds `addr` and serves RESP connections until the listener errors out or
/// the process is asked to shut down.
pub async fn serve(node: Arc<Node>, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "resp server listening");
    serve_listener(node, listener).await
}

/// Serves RESP connections off an already-bound listener. Split out of
/// `serve` so tests can bind an ephemeral port, read back its real address,
/// and hand the listener in rather than guessing a free port up front.
pub async fn serve_listener(node: Arc<Node>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = Arc::new(Dispatcher::new(node.clone()));
        tokio::spawn(async move {
            debug!(%peer, "resp connection accepted");
            if let Err(err) = handle_connection(stream, dispatcher).await {
                warn!(%peer, %err, "resp connection closed with error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut parser = RespParser::new();

    loop {
        let bytes_read = stream.read_buf(&mut buffer).await?;
        if bytes_read == 0 {
            return Ok(());
        }

        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    if args.is_empty() {
                        continue;
                    }
                    let response = dispatcher.dispatch(&args);
                    stream.write_all(&response).await?;
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    stream.write_all(b"-ERR protocol error\r\n").await?;
                    return Ok(());
                }
            }
        }
    }
}
