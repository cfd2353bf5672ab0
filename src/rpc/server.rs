//! Inbound RPC accept loop.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use super::read_frame;
use super::write_frame;
use super::Envelope;
use super::Response;
use crate::error::Result;

/// Whatever sits behind the RPC surface. The node implements this; the
/// server stays a dumb framing loop.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Response;
}

/// Accept connections forever, one task per connection. Errors on a single
/// connection are logged and dropped; the loop itself only ends with the
/// process.
pub async fn serve(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler).await {
                tracing::debug!("connection from {} closed: {}", peer, e);
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn RequestHandler>) -> Result<()> {
    let envelope: Envelope = read_frame(&mut stream).await?;
    let response = handler.handle(envelope).await;
    write_frame(&mut stream, &response).await
}
