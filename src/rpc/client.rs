//! Outbound peer calls.
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::read_frame;
use super::write_frame;
use super::Envelope;
use super::Response;
use crate::error::Error;
use crate::error::Result;

/// A bidirectional request/response channel with a per-call deadline.
/// The TCP implementation backs deployments; tests wire nodes together
/// in-process behind the same trait.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, to: SocketAddr, envelope: Envelope) -> Result<Response>;
}

/// One connection per call, the whole exchange bounded by `timeout`.
#[derive(Clone, Debug)]
pub struct TcpClient {
    timeout: Duration,
}

impl TcpClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RpcClient for TcpClient {
    async fn call(&self, to: SocketAddr, envelope: Envelope) -> Result<Response> {
        let exchange = async {
            let mut stream = TcpStream::connect(to)
                .await
                .map_err(|e| Error::RpcUnreachable(format!("{to}: {e}")))?;
            write_frame(&mut stream, &envelope).await?;
            read_frame::<_, Response>(&mut stream).await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(res) => res,
            Err(_) => Err(Error::RpcTimeout),
        }
    }
}

/// Map IO-shaped failures onto the retryable error kinds callers branch on.
pub fn is_unreachable(err: &Error) -> bool {
    matches!(
        err,
        Error::RpcTimeout | Error::RpcUnreachable(_) | Error::IOError(_)
    )
}
