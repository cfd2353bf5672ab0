//! Name directory.
//!
//! Nodes register themselves under stable symbolic names and look up
//! bootstrap peers here. The directory is an external collaborator: the
//! trait is the contract, the in-memory table backs tests and the TCP pair
//! backs deployments.
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use crate::error::Error;
use crate::error::Result;
use crate::rpc::read_frame;
use crate::rpc::write_frame;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn register(&self, name: &str, addr: SocketAddr) -> Result<()>;
    async fn lookup(&self, name: &str) -> Result<SocketAddr>;
    async fn list(&self, prefix: &str) -> Result<Vec<(String, SocketAddr)>>;
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Plain shared table.
#[derive(Debug, Default)]
pub struct MemDirectory {
    table: DashMap<String, SocketAddr>,
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for MemDirectory {
    async fn register(&self, name: &str, addr: SocketAddr) -> Result<()> {
        self.table.insert(name.to_string(), addr);
        Ok(())
    }

    async fn lookup(&self, name: &str) -> Result<SocketAddr> {
        self.table
            .get(name)
            .map(|e| *e.value())
            .ok_or_else(|| Error::NameNotFound(name.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, SocketAddr)>> {
        let mut entries: Vec<(String, SocketAddr)> = self
            .table
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.table.remove(name);
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum DirRequest {
    Register { name: String, addr: SocketAddr },
    Lookup { name: String },
    List { prefix: String },
    Remove { name: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum DirResponse {
    Ok,
    Addr(SocketAddr),
    Entries(Vec<(String, SocketAddr)>),
    NotFound,
}

/// Serve a directory over the shared frame codec.
pub async fn serve_directory(listener: TcpListener, directory: Arc<MemDirectory>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let directory = directory.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(stream, directory).await {
                tracing::debug!("directory connection from {} closed: {}", peer, e);
            }
        });
    }
}

async fn serve_one(mut stream: TcpStream, directory: Arc<MemDirectory>) -> Result<()> {
    let request: DirRequest = read_frame(&mut stream).await?;
    let response = match request {
        DirRequest::Register { name, addr } => {
            directory.register(&name, addr).await?;
            DirResponse::Ok
        }
        DirRequest::Lookup { name } => match directory.lookup(&name).await {
            Ok(addr) => DirResponse::Addr(addr),
            Err(_) => DirResponse::NotFound,
        },
        DirRequest::List { prefix } => DirResponse::Entries(directory.list(&prefix).await?),
        DirRequest::Remove { name } => {
            directory.remove(&name).await?;
            DirResponse::Ok
        }
    };
    write_frame(&mut stream, &response).await
}

/// Client side of the TCP directory.
#[derive(Clone, Debug)]
pub struct RemoteDirectory {
    addr: SocketAddr,
    timeout: std::time::Duration,
}

impl RemoteDirectory {
    pub fn new(addr: SocketAddr, timeout: std::time::Duration) -> Self {
        Self { addr, timeout }
    }

    async fn call(&self, request: DirRequest) -> Result<DirResponse> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| Error::RpcUnreachable(format!("{}: {e}", self.addr)))?;
            write_frame(&mut stream, &request).await?;
            read_frame::<_, DirResponse>(&mut stream).await
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(res) => res,
            Err(_) => Err(Error::RpcTimeout),
        }
    }
}

#[async_trait]
impl Directory for RemoteDirectory {
    async fn register(&self, name: &str, addr: SocketAddr) -> Result<()> {
        match self
            .call(DirRequest::Register {
                name: name.to_string(),
                addr,
            })
            .await?
        {
            DirResponse::Ok => Ok(()),
            _ => Err(Error::UnexpectedResponse("directory register")),
        }
    }

    async fn lookup(&self, name: &str) -> Result<SocketAddr> {
        match self
            .call(DirRequest::Lookup {
                name: name.to_string(),
            })
            .await?
        {
            DirResponse::Addr(addr) => Ok(addr),
            DirResponse::NotFound => Err(Error::NameNotFound(name.to_string())),
            _ => Err(Error::UnexpectedResponse("directory lookup")),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, SocketAddr)>> {
        match self
            .call(DirRequest::List {
                prefix: prefix.to_string(),
            })
            .await?
        {
            DirResponse::Entries(entries) => Ok(entries),
            _ => Err(Error::UnexpectedResponse("directory list")),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self
            .call(DirRequest::Remove {
                name: name.to_string(),
            })
            .await?
        {
            DirResponse::Ok => Ok(()),
            _ => Err(Error::UnexpectedResponse("directory remove")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mem_directory() {
        let dir = MemDirectory::new();
        let a: SocketAddr = "127.0.0.1:4500".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:4501".parse().unwrap();

        dir.register("mapring.node.aa", a).await.unwrap();
        dir.register("mapring.node.bb", b).await.unwrap();

        assert_eq!(dir.lookup("mapring.node.aa").await.unwrap(), a);
        assert!(matches!(
            dir.lookup("mapring.node.cc").await,
            Err(Error::NameNotFound(_))
        ));

        let nodes = dir.list("mapring.node.").await.unwrap();
        assert_eq!(nodes.len(), 2);

        dir.remove("mapring.node.aa").await.unwrap();
        assert!(dir.lookup("mapring.node.aa").await.is_err());
    }
}
