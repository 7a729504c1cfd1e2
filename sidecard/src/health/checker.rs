use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use async_trait::async_trait;
use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::process::Command;

/// How an instance is checked, as configured by its discovery source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CheckSpec {
    /// Any 2xx response is healthy
    HttpGet { url: String },
    /// A completed TCP connect is healthy
    Tcp { addr: String },
    /// Exit status zero is healthy
    External {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    AlwaysSuccessful,
}

/// A single check of one instance. The monitor bounds every call with its
/// own timeout, so implementations need not.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Shared so that many instances reuse one connection pool.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(Client::new)
}

pub fn build_checker(spec: &CheckSpec) -> Arc<dyn HealthChecker> {
    match spec {
        CheckSpec::HttpGet { url } => Arc::new(HttpGetChecker {
            url: url.clone(),
            client: shared_client().clone(),
        }),
        CheckSpec::Tcp { addr } => Arc::new(TcpChecker { addr: addr.clone() }),
        CheckSpec::External { command, args } => Arc::new(ExternalChecker {
            command: command.clone(),
            args: args.clone(),
        }),
        CheckSpec::AlwaysSuccessful => Arc::new(AlwaysSuccessful),
    }
}

pub struct HttpGetChecker {
    url: String,
    client: Client,
}

#[async_trait]
impl HealthChecker for HttpGetChecker {
    async fn check(&self) -> Result<()> {
        self.client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned an error status", self.url))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("HttpGet {}", self.url)
    }
}

pub struct TcpChecker {
    addr: String,
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> Result<()> {
        TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connect to {} failed", self.addr))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Tcp {}", self.addr)
    }
}

pub struct ExternalChecker {
    command: String,
    args: Vec<String>,
}

#[async_trait]
impl HealthChecker for ExternalChecker {
    async fn check(&self) -> Result<()> {
        let status = Command::new(&self.command)
            .args(&self.args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to run {}", self.command))?;

        if !status.success() {
            bail!("{} exited with {}", self.command, status);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("External {} {}", self.command, self.args.join(" "))
    }
}

pub struct AlwaysSuccessful;

#[async_trait]
impl HealthChecker for AlwaysSuccessful {
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "AlwaysSuccessful".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_check_spec_json_shape() {
        let spec: CheckSpec = serde_json::from_str(r#"{"type":"External","command":"true"}"#).unwrap();
        assert_eq!(spec, CheckSpec::External { command: "true".to_string(), args: Vec::new() });

        let spec: CheckSpec = serde_json::from_str(r#"{"type":"AlwaysSuccessful"}"#).unwrap();
        assert_eq!(spec, CheckSpec::AlwaysSuccessful);
    }

    #[tokio::test]
    async fn test_tcp_checker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ok = build_checker(&CheckSpec::Tcp { addr: addr.to_string() });
        assert!(ok.check().await.is_ok());

        drop(listener);
        let refused = build_checker(&CheckSpec::Tcp { addr: addr.to_string() });
        assert!(refused.check().await.is_err());
    }

    #[tokio::test]
    async fn test_http_checker_status_codes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for status in ["200 OK", "503 Service Unavailable"] {
                let (mut conn, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = conn.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status
                );
                conn.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let checker = build_checker(&CheckSpec::HttpGet { url: format!("http://{}/health", addr) });
        assert!(checker.check().await.is_ok());
        assert!(checker.check().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_checker_exit_status() {
        let ok = build_checker(&CheckSpec::External { command: "true".to_string(), args: Vec::new() });
        assert!(ok.check().await.is_ok());

        let failing = build_checker(&CheckSpec::External { command: "false".to_string(), args: Vec::new() });
        assert!(failing.check().await.is_err());
    }
}
