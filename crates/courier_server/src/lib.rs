use anyhow::Context as _;
use std::net::SocketAddr;
use std::path::PathBuf;

mod hub;
mod session;
pub mod server;

pub use hub::{Hub, HubRegistry};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub workspace_code: String,
    pub shared_pin: String,
    pub session_secret: String,
    pub dev_mode: bool,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path = std::env::var_os("COURIER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("courier.db"));

        let workspace_code =
            required_env("COURIER_WORKSPACE_CODE").context("missing COURIER_WORKSPACE_CODE")?;
        let shared_pin = required_env("COURIER_SHARED_PIN").context("missing COURIER_SHARED_PIN")?;
        let session_secret =
            required_env("COURIER_SESSION_SECRET").context("missing COURIER_SESSION_SECRET")?;

        let dev_mode = std::env::var("COURIER_DEV_MODE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            db_path,
            workspace_code,
            shared_pin,
            session_secret,
            dev_mode,
        })
    }
}

fn required_env(name: &str) -> anyhow::Result<String> {
    let value = std::env::var(name).with_context(|| format!("{name} is not set"))?;
    let value = value.trim().to_owned();
    if value.is_empty() {
        anyhow::bail!("{name} is empty");
    }
    Ok(value)
}

pub struct StartedServer {
    pub addr: SocketAddr,
    handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

impl StartedServer {
    pub async fn wait(self) -> anyhow::Result<()> {
        let mut this = self;
        let handle = this.handle.take().context("server task already consumed")?;

        handle
            .await
            .context("server task panicked")?
            .context("server failed")?;
        Ok(())
    }
}

impl Drop for StartedServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub async fn start_server(addr: SocketAddr) -> anyhow::Result<StartedServer> {
    start_server_with_config(addr, ServerConfig::from_env()?).await
}

pub async fn start_server_with_config(
    addr: SocketAddr,
    config: ServerConfig,
) -> anyhow::Result<StartedServer> {
    let app = server::router(config)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let actual = listener.local_addr().context("failed to read local addr")?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.context("server failed")?;
        Ok(())
    });

    Ok(StartedServer {
        addr: actual,
        handle: Some(handle),
    })
}
