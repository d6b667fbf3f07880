// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process runtime: wires the store, provider, notifier, sweeper and HTTP
//! server together.
//!
//! ```rust,ignore
//! let runtime = ServerRuntime::start(Config::from_env()?).await?;
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use batchlink_core::{
    CorrelationService, FilePersistence, SqlitePersistence, Sweeper, SweeperConfig,
};

use crate::config::{Config, StorageBackend};
use crate::http::{AppState, create_router};
use crate::notifier::{
    EmailNotifier, LogNotifier, NotificationDispatcher, Notifier, WebhookNotifier,
};
use crate::provider::HttpProvider;

/// SQLite database file name under the data directory.
pub const SQLITE_FILE: &str = "batchlink.db";

/// Open the configured store and build the handler state.
pub async fn build_state(config: &Config) -> Result<AppState> {
    let service = match config.storage {
        StorageBackend::Sqlite => {
            let path = config.data_dir.join(SQLITE_FILE);
            let store = SqlitePersistence::from_path(&path)
                .await
                .with_context(|| format!("opening SQLite store at {}", path.display()))?;
            CorrelationService::from_backend(Arc::new(store))
        }
        StorageBackend::File => {
            let store = FilePersistence::open(&config.data_dir)
                .await
                .with_context(|| format!("opening file store at {}", config.data_dir.display()))?;
            CorrelationService::from_backend(Arc::new(store))
        }
    };
    let service = Arc::new(service.with_submit_concurrency(config.submit_concurrency));

    let provider = Arc::new(HttpProvider::new(
        config.provider.clone(),
        config.callback_url(),
    )?);
    if config.provider.api_key.is_none() {
        warn!("No provider API key configured; every submission will fail");
    }

    let notifier: Arc<dyn Notifier> = match (&config.smtp, &config.notify_webhook_url) {
        (Some(smtp), _) => Arc::new(
            EmailNotifier::new(smtp)
                .with_context(|| format!("configuring SMTP relay {}", smtp.host))?,
        ),
        (None, Some(url)) => Arc::new(WebhookNotifier::new(url.clone())),
        (None, None) => Arc::new(LogNotifier),
    };
    info!(channel = notifier.name(), "Notifier initialized");

    let dispatcher = Arc::new(NotificationDispatcher::new(service.clone(), notifier));
    Ok(AppState::new(service, provider, dispatcher))
}

/// A running server.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ServerRuntime {
    local_addr: SocketAddr,
    state: AppState,
    server_handle: JoinHandle<std::io::Result<()>>,
    sweeper_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    sweeper_shutdown: Arc<Notify>,
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("local_addr", &self.local_addr)
            .field("state", &"...")
            .finish()
    }
}

impl ServerRuntime {
    /// Open storage, bind the listener and spawn the server and sweeper.
    pub async fn start(config: Config) -> Result<Self> {
        let state = build_state(&config).await?;
        let listener = TcpListener::bind(config.http_addr)
            .await
            .with_context(|| format!("binding {}", config.http_addr))?;
        let local_addr = listener.local_addr()?;

        let sweeper = Sweeper::new(
            state.service.clone(),
            state.dispatcher.clone(),
            SweeperConfig {
                poll_interval: config.sweep_interval,
                stale_after: config.stale_after,
                ..SweeperConfig::default()
            },
        );
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(sweeper.run());

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let app = create_router(state.clone());
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        info!(
            addr = %local_addr,
            storage = ?config.storage,
            callback_url = %state.provider.callback_url(),
            "HTTP server listening"
        );

        Ok(Self {
            local_addr,
            state,
            server_handle,
            sweeper_handle,
            server_shutdown_tx,
            sweeper_shutdown,
        })
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting requests, stop the sweeper, and wait for both.
    pub async fn shutdown(self) -> Result<()> {
        info!("ServerRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.sweeper_shutdown.notify_one();

        if let Err(e) = self.sweeper_handle.await {
            error!("Sweeper task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("ServerRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("HTTP server failed"),
            Err(e) => Err(anyhow::anyhow!("HTTP server task panicked: {}", e)),
        }
    }
}
