// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process wiring: collaborators, manager, listener, signals

use crate::compat::CompatListener;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::events::EventHandler;
use crate::handoff::{self, hand_over, take_over};
use crate::manager::{ManagerSettings, ProxyManager};
use crate::server::{AppState, IngestServer};
use crate::storage::{status_manager, StaticUserStorage};
use crate::upstream::MasterServer;
use icegate_domain_types::UserStorage;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Serve until `shutdown` fires or a handoff succeeds
pub async fn run(config: ProxyConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;

    let master = MasterServer::new(config.proxy.master_url()?);
    info!(master = %master.redacted(), primary_mount = %config.proxy.primary_mount, "starting icegate");

    let storage = StaticUserStorage::new(config.users.clone());
    if storage.is_empty() {
        warn!("no users configured, every source will be refused");
    }
    let storage: Arc<dyn UserStorage> = Arc::new(storage);

    let events = EventHandler::new(config.proxy.primary_mount.clone(), status_manager(&config)?);
    let manager = ProxyManager::spawn(
        ManagerSettings::new(master, &config),
        events,
        shutdown.child_token(),
    );

    // installed before any restore so an early SIGUSR2 cannot kill the process
    let mut restart = signal(SignalKind::user_defined2())?;

    let listener = match handoff::inherited_channel()? {
        Some(channel) => {
            info!("started by handoff, taking over from previous process");
            take_over(&channel, &manager, &storage, &shutdown).await?
        }
        None => CompatListener::bind(config.server.listen_addr).await?,
    };
    info!(addr = %listener.local_addr()?, "listening for sources");

    let early = poll_fn(|cx| Poll::Ready(restart.poll_recv(cx).is_ready())).await;
    if early {
        warn!(signal = "SIGUSR2", "restart requested while starting up, ignoring it");
    }

    let server = IngestServer::new(AppState {
        manager: manager.clone(),
        storage: storage.clone(),
        config: Arc::new(config.server.clone()),
        shutdown: shutdown.clone(),
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutting down");
                break;
            }
            _ = server.serve(&listener) => {}
            _ = restart.recv() => {
                info!(signal = "SIGUSR2", "handing over to a new process");
                match hand_over(&manager, &storage, &listener, &config.handoff, &shutdown).await {
                    Ok(()) => {
                        shutdown.cancel();
                        break;
                    }
                    Err(Error::Handoff { source }) if source.is_fatal() => {
                        return Err(source.into());
                    }
                    Err(e) => error!(error = %e, "handoff aborted, still serving"),
                }
            }
        }
    }

    Ok(())
}
