//! `fanout run`: connect, subscribe one recipient, print deliveries.

use std::io::Write;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use fanout_core::{Batch, ConnectionState, Engine, Notification, SubscribeOptions};

use crate::cli::{GlobalOpts, RunArgs};
use crate::commands::resolve_config_path;
use crate::error::CliError;

/// One line of output.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Batch(&'a Batch),
    Notification(&'a Notification),
}

fn emit(line: &Line<'_>) -> Result<(), CliError> {
    let json = serde_json::to_string(line)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = resolve_config_path(global);
    let cfg = fanout_config::load_config_from(&path)?;

    let endpoint = match args.endpoint.as_deref() {
        Some(raw) => raw.parse::<Url>().map_err(|_| CliError::Validation {
            field: "endpoint".into(),
            reason: format!("invalid URL: {raw}"),
        })?,
        None => cfg.feed_endpoint()?.ok_or_else(|| CliError::NoEndpoint {
            path: path.display().to_string(),
        })?,
    };
    let mut credentials = cfg.feed_credentials();
    if let Some(token) = args.token {
        credentials.token = Some(SecretString::from(token));
    }

    let engine = Engine::new(cfg.to_engine_config()?)?;
    engine.start()?;

    let recipient = args.recipient;
    for channel in &args.channel {
        let mut options =
            SubscribeOptions::default().throttle(Duration::from_millis(args.throttle_ms));
        if let Some(entity) = &args.entity {
            options = options.entity(entity.clone());
        }
        engine.subscribe(recipient.as_str(), channel.as_str(), options)?;
    }
    let mut batches = engine.on_batch(recipient.as_str());
    let mut notifications = engine.on_notification(recipient.as_str());
    let mut states = engine.connection_states();

    if let Err(e) = engine.connect(endpoint.clone(), credentials) {
        engine.shutdown().await;
        return Err(e.into());
    }
    info!(endpoint = %endpoint, channels = args.channel.len(), "running");

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            () = &mut deadline => break Ok(()),
            Some(batch) = batches.recv() => {
                if let Err(e) = emit(&Line::Batch(&batch)) {
                    break Err(e);
                }
            }
            Some(notification) = notifications.recv() => {
                if let Err(e) = emit(&Line::Notification(&notification)) {
                    break Err(e);
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = states.borrow_and_update().clone();
                debug!(state = state.label(), "connection state");
                if let ConnectionState::Failed { attempts, reason } = state {
                    break Err(CliError::ConnectionFailed {
                        url: endpoint.to_string(),
                        reason: format!("gave up after {attempts} attempts: {reason}"),
                    });
                }
            }
        }
    };

    engine.shutdown().await;
    result
}
