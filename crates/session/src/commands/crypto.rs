// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Key provider and frame cryptor commands.
//!
//! Key providers are process-scoped. A frame cryptor is bound to one sender or
//! receiver of a session and is disposed with that session. Each cryptor has
//! its own event stream fed by a forwarder task that drains the engine's
//! state-change channel.

use std::sync::Arc;

use rtcbridge_core::engine::{
    CryptorAlgorithm, CryptorStateChange, CryptorTarget, EngineFrameCryptor, EngineKeyProvider,
    KeyProviderOptions,
};
use rtcbridge_core::{
    vmap, BridgeError, CryptorEvent, EventSink, EventStream, ResourceKind, Result, Value,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::rtp::{find_receiver, find_sender};
use super::{bytes_arg, ok, session_arg};
use crate::context::BridgeContext;
use crate::entities::{FrameCryptorEntry, KeyProviderEntry};
use crate::lifecycle;
use crate::metrics::BridgeMetrics;

pub fn create_key_provider(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let options = key_provider_options(args)?;
    let provider = ctx
        .engine
        .create_key_provider(&options)
        .map_err(|e| BridgeError::engine("frameCryptorFactoryCreateKeyProvider", e))?;

    let mut inner = ctx.registry.lock();
    let handle = inner.allocate_handle(ResourceKind::KeyProvider)?;
    inner.key_providers.put(handle.clone(), KeyProviderEntry { handle: handle.clone(), provider });
    drop(inner);

    tracing::debug!(
        key_provider = %handle,
        shared_key = options.shared_key,
        "key provider created"
    );
    Ok(vmap! { "keyProviderId" => handle })
}

fn key_provider_options(args: &Value) -> Result<KeyProviderOptions> {
    let defaults = KeyProviderOptions::default();
    let Some(options) = args.opt("keyProviderOptions") else {
        return Ok(defaults);
    };
    let ratchet_salt = match options.opt("ratchetSalt") {
        Some(_) => bytes_arg(options, "ratchetSalt")?,
        None => defaults.ratchet_salt,
    };
    Ok(KeyProviderOptions {
        shared_key: options.opt_bool("sharedKey")?.unwrap_or(defaults.shared_key),
        ratchet_salt,
        ratchet_window_size: options
            .opt_int("ratchetWindowSize")?
            .unwrap_or(defaults.ratchet_window_size),
        failure_tolerance: options
            .opt_int("failureTolerance")?
            .unwrap_or(defaults.failure_tolerance),
    })
}

fn key_provider(ctx: &BridgeContext, args: &Value) -> Result<Arc<dyn EngineKeyProvider>> {
    let id = args.require_str("keyProviderId")?;
    Ok(ctx.registry.lock().key_providers.get(id)?.provider.clone())
}

pub fn set_key(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let provider = key_provider(ctx, args)?;
    let participant_id = args.require_str("participantId")?;
    let index = args.require_int("index")?;
    let key = bytes_arg(args, "key")?;
    provider
        .set_key(participant_id, index, key)
        .map_err(|e| BridgeError::engine("keyProviderSetKey", e))?;
    Ok(vmap! { "result" => true })
}

pub fn set_shared_key(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let provider = key_provider(ctx, args)?;
    let index = args.require_int("index")?;
    let key = bytes_arg(args, "key")?;
    provider
        .set_shared_key(index, key)
        .map_err(|e| BridgeError::engine("keyProviderSetSharedKey", e))?;
    Ok(vmap! { "result" => true })
}

pub fn ratchet_key(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let provider = key_provider(ctx, args)?;
    let participant_id = args.require_str("participantId")?;
    let index = args.require_int("index")?;
    let key = provider
        .ratchet_key(participant_id, index)
        .map_err(|e| BridgeError::engine("keyProviderRatchetKey", e))?;
    Ok(vmap! { "result" => key })
}

pub fn dispose_key_provider(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let id = args.require_str("keyProviderId")?;
    let mut inner = ctx.registry.lock();
    match inner.key_providers.remove(id) {
        Ok(_) => {
            inner.retired.insert(ResourceKind::KeyProvider, id);
            tracing::debug!(key_provider = id, "key provider disposed");
            Ok(ok())
        },
        Err(_) if inner.retired.contains(ResourceKind::KeyProvider, id) => Ok(ok()),
        Err(err) => Err(err),
    }
}

/// Attaches a frame cryptor to a sender or receiver of a session.
pub fn create_cryptor(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let session = session_arg(args)?;
    let participant_id = args.require_str("participantId")?;
    let algorithm = CryptorAlgorithm::from_index(args.opt_int("algorithm")?.unwrap_or(0));
    let provider_id = args.require_str("keyProviderId")?;

    let (connection, provider) = {
        let inner = ctx.registry.lock();
        let connection = inner.sessions.get(&session)?.connection.clone();
        (connection, inner.key_providers.get(provider_id)?.provider.clone())
    };
    let target = match args.require_str("type")? {
        "sender" => CryptorTarget::Sender(find_sender(
            connection.as_ref(),
            args.require_str("rtpSenderId")?,
        )?),
        "receiver" => CryptorTarget::Receiver(find_receiver(
            connection.as_ref(),
            args.require_str("rtpReceiverId")?,
        )?),
        other => {
            return Err(BridgeError::invalid_argument(format!(
                "unknown frame cryptor type '{other}', expected sender or receiver"
            )));
        },
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cryptor = ctx
        .engine
        .create_frame_cryptor(target, participant_id, algorithm, provider, events_tx)
        .map_err(|e| BridgeError::engine("frameCryptorFactoryCreateFrameCryptor", e))?;

    let registered = {
        let mut inner = ctx.registry.lock();
        // The session may have been disposed while the engine was busy.
        let allocated = inner
            .sessions
            .get(&session)
            .and_then(|_| inner.allocate_handle(ResourceKind::FrameCryptor));
        allocated.map(|handle| {
            let sink = EventSink::spawn(EventStream::FrameCryptor(handle.clone()).name());
            let shutdown = CancellationToken::new();
            inner.frame_cryptors.put(
                handle.clone(),
                FrameCryptorEntry {
                    handle: handle.clone(),
                    session: session.clone(),
                    cryptor: cryptor.clone(),
                    sink: sink.clone(),
                    forwarder_shutdown: shutdown.clone(),
                },
            );
            (handle, sink, shutdown)
        })
    };
    let (handle, sink, shutdown) = match registered {
        Ok(registered) => registered,
        Err(err) => {
            cryptor.dispose();
            return Err(err);
        },
    };

    spawn_forwarder(events_rx, sink, shutdown, ctx.metrics.clone());
    tracing::info!(
        cryptor = %handle,
        session_id = %session,
        participant = participant_id,
        "frame cryptor created"
    );
    Ok(vmap! { "frameCryptorId" => handle })
}

/// Moves engine state changes onto the cryptor's event stream.
fn spawn_forwarder(
    mut events: mpsc::UnboundedReceiver<CryptorStateChange>,
    sink: EventSink,
    shutdown: CancellationToken,
    metrics: BridgeMetrics,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                change = events.recv() => match change {
                    Some(CryptorStateChange { participant_id, state }) => {
                        metrics.event_emitted("frameCryptor");
                        sink.publish(CryptorEvent::StateChanged { participant_id, state });
                    },
                    None => break,
                },
            }
        }
        tracing::debug!(stream = sink.name(), "frame cryptor forwarder stopped");
    });
}

fn cryptor(ctx: &BridgeContext, args: &Value) -> Result<Arc<dyn EngineFrameCryptor>> {
    let id = args.require_str("frameCryptorId")?;
    Ok(ctx.registry.lock().frame_cryptors.get(id)?.cryptor.clone())
}

pub fn set_key_index(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let cryptor = cryptor(ctx, args)?;
    let index = args.require_int("keyIndex")?;
    Ok(vmap! { "result" => cryptor.set_key_index(index) })
}

pub fn key_index(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let cryptor = cryptor(ctx, args)?;
    Ok(vmap! { "keyIndex" => cryptor.key_index() })
}

pub fn set_enabled(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let cryptor = cryptor(ctx, args)?;
    let enabled = args.require_bool("enabled")?;
    Ok(vmap! { "result" => cryptor.set_enabled(enabled) })
}

pub fn enabled(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    let cryptor = cryptor(ctx, args)?;
    Ok(vmap! { "enabled" => cryptor.enabled() })
}

pub fn dispose_cryptor(ctx: &BridgeContext, args: &Value) -> Result<Value> {
    lifecycle::dispose_cryptor(ctx, args.require_str("frameCryptorId")?)?;
    Ok(ok())
}
