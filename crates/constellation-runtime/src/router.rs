//! Per-device message routing
//!
//! One receive loop per connected device: decode each frame, dispatch by
//! declared type, and resolve the matching correlation entries. Malformed
//! frames and unknown message types are logged per-frame and never terminate
//! the loop; transport-level failure ends the loop and reports the device as
//! disconnected through the notifier channel injected at construction.
//!
//! Intentional teardown aborts the task at its next suspension point, so a
//! manual disconnect never reports a second disconnection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use constellation_core::{
    DeviceId, DeviceInfo, DeviceRegistry, Envelope, MessageStatus, MessageType,
};

use crate::pending::{PendingTables, TaskResponse};
use crate::registration::RegistrationTracker;
use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Router Context
// ----------------------------------------------------------------------------

/// Everything one receive loop needs, injected at construction
pub struct RouterContext {
    pub device_id: DeviceId,
    pub transport: Arc<dyn Transport>,
    pub pending: Arc<PendingTables>,
    pub registration: Arc<RegistrationTracker>,
    pub registry: Arc<Mutex<DeviceRegistry>>,
    /// Disconnect notifier: the reconnection supervisor owns the receiving
    /// end, keeping the router decoupled from recovery policy
    pub disconnects: mpsc::UnboundedSender<DeviceId>,
}

/// Spawn the receive loop for one device
pub fn spawn_router(ctx: RouterContext) -> JoinHandle<()> {
    tokio::spawn(run_receive_loop(ctx))
}

async fn run_receive_loop(ctx: RouterContext) {
    loop {
        match ctx.transport.receive().await {
            Ok(frame) => handle_frame(&ctx, &frame).await,
            Err(e) => {
                info!(device = %ctx.device_id, error = %e, "receive loop ended");
                break;
            }
        }
    }
    let _ = ctx.disconnects.send(ctx.device_id.clone());
}

// ----------------------------------------------------------------------------
// Frame Dispatch
// ----------------------------------------------------------------------------

async fn handle_frame(ctx: &RouterContext, frame: &str) {
    let envelope = match Envelope::decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(device = %ctx.device_id, error = %e, "dropping malformed frame");
            return;
        }
    };

    match envelope.message_type {
        MessageType::TaskEnd => handle_task_end(ctx, envelope),
        MessageType::Error => handle_error(ctx, envelope),
        MessageType::Heartbeat => handle_heartbeat(ctx, envelope).await,
        MessageType::DeviceInfoResponse => handle_device_info(ctx, envelope),
        MessageType::Command => {
            // Constellation mode does not execute server-initiated commands
            debug!(device = %ctx.device_id, "acknowledged COMMAND frame");
        }
        other => {
            debug!(device = %ctx.device_id, message_type = ?other, "ignoring unrecognized frame");
        }
    }
}

fn handle_task_end(ctx: &RouterContext, envelope: Envelope) {
    let Some(correlation_id) = envelope.correlation_id().map(str::to_string) else {
        warn!(device = %ctx.device_id, "TASK_END frame without correlation id");
        return;
    };

    let status = envelope.status.unwrap_or(if envelope.error.is_some() {
        MessageStatus::Failed
    } else {
        MessageStatus::Completed
    });

    ctx.pending.complete_task(
        &correlation_id,
        TaskResponse {
            status,
            result: envelope.result,
            error: envelope.error,
        },
    );
}

fn handle_error(ctx: &RouterContext, envelope: Envelope) {
    let reason = envelope
        .error
        .clone()
        .unwrap_or_else(|| "unspecified server error".to_string());

    // During the handshake an ERROR frame is the negative ack
    if ctx.registration.is_waiting(&ctx.device_id) {
        warn!(device = %ctx.device_id, reason = %reason, "registration rejected");
        ctx.registration.complete(&ctx.device_id, false);
        return;
    }

    // Otherwise surface it through the pending task it refers to, if any —
    // an error the caller is waiting on must not be silently dropped
    if let Some(correlation_id) = envelope.correlation_id().map(str::to_string) {
        warn!(
            device = %ctx.device_id,
            correlation_id = %correlation_id,
            reason = %reason,
            "server error for in-flight request"
        );
        ctx.pending.complete_task(
            &correlation_id,
            TaskResponse {
                status: MessageStatus::Error,
                result: envelope.result,
                error: Some(reason),
            },
        );
    } else {
        warn!(device = %ctx.device_id, reason = %reason, "server error without correlation id");
    }
}

async fn handle_heartbeat(ctx: &RouterContext, envelope: Envelope) {
    // The first OK heartbeat doubles as the implicit registration ack;
    // the tracker ignores every one after the first
    if envelope.status == Some(MessageStatus::Ok) {
        ctx.registration.complete(&ctx.device_id, true);
    }

    let mut registry = ctx.registry.lock().await;
    registry.update_heartbeat(&ctx.device_id);
}

fn handle_device_info(ctx: &RouterContext, envelope: Envelope) {
    let Some(correlation_id) = envelope.correlation_id().map(str::to_string) else {
        warn!(device = %ctx.device_id, "DEVICE_INFO_RESPONSE without correlation id");
        return;
    };

    let info = envelope
        .result
        .as_ref()
        .and_then(DeviceInfo::from_value)
        .unwrap_or_default();

    ctx.pending.complete_device_info(&correlation_id, info);
}
