use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};

use super::connection::Outbound;
use super::protocol::{decode_inbound, encode_outbound};
use super::{
    ConnectionHandle, ConnectionId, ConnectionOptions, InboundHandler, InboundMessage, Notification,
    UserId,
};

/// Why a connection actor stopped. Logged once on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    IdleTimeout,
    ReadError,
    Protocol,
    WriteFailed,
    Shutdown,
}

/// Everything one connection actor needs besides the socket.
pub(crate) struct ConnectionContext {
    pub handle: Arc<ConnectionHandle>,
    pub outbound: Outbound,
    pub options: ConnectionOptions,
    pub inbound: Arc<dyn InboundHandler>,
    /// Removal requests back to the dispatch loop.
    pub remove_tx: mpsc::UnboundedSender<ConnectionId>,
}

/// Drive one connection until either half stops.
///
/// The socket is split: the outbound loop runs as its own task and is the
/// only writer, the inbound loop runs here. Whichever ends first closes the
/// handle, the other is given one write deadline to finish, and removal is
/// requested exactly once on the way out.
pub(crate) async fn run_connection<S, E>(socket: S, ctx: ConnectionContext)
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    let ConnectionContext {
        handle,
        outbound,
        options,
        inbound,
        remove_tx,
    } = ctx;
    let connection_id = handle.id();
    let user_id = handle.user_id();
    let (sink, stream) = socket.split();

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "Connection actor started"
    );

    let mut writer = tokio::spawn(outbound_loop(sink, outbound, user_id, options.clone()));

    let (reason, writer_done) = tokio::select! {
        reason = inbound_loop(stream, &handle, &options, inbound.as_ref()) => (reason, false),
        result = &mut writer => (result.unwrap_or(CloseReason::WriteFailed), true),
    };

    handle.close();
    if !writer_done && timeout(options.write_timeout, &mut writer).await.is_err() {
        tracing::debug!(connection_id = %connection_id, "Outbound loop did not finish in time, aborting");
        writer.abort();
    }

    if remove_tx.send(connection_id).is_err() {
        tracing::debug!(connection_id = %connection_id, "Dispatch loop gone before removal");
    }

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        reason = ?reason,
        "Connection actor stopped"
    );
}

async fn inbound_loop<St, E>(
    mut stream: St,
    handle: &ConnectionHandle,
    options: &ConnectionOptions,
    inbound: &dyn InboundHandler,
) -> CloseReason
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = match timeout(options.idle_timeout, stream.next()).await {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::PeerClosed,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %handle.id(), error = %e, "Read failed");
                return CloseReason::ReadError;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let text = text.as_str();
                if text.len() > options.max_frame_bytes {
                    tracing::warn!(
                        connection_id = %handle.id(),
                        size = text.len(),
                        limit = options.max_frame_bytes,
                        "Inbound frame too large"
                    );
                    return CloseReason::Protocol;
                }
                let envelope = match decode_inbound(text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(connection_id = %handle.id(), error = %e, "Malformed inbound frame");
                        return CloseReason::Protocol;
                    }
                };
                inbound.handle(
                    handle,
                    InboundMessage {
                        connection_id: handle.id(),
                        user_id: handle.user_id(),
                        kind: envelope.kind,
                        data: envelope.data,
                    },
                );
            }
            Message::Binary(_) => {
                tracing::warn!(connection_id = %handle.id(), "Binary frames are not supported");
                return CloseReason::Protocol;
            }
            // Any traffic, keepalive included, renews the idle deadline.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return CloseReason::PeerClosed,
        }
    }
}

async fn outbound_loop<Si, E>(
    mut sink: Si,
    mut outbound: Outbound,
    user_id: UserId,
    options: ConnectionOptions,
) -> CloseReason
where
    Si: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    let period = options.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;
            next = outbound.rx.recv() => match next {
                Some(notification) => {
                    if let Some(frame) = to_frame(&notification, user_id) {
                        if let Err(reason) = write_frame(&mut sink, frame, options.write_timeout).await {
                            return reason;
                        }
                    }
                    keepalive.reset();
                }
                None => break,
            },
            _ = outbound.closed.cancelled() => break,
            _ = keepalive.tick() => {
                if let Err(reason) = write_frame(&mut sink, Message::Ping(Default::default()), options.write_timeout).await {
                    return reason;
                }
            }
        }
    }

    // Flush what was queued before the close, then say goodbye.
    while let Ok(notification) = outbound.rx.try_recv() {
        if let Some(frame) = to_frame(&notification, user_id) {
            if let Err(reason) = write_frame(&mut sink, frame, options.write_timeout).await {
                return reason;
            }
        }
    }
    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }));
    let _ = write_frame(&mut sink, close, options.write_timeout).await;
    CloseReason::Shutdown
}

fn to_frame(notification: &Notification, user_id: UserId) -> Option<Message> {
    match encode_outbound(notification, user_id) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::warn!(user_id = %user_id, kind = %notification.kind, error = %e, "Failed to encode notification, skipping");
            None
        }
    }
}

async fn write_frame<Si, E>(sink: &mut Si, frame: Message, deadline: Duration) -> Result<(), CloseReason>
where
    Si: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    match timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Write failed");
            Err(CloseReason::WriteFailed)
        }
        Err(_) => {
            tracing::debug!("Write deadline exceeded");
            Err(CloseReason::WriteFailed)
        }
    }
}
