//! Per-connection read/write pump pair
//!
//! Each accepted WebSocket is split into a read half and a write half, each
//! driven by its own task. The write pump is the only writer of the
//! transport; the read pump is the only reader. They meet only through the
//! connection's outbound queue, a close-code cell, and the hub.
//!
//! The pumps are generic over the transport's stream/sink halves so they can
//! be driven with in-memory channels as well as a live socket.
//!
//! Every exit path of the read pump funnels into a single unregister event,
//! so hub bookkeeping never double-counts a teardown.

use axum::extract::ws::{CloseFrame, Message};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::{Sink, Stream};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::hub::{ConnId, HubHandle, Outbound, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use crate::sliding_window::SlidingWindowRateLimiter;

/// Timeout/keepalive knobs for one connection's pumps
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Connection is torn down after this long without inbound activity
    pub idle_timeout: Duration,
    /// Keepalive ping cadence on the write side
    pub ping_interval: Duration,
    /// Upper bound for any single transport write
    pub write_deadline: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(30),
            write_deadline: Duration::from_secs(10),
        }
    }
}

/// Why the read pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    IdleTimeout,
    IoError,
    RateViolation,
}

/// Drive one connection to completion: spawn the write pump, run the read
/// pump, and unregister from the hub when the read side ends. Called from
/// the upgrade callback after the connection is already registered.
pub async fn run_connection<S>(
    socket: S,
    conn_id: ConnId,
    outbound_rx: mpsc::Receiver<Outbound>,
    hub: HubHandle,
    limiter: SlidingWindowRateLimiter,
    config: PumpConfig,
) where
    S: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Unpin
        + Send
        + 'static,
{
    let (ws_tx, ws_rx) = socket.split();

    // The close-code cell overrides whatever close the queue carries; unlike
    // an in-band frame it cannot be lost to a full queue.
    let (close_tx, close_rx) = watch::channel(None);

    let writer = tokio::spawn(write_pump(
        ws_tx,
        outbound_rx,
        close_rx,
        config.ping_interval,
        config.write_deadline,
    ));

    let reason = read_pump(ws_rx, close_tx, limiter, config.idle_timeout).await;
    match reason {
        CloseReason::RateViolation => {
            // Policy decision, not a system error
            warn!(conn_id = %conn_id, "closing connection: message rate violation");
        }
        other => debug!(conn_id = %conn_id, reason = ?other, "connection closed"),
    }

    // Single convergence point for all teardown paths; the hub closes the
    // outbound queue, which ends the write pump
    hub.unregister(conn_id).await;
    let _ = writer.await;
}

/// Read pump: turns blocking reads into hub-relevant events.
///
/// The message limiter is consulted only after a successful non-empty read,
/// never pre-emptively, so opening idle connections burns no budget. On a
/// violation the policy close code is published through the close cell and
/// the write pump applies it when the queue closes.
async fn read_pump<S>(
    mut ws_rx: SplitStream<S>,
    close_code: watch::Sender<Option<u16>>,
    limiter: SlidingWindowRateLimiter,
    idle_timeout: Duration,
) -> CloseReason
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let frame = match timeout(idle_timeout, ws_rx.next()).await {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::ClientClosed,
            Ok(Some(Err(_))) => return CloseReason::IoError,
            Ok(Some(Ok(frame))) => frame,
        };

        let non_empty = match &frame {
            Message::Text(text) => !text.is_empty(),
            Message::Binary(bytes) => !bytes.is_empty(),
            Message::Close(_) => return CloseReason::ClientClosed,
            // Pings and pongs count as activity but not as messages
            Message::Ping(_) | Message::Pong(_) => false,
        };

        if non_empty && !limiter.is_allowed() {
            let _ = close_code.send(Some(CLOSE_POLICY_VIOLATION));
            return CloseReason::RateViolation;
        }
    }
}

/// Write pump: sole writer of the transport. Drains the outbound queue and
/// sends keepalive pings; a closed queue or any failed write ends the pump,
/// which closes the transport and lets the read pump observe the error.
/// A published close code takes precedence over the code the queue carried.
async fn write_pump<S>(
    mut ws_tx: SplitSink<S, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    close_code: watch::Receiver<Option<u16>>,
    ping_interval: Duration,
    write_deadline: Duration,
) where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Swallow the immediate first tick
    ping.tick().await;

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Payload(payload)) => {
                    match timeout(write_deadline, ws_tx.send(Message::Text(payload))).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                Some(Outbound::Close(code)) => {
                    let code = close_code.borrow().unwrap_or(code);
                    send_close(&mut ws_tx, code, write_deadline).await;
                    break;
                }
                None => {
                    // Queue closed by the hub: normal teardown unless the
                    // read pump published a policy code
                    let code = close_code.borrow().unwrap_or(CLOSE_NORMAL);
                    send_close(&mut ws_tx, code, write_deadline).await;
                    break;
                }
            },
            _ = ping.tick() => {
                match timeout(write_deadline, ws_tx.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    // Read pump will observe the resulting transport error
                    _ => break,
                }
            }
        }
    }

    // Best effort: closing the sink makes the read half see end-of-stream,
    // which bounds teardown even when the close frame itself was lost
    let _ = timeout(write_deadline, ws_tx.close()).await;
}

async fn send_close<S>(ws_tx: &mut SplitSink<S, Message>, code: u16, deadline: Duration)
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let reason: Cow<'static, str> = match code {
        CLOSE_POLICY_VIOLATION => Cow::Borrowed("message rate limit exceeded"),
        _ => Cow::Borrowed(""),
    };
    let frame = Message::Close(Some(CloseFrame { code, reason }));
    let _ = timeout(deadline, ws_tx.send(frame)).await;
}
