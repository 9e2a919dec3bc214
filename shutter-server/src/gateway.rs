use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use log::{info, warn};
use serde_json::Value;
use shutter_core::{actions, ClientHandle, ClientId, OutboundMessage};
use tokio::{
    spawn,
    sync::{mpsc, Notify},
    time,
};

use crate::{
    dispatch::{self, ConnState},
    ServerContext,
};

/// How often connections are probed, and how long they have to answer
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

const GREETING: &str = "Hi there, I am a WebSocket server. Use the next structure to communicate through the websocket channel.";

/// Tracks every open socket, so the sweep can probe and cull them.
pub struct Gateway {
    me: Weak<Gateway>,
    connections: DashMap<ClientId, Arc<Connection>>,
}

struct Connection {
    handle: ClientHandle,
    control: mpsc::UnboundedSender<Control>,
    /// Cleared by each probe, set again by the answering pong
    alive: AtomicBool,
    kill: Notify,
}

/// Transport frames the writer sends besides envelopes
enum Control {
    Ping,
    Close,
}

impl Gateway {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connections: DashMap::new(),
        })
    }

    /// Starts the liveness sweep
    pub fn run(&self) {
        spawn(sweep(self.me.upgrade().expect("upgrade weak to arc")));
    }

    fn register(
        &self,
        handle: ClientHandle,
        control: mpsc::UnboundedSender<Control>,
    ) -> Arc<Connection> {
        let connection = Arc::new(Connection {
            handle: handle.clone(),
            control,
            alive: AtomicBool::new(true),
            kill: Notify::new(),
        });

        self.connections.insert(handle.id(), connection.clone());

        connection
    }

    fn unregister(&self, id: ClientId) {
        self.connections.remove(&id);
    }
}

/// Probes every connection on a fixed interval. One that never answered
/// the previous probe is closed through the normal disconnect path.
async fn sweep(gateway: Arc<Gateway>) {
    let mut timer = time::interval(HEARTBEAT_INTERVAL);

    loop {
        timer.tick().await;

        for entry in gateway.connections.iter() {
            let connection = entry.value();

            if !connection.alive.swap(false, Ordering::Relaxed) {
                connection.kill.notify_one();
                continue;
            }

            let _ = connection.control.send(Control::Ping);
        }
    }
}

pub async fn upgrade(upgrade: WebSocketUpgrade, State(context): State<ServerContext>) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(context, socket))
}

async fn handle_socket(context: ServerContext, socket: WebSocket) {
    let (sink, mut stream) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let handle = ClientHandle::new(outbound_tx);
    let connection = context.gateway.register(handle.clone(), control_tx);

    spawn(write(sink, outbound_rx, control_rx));

    info!("Connection {} opened", handle.id());

    handle.send(OutboundMessage::ok(GREETING, actions::WSS_INFO, Value::Null));

    let mut state = ConnState::default();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch::handle_frame(&context, &mut state, &handle, &text).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    connection.alive.store(true, Ordering::Relaxed);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("Connection {} failed: {err}", handle.id());
                    break;
                }
            },
            _ = connection.kill.notified() => {
                info!("Connection {} did not answer the probe, closing it", handle.id());

                let _ = connection.control.send(Control::Close);
                break;
            }
        }
    }

    dispatch::disconnected(&context, &state, &handle).await;
    context.gateway.unregister(handle.id());

    info!("Connection {} closed", handle.id());
}

/// Owns the sink half of a socket. Everything written to the connection
/// goes through here, and the socket closes when this returns.
async fn write(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };

                match serde_json::to_string(&envelope) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Dropping an envelope that does not serialize: {err}"),
                }
            }
            frame = control.recv() => match frame {
                Some(Control::Ping) => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => break,
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}
