//! Shared test harness: an in-process WebSocket server that speaks the
//! binary envelope protocol.
//!
//! The server acknowledges chat traffic, answers pings, and fans every
//! frame out to the other connected peers, which is all the engines
//! need from the real sync server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use fete_collab::chat::AckPayload;
use fete_collab::protocol::{Envelope, EventKind};

/// Start a fan-out server on a free port, return the port.
pub async fn start_fanout_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (fanout, _) = broadcast::channel::<(u64, Vec<u8>)>(1024);
    let next_peer = Arc::new(AtomicU64::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let peer_id = next_peer.fetch_add(1, Ordering::Relaxed);
            let fanout = fanout.clone();
            tokio::spawn(handle_peer(stream, peer_id, fanout));
        }
    });

    // Give the accept loop time to start
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    port
}

async fn handle_peer(stream: TcpStream, peer_id: u64, fanout: broadcast::Sender<(u64, Vec<u8>)>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let mut fanout_rx = fanout.subscribe();

    loop {
        tokio::select! {
            incoming = source.next() => {
                let Some(Ok(msg)) = incoming else { break };
                let Message::Binary(bytes) = msg else { continue };
                let Ok(env) = Envelope::decode(&bytes) else { continue };

                match env.kind {
                    EventKind::Ping => {
                        let pong = Envelope::pong(Uuid::nil());
                        if let Ok(bytes) = pong.encode() {
                            let _ = sink.send(Message::Binary(bytes.into())).await;
                        }
                    }
                    EventKind::ChatMessage
                    | EventKind::MessageEdit
                    | EventKind::MessageDelete => {
                        if let Some(ack) = ack_for(&env) {
                            let _ = sink.send(Message::Binary(ack.into())).await;
                        }
                        let _ = fanout.send((peer_id, bytes.to_vec()));
                    }
                    _ => {
                        let _ = fanout.send((peer_id, bytes.to_vec()));
                    }
                }
            }
            relayed = fanout_rx.recv() => {
                match relayed {
                    Ok((origin, bytes)) if origin != peer_id => {
                        if sink.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn ack_for(env: &Envelope) -> Option<Vec<u8>> {
    let target = match env.kind {
        EventKind::ChatMessage => env
            .payload_as::<fete_collab::chat::ChatMessage>()
            .ok()?
            .id,
        EventKind::MessageEdit => {
            env.payload_as::<fete_collab::chat::EditPayload>().ok()?.message_id
        }
        EventKind::MessageDelete => {
            env.payload_as::<fete_collab::chat::DeletePayload>().ok()?.message_id
        }
        _ => return None,
    };
    Envelope::new(EventKind::MessageAck, Uuid::nil(), env.channel, &AckPayload { target })
        .ok()?
        .encode()
        .ok()
}
