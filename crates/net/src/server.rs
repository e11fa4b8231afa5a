//! TCP server for the room engine
//!
//! Clients connect and exchange length-prefixed JSON events. Every inbound
//! event, disconnect, and poll-timer firing is funneled into one command
//! channel consumed by a single dispatch task that owns the [`RoomStore`],
//! so events are processed strictly in order and every engine operation is
//! atomic without locking. Broadcasts are emitted synchronously while the
//! triggering command is handled, which gives all members of a room the
//! same view of the event order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use quorum_core::error::Error as CoreError;
use quorum_core::{ActionKind, Effect, RoomStore, ServerEvent};

use crate::error::Error;
use crate::frame::{read_frame, write_frame};
use crate::protocol::ClientEvent;

/// Everything the dispatch task can be asked to process.
enum Command {
    Connected {
        conn: Uuid,
        tx: mpsc::Sender<ServerEvent>,
    },
    Inbound {
        conn: Uuid,
        event: ClientEvent,
    },
    Disconnected {
        conn: Uuid,
    },
    /// Sent by an armed poll timer. Carries the poll id so a stale firing
    /// (poll already ended or replaced) can be recognized and dropped.
    PollExpired {
        room: String,
        poll_id: String,
    },
}

/// Transport-side record of a connection: the username it asserted and
/// the room it is remembered to be in.
#[derive(Default)]
struct Session {
    username: Option<String>,
    room: Option<String>,
}

/// Server handle
pub struct Server {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Start the server on the given address.
    pub async fn start(addr: SocketAddr, edit_window: Duration) -> crate::error::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let dispatcher = Dispatcher::new(RoomStore::with_edit_window(edit_window), cmd_tx.clone());
        tokio::spawn(dispatch_task(dispatcher, cmd_rx, shutdown_tx.subscribe()));
        tokio::spawn(accept_loop(listener, cmd_tx, shutdown_tx.subscribe()));

        Ok(Server {
            addr: bound_addr,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    cmd_tx: mpsc::Sender<Command>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(stream, addr, cmd_tx.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single client connection: register it with the dispatcher,
/// spawn the writer task, and pump inbound frames into the command
/// channel until the peer goes away.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, cmd_tx: mpsc::Sender<Command>) {
    let conn = Uuid::new_v4();
    let (mut reader, writer) = tokio::io::split(stream);

    let (tx, rx) = mpsc::channel(64);
    if cmd_tx.send(Command::Connected { conn, tx }).await.is_err() {
        return;
    }
    let writer_handle = tokio::spawn(writer_task(writer, rx));

    info!(conn_id = %conn, addr = %addr, "Peer connected");

    loop {
        match read_frame::<_, ClientEvent>(&mut reader).await {
            Ok(event) => {
                if cmd_tx.send(Command::Inbound { conn, event }).await.is_err() {
                    break;
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!(conn_id = %conn, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(conn_id = %conn, error = %e, "Read error");
                break;
            }
        }
    }

    let _ = cmd_tx.send(Command::Disconnected { conn }).await;
    writer_handle.abort();

    info!(conn_id = %conn, "Peer disconnected");
}

/// Writer task - sends events to the client
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<ServerEvent>) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &event).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Consume commands until the channel closes or shutdown is signalled.
async fn dispatch_task(
    mut dispatcher: Dispatcher,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => dispatcher.handle_command(cmd).await,
                None => break,
            },
            _ = shutdown_rx.recv() => {
                info!("Dispatch task shutting down");
                break;
            }
        }
    }
}

/// Owns the engine and all per-connection bookkeeping. Only the dispatch
/// task touches this, so none of it needs a lock.
struct Dispatcher {
    store: RoomStore,
    sessions: HashMap<Uuid, Session>,
    peers: HashMap<Uuid, mpsc::Sender<ServerEvent>>,
    /// Armed poll expiry timers, keyed by room.
    poll_timers: HashMap<String, JoinHandle<()>>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Dispatcher {
    fn new(store: RoomStore, cmd_tx: mpsc::Sender<Command>) -> Self {
        Self {
            store,
            sessions: HashMap::new(),
            peers: HashMap::new(),
            poll_timers: HashMap::new(),
            cmd_tx,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connected { conn, tx } => {
                self.peers.insert(conn, tx);
                self.sessions.insert(conn, Session::default());
            }
            Command::Disconnected { conn } => {
                self.peers.remove(&conn);
                if let Some(session) = self.sessions.remove(&conn) {
                    if let Some(room) = session.room {
                        let effects = self.store.leave(conn, &room);
                        self.run_effects(effects).await;
                    }
                }
            }
            Command::PollExpired { room, poll_id } => {
                self.poll_timers.remove(&room);
                let effects = self.store.poll_expired(&room, &poll_id);
                self.run_effects(effects).await;
            }
            Command::Inbound { conn, event } => self.handle_event(conn, event).await,
        }
    }

    async fn handle_event(&mut self, conn: Uuid, event: ClientEvent) {
        let now = Utc::now();
        let result = match event {
            ClientEvent::GetRooms => Ok(vec![Effect::ToConnection(
                conn,
                ServerEvent::RoomsList {
                    rooms: self.store.rooms(),
                },
            )]),
            ClientEvent::JoinRoom { username, room } => {
                match self.store.join(conn, &username, &room) {
                    Ok(effects) => {
                        if let Some(session) = self.sessions.get_mut(&conn) {
                            session.username = Some(username.trim().to_string());
                            session.room = Some(room.to_lowercase());
                        }
                        Ok(effects)
                    }
                    Err(e) => Err(e),
                }
            }
            ClientEvent::ChatMessage { text } => {
                let (has_username, room) = match self.sessions.get(&conn) {
                    Some(session) => (session.username.is_some(), session.room.clone()),
                    None => (false, None),
                };
                if !has_username {
                    Err(CoreError::blank_username())
                } else if let Some(room) = room {
                    self.store.send_message(conn, &room, &text, now)
                } else {
                    Ok(Vec::new())
                }
            }
            ClientEvent::MessageRead {
                room,
                message_id,
                user_id,
            } => self.store.mark_read(&room, &message_id, user_id),
            ClientEvent::DeleteMessage { room, message_id } => {
                self.store.delete_message(conn, &room, &message_id)
            }
            ClientEvent::EditMessage {
                room,
                message_id,
                new_text,
            } => self
                .store
                .edit_message(conn, &room, &message_id, &new_text, now),
            ClientEvent::PinMessage { room, message_id } => {
                self.store.pin_message(&room, &message_id)
            }
            ClientEvent::UnpinMessage { room } => self.store.unpin_message(&room),
            ClientEvent::UpdateRoomAppearance {
                room,
                theme,
                background_color,
            } => self
                .store
                .update_appearance(conn, &room, theme.as_deref(), background_color),
            ClientEvent::Typing { room, username } => Ok(vec![Effect::ToRoomExcept(
                room.to_lowercase(),
                conn,
                ServerEvent::Typing { username },
            )]),
            ClientEvent::StopTyping { room, username } => Ok(vec![Effect::ToRoomExcept(
                room.to_lowercase(),
                conn,
                ServerEvent::StopTyping { username },
            )]),
            ClientEvent::KickUser {
                room,
                target_user_id,
            } => self.store.kick(conn, &room, target_user_id),
            ClientEvent::StartPoll {
                room,
                question,
                options,
                multiple,
                duration_sec,
            } => self
                .store
                .start_poll(conn, &room, &question, &options, multiple, duration_sec, now),
            ClientEvent::VotePoll {
                room,
                option_indexes,
            } => self.store.vote(conn, &room, &option_indexes),
            ClientEvent::EndPoll { room } => self.store.end_poll(conn, &room),
            ClientEvent::SearchMessages { room, query } => {
                Ok(self.store.search(conn, &room, &query))
            }
        };

        match result {
            Ok(effects) => self.run_effects(effects).await,
            Err(err) => self.deliver_error(conn, err).await,
        }
    }

    /// Map engine errors onto the outbound vocabulary: validation and
    /// authority failures go back to the requester, missing entities are
    /// dropped, edit-window rejections carry the elapsed-time detail.
    async fn deliver_error(&mut self, conn: Uuid, err: CoreError) {
        match err {
            CoreError::Validation {
                action: ActionKind::Username,
                message,
            } => {
                self.deliver(conn, ServerEvent::System { text: message })
                    .await;
            }
            CoreError::Validation { action, message }
            | CoreError::Authority { action, message } => {
                self.deliver(
                    conn,
                    ServerEvent::ActionError {
                        kind: action,
                        message,
                    },
                )
                .await;
            }
            CoreError::NotFound(what) => {
                trace!(conn_id = %conn, what = %what, "Dropping request for missing entity");
            }
            err @ CoreError::EditWindowElapsed { .. } => {
                let message = err.to_string();
                self.deliver(conn, ServerEvent::EditError { message }).await;
            }
        }
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ToConnection(conn, event) => self.deliver(conn, event).await,
                Effect::ToRoom(room, event) => {
                    for conn in self.store.room_conns(&room) {
                        self.deliver(conn, event.clone()).await;
                    }
                }
                Effect::ToRoomExcept(room, except, event) => {
                    for conn in self.store.room_conns(&room) {
                        if conn != except {
                            self.deliver(conn, event.clone()).await;
                        }
                    }
                }
                Effect::SchedulePollEnd {
                    room,
                    poll_id,
                    after,
                } => self.schedule_poll_end(room, poll_id, after),
                Effect::CancelPollEnd { room } => {
                    if let Some(timer) = self.poll_timers.remove(&room) {
                        timer.abort();
                    }
                }
                Effect::DetachFromRoom { conn } => {
                    if let Some(session) = self.sessions.get_mut(&conn) {
                        session.room = None;
                    }
                }
            }
        }
    }

    /// Arm the auto-expiry timer for a room's poll. The timer re-enters
    /// through the command channel, so its firing serializes with every
    /// other event; a poll ended early aborts the handle before it fires.
    fn schedule_poll_end(&mut self, room: String, poll_id: String, after: Duration) {
        if let Some(previous) = self.poll_timers.remove(&room) {
            previous.abort();
        }
        debug!(room = %room, poll_id = %poll_id, after_secs = after.as_secs(), "Poll timer armed");

        let cmd_tx = self.cmd_tx.clone();
        let key = room.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = cmd_tx.send(Command::PollExpired { room, poll_id }).await;
        });
        self.poll_timers.insert(key, handle);
    }

    async fn deliver(&self, conn: Uuid, event: ServerEvent) {
        if let Some(tx) = self.peers.get(&conn) {
            if tx.send(event).await.is_err() {
                debug!(conn_id = %conn, "Failed to queue event for peer");
            }
        }
    }
}
