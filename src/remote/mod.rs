//! リモートプレイヤーWebSocketサーバー
//!
//! 再生コマンド（Play/Stop/Pause/Resume/Seek）と通知を外部プレイヤーへ
//! 配信し、プレイヤーからの再生終了・エラーのコールバックを受け取る。
//!
//! ## WebSocket API
//!
//! クライアントは `ws://localhost:8765` に接続する。メッセージは
//! すべてJSONで、サーバー→クライアントは`ServerMessage`、
//! クライアント→サーバーは`ClientMessage`。

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::notify::Notice;

/// WebSocket接続のID
type ClientId = u64;

/// プレイヤーへの再生コマンド
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OutputCommand {
    /// 指定メディアの再生を開始
    Play {
        request_id: String,
        media_url: String,
        title: String,
        requester: String,
        volume: u32,
        looped: bool,
    },
    /// 再生を停止（fade_msミリ秒かけてフェードアウト）
    Stop { fade_ms: u64 },
    Pause,
    Resume,
    Seek { position_sec: f64 },
}

/// プレイヤーからのコールバック
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutputEvent {
    /// 再生が最後まで到達した
    Ended { request_id: String },
    /// 再生エラー
    Error { request_id: String, message: String },
}

/// サーバーからクライアントへのメッセージ
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// 再生コマンド
    Command(OutputCommand),
    /// 状態通知（承認・拒否・再生中など）
    Notice(Notice),
    /// 接続確認
    Connected { client_id: ClientId },
    /// サーバー情報
    ServerInfo {
        version: String,
        connected_clients: usize,
    },
}

/// クライアントからサーバーへのメッセージ
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// 再生コールバック
    Event(OutputEvent),
    /// Ping
    Ping,
    /// サーバー情報をリクエスト
    GetInfo,
}

/// サーバーの状態
#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// ポート候補の開始番号
pub const DEFAULT_PORT: u16 = 8765;
/// 試行するポート数
const PORT_PROBE_SPAN: u16 = 9;

/// リモートプレイヤーサーバー
pub struct RemoteServer {
    preferred_port: u16,
    actual_port: Arc<RwLock<Option<u16>>>,
    state: Arc<RwLock<ServerState>>,
    clients: Arc<RwLock<HashMap<ClientId, SocketAddr>>>,
    message_tx: broadcast::Sender<ServerMessage>,
    event_tx: mpsc::UnboundedSender<OutputEvent>,
    event_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<OutputEvent>>>,
    next_client_id: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl RemoteServer {
    /// 新しいサーバーを作成
    ///
    /// `port`は希望ポート。使用中なら起動時に次のポートを試行する。
    pub fn new(port: u16) -> Self {
        let (message_tx, _) = broadcast::channel(1024);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            preferred_port: port,
            actual_port: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            clients: Arc::new(RwLock::new(HashMap::new())),
            message_tx,
            event_tx,
            event_rx: parking_lot::Mutex::new(Some(event_rx)),
            next_client_id: Arc::new(AtomicU64::new(1)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// プレイヤーコールバックの受信側を取り出す（1回だけ）
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<OutputEvent>> {
        self.event_rx.lock().take()
    }

    /// サーバーを起動
    ///
    /// 希望ポートが使用中の場合、自動的に次のポート（最大10ポート）を試行する。
    pub async fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                tracing::warn!("Remote server is already in state: {:?}", *state);
                return Err(anyhow::anyhow!("Server is already running or starting"));
            }
            *state = ServerState::Starting;
        }

        self.shutdown.store(false, Ordering::SeqCst);

        let port_range_end = self.preferred_port.saturating_add(PORT_PROBE_SPAN);
        let (listener, bound_port) = self
            .try_bind_ports(self.preferred_port, port_range_end)
            .await?;

        {
            let mut actual = self.actual_port.write().await;
            *actual = Some(bound_port);
        }

        let addr = format!("127.0.0.1:{}", bound_port);
        if bound_port != self.preferred_port {
            tracing::info!(
                "🌐 Remote player server listening on ws://{} (preferred port {} was unavailable)",
                addr,
                self.preferred_port
            );
        } else {
            tracing::info!("🌐 Remote player server listening on ws://{}", addr);
        }

        {
            let mut state = self.state.write().await;
            *state = ServerState::Running;
        }

        let clients = Arc::clone(&self.clients);
        let message_tx = self.message_tx.clone();
        let event_tx = self.event_tx.clone();
        let next_client_id = Arc::clone(&self.next_client_id);
        let shutdown = Arc::clone(&self.shutdown);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            while !shutdown.load(Ordering::SeqCst) {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
                                tracing::info!("📥 New player connection from {} (client_id: {})", addr, client_id);

                                let clients = Arc::clone(&clients);
                                let mut message_rx = message_tx.subscribe();
                                let event_tx = event_tx.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, client_id, clients, &mut message_rx, event_tx).await {
                                        tracing::warn!("Player connection error for client {}: {}", client_id, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                        // Check shutdown flag periodically
                    }
                }
            }

            let mut state_guard = state.write().await;
            *state_guard = ServerState::Stopped;
            tracing::info!("🛑 Remote player server stopped");
        });

        Ok(())
    }

    /// 指定範囲のポートを順番に試行してバインド
    async fn try_bind_ports(
        &self,
        start_port: u16,
        end_port: u16,
    ) -> anyhow::Result<(TcpListener, u16)> {
        let mut last_error = None;

        for port in start_port..=end_port {
            let addr = format!("127.0.0.1:{}", port);
            tracing::debug!("Attempting to bind remote server to {}", addr);

            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    return Ok((listener, port));
                }
                Err(e) => {
                    tracing::debug!("Port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "No ports available")
        });
        tracing::error!(
            "❌ Failed to bind remote server to any port in range {}-{}: {}",
            start_port,
            end_port,
            err
        );

        let mut state = self.state.write().await;
        *state = ServerState::Stopped;

        Err(anyhow::anyhow!(
            "Failed to bind to any port in range {}-{}: {}",
            start_port,
            end_port,
            err
        ))
    }

    /// サーバーを停止
    pub async fn stop(&self) {
        tracing::info!("🛑 Stopping remote player server...");

        {
            let mut state = self.state.write().await;
            *state = ServerState::Stopping;
        }

        self.shutdown.store(true, Ordering::SeqCst);

        {
            let mut actual = self.actual_port.write().await;
            *actual = None;
        }

        let mut clients = self.clients.write().await;
        clients.clear();
    }

    /// 再生コマンドを全プレイヤーへ送信
    pub async fn send_command(&self, command: &OutputCommand) {
        self.broadcast(ServerMessage::Command(command.clone())).await;
    }

    /// 通知を全プレイヤーへ送信
    pub async fn send_notice(&self, notice: &Notice) {
        self.broadcast(ServerMessage::Notice(notice.clone())).await;
    }

    /// 全クライアントはブロードキャストチャネル経由で受信する（各1回）
    async fn broadcast(&self, message: ServerMessage) {
        if let Err(e) = self.message_tx.send(message) {
            tracing::trace!("No active subscribers for broadcast: {}", e);
        }
    }

    /// 接続中のクライアント数を取得
    pub async fn connected_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn get_state(&self) -> ServerState {
        self.state.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == ServerState::Running
    }

    pub fn preferred_port(&self) -> u16 {
        self.preferred_port
    }

    /// 実際に使用中のポート番号（未起動ならNone）
    pub async fn actual_port(&self) -> Option<u16> {
        *self.actual_port.read().await
    }
}

/// WebSocket接続を処理
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    client_id: ClientId,
    clients: Arc<RwLock<HashMap<ClientId, SocketAddr>>>,
    message_rx: &mut broadcast::Receiver<ServerMessage>,
    event_tx: mpsc::UnboundedSender<OutputEvent>,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    {
        let mut clients_guard = clients.write().await;
        clients_guard.insert(client_id, addr);
    }

    let connected_msg = ServerMessage::Connected { client_id };
    let json = serde_json::to_string(&connected_msg)?;
    write.send(Message::Text(json)).await?;

    tracing::info!("✅ Player {} connected from {}", client_id, addr);

    loop {
        tokio::select! {
            // プレイヤーからのメッセージを処理
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) {
                            match client_msg {
                                ClientMessage::Event(event) => {
                                    tracing::debug!(client_id = client_id, "Player callback: {:?}", event);
                                    if event_tx.send(event).is_err() {
                                        tracing::warn!("Playback event receiver dropped");
                                    }
                                }
                                ClientMessage::Ping => {
                                    write.send(Message::Pong(vec![])).await?;
                                }
                                ClientMessage::GetInfo => {
                                    let clients_guard = clients.read().await;
                                    let info = ServerMessage::ServerInfo {
                                        version: env!("CARGO_PKG_VERSION").to_string(),
                                        connected_clients: clients_guard.len(),
                                    };
                                    let json = serde_json::to_string(&info)?;
                                    write.send(Message::Text(json)).await?;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("📤 Player {} disconnected", client_id);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error for client {}: {}", client_id, e);
                        break;
                    }
                    _ => {}
                }
            }

            // ブロードキャストメッセージを中継
            msg = message_rx.recv() => {
                if let Ok(server_msg) = msg {
                    let json = serde_json::to_string(&server_msg)?;
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    {
        let mut clients_guard = clients.write().await;
        clients_guard.remove(&client_id);
    }

    Ok(())
}
