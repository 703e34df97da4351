//! 마스터 연결 드라이버
//!
//! 복제 세션은 sans-IO이므로, 여기서 TCP 소켓을 소유하고 수신 바이트를
//! 세션에 먹이고 세션이 내놓는 프레임을 전송합니다. 디코드된 이벤트는
//! unbounded 채널로 소비자에게 전달됩니다.

use crate::error::{ReplicantError, Result};
use crate::events::BinlogEvent;
use crate::offset::BinlogPosition;
use crate::protocol;
use crate::replication::{ReplicationSession, SessionConfig, Step};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// 마스터 연결 설정
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// COM_BINLOG_DUMP에 실어 보내는 우리측 서버 ID
    pub server_id: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "repl".to_string(),
            password: String::new(),
            database: None,
            server_id: 2,
        }
    }
}

impl MasterConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        MasterConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            server_id: self.server_id,
        }
    }
}

/// Binlog 스트리밍 클라이언트
pub struct ReplicationClient {
    config: MasterConfig,
    position: Arc<RwLock<Option<BinlogPosition>>>,
}

impl ReplicationClient {
    pub fn new(config: MasterConfig) -> Self {
        ReplicationClient {
            config,
            position: Arc::new(RwLock::new(None)),
        }
    }

    /// 마지막으로 관측된 binlog 좌표
    pub fn current_position(&self) -> Option<BinlogPosition> {
        self.position.read().clone()
    }

    /// 마스터에 접속해 binlog 스트리밍 시작
    ///
    /// 이벤트는 반환된 채널로 도착 순서 그대로 전달됩니다. 수신자가
    /// 닫히면 세션도 종료됩니다.
    pub async fn start_streaming(&self) -> Result<mpsc::UnboundedReceiver<BinlogEvent>> {
        let address = self.config.address();
        let stream = TcpStream::connect(&address).await.map_err(|e| {
            ReplicantError::ConnectionFailed(format!("failed to connect to {}: {}", address, e))
        })?;

        info!("connected to MySQL master at {}", address);

        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let position = Arc::clone(&self.position);

        tokio::spawn(async move {
            match run_session(stream, config, position, tx).await {
                Ok(_) => info!("binlog streaming ended"),
                Err(e) => error!("binlog streaming error: {}", e),
            }
        });

        Ok(rx)
    }
}

/// 읽기 → feed → poll 루프
async fn run_session(
    mut stream: TcpStream,
    config: MasterConfig,
    position: Arc<RwLock<Option<BinlogPosition>>>,
    tx: mpsc::UnboundedSender<BinlogEvent>,
) -> Result<()> {
    let mut session = ReplicationSession::new(config.session_config());
    let mut read_buf = [0u8; 8192];

    loop {
        loop {
            match session.poll()? {
                Step::NeedMore => break,
                Step::Send { sequence, payload } => {
                    let frame = protocol::encode_frame(sequence, &payload);
                    stream.write_all(&frame).await.map_err(|e| {
                        ReplicantError::IoError(format!("failed to write frame: {}", e))
                    })?;
                    stream.flush().await.map_err(|e| {
                        ReplicantError::IoError(format!("failed to flush: {}", e))
                    })?;
                }
                Step::Event(event) => {
                    *position.write() = session.position().cloned();

                    debug!(
                        "event: type={:?}, size={}, next_pos={}",
                        event.header.event_type, event.header.event_size, event.header.next_pos
                    );

                    if tx.send(event).is_err() {
                        info!("event consumer dropped, closing session");
                        return Ok(());
                    }
                }
                Step::Continue => {}
                Step::Closed => return Ok(()),
            }
        }

        let n = stream.read(&mut read_buf).await.map_err(|e| {
            ReplicantError::IoError(format!("failed to read from master: {}", e))
        })?;
        if n == 0 {
            return Err(ReplicantError::ConnectionFailed(
                "master closed the connection".to_string(),
            ));
        }

        session.feed(&read_buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_config_default() {
        let config = MasterConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.username, "repl");
        assert_eq!(config.server_id, 2);
    }

    #[test]
    fn test_master_config_new() {
        let config = MasterConfig::new("127.0.0.1", "backup");
        assert_eq!(config.address(), "127.0.0.1:3306");
        assert_eq!(config.username, "backup");
    }

    #[test]
    fn test_client_starts_without_position() {
        let client = ReplicationClient::new(MasterConfig::default());
        assert!(client.current_position().is_none());
    }
}
