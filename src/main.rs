/// MySQL 복제 클라이언트 실행 진입점
///
/// REPLICANT_READ_BINLOGS에 파일 목록이 있으면 나열된 binlog 파일들을
/// 오프라인으로 디코드하고 종료합니다. 없으면 설정된 마스터에 접속해
/// 이벤트를 스트리밍합니다.
use replicant::{replay_binlog_file, MasterConfig, ReplicationClient};
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    // 오프라인 모드: binlog 파일 디코드 후 종료
    if let Ok(files) = env::var("REPLICANT_READ_BINLOGS") {
        for filename in files.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            info!("decoding binlog file {}", filename);

            let summary = replay_binlog_file(filename, |event| {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("failed to serialize event: {}", e),
                }
            })
            .await?;

            info!(
                "{}: {} events, {} undecodable, truncated: {}",
                filename, summary.events, summary.undecodable, summary.truncated
            );
        }
        return Ok(());
    }

    // 네트워크 모드: 마스터에서 binlog 스트리밍
    let config = MasterConfig {
        hostname: env::var("REPLICANT_MASTER_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("REPLICANT_MASTER_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306),
        username: env::var("REPLICANT_USERNAME").unwrap_or_else(|_| "repl".to_string()),
        password: env::var("REPLICANT_PASSWORD").unwrap_or_default(),
        database: env::var("REPLICANT_DATABASE").ok(),
        server_id: env::var("REPLICANT_SERVER_ID")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .unwrap_or(2),
    };

    info!(
        "starting replication from {}:{}",
        config.hostname, config.port
    );

    let client = ReplicationClient::new(config);
    let mut events = client.start_streaming().await?;

    while let Some(event) = events.recv().await {
        info!(
            "event: type={:?}, time={}, size={}, next_pos={}",
            event.header.event_type,
            event.header.datetime(),
            event.header.event_size,
            event.header.next_pos
        );
    }

    info!("binlog stream closed");
    Ok(())
}
