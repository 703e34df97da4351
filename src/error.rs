//! 복제 클라이언트 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicantError {
    /// 아직 바이트가 부족함. 에러가 아니라 "나중에 다시" 신호.
    /// 프레임 계층에서 흡수되어 호출자에게 전파되지 않습니다.
    #[error("입력이 잘렸습니다: {0}")]
    TruncatedInput(String),

    #[error("MySQL 연결 에러: {0}")]
    ConnectionFailed(String),

    #[error("인증 실패: {0}")]
    AuthenticationFailed(String),

    #[error("잘못된 패킷: {0}")]
    MalformedPacket(String),

    #[error("잘못된 length-encoded 정수: {0}")]
    MalformedInteger(String),

    #[error("잘못된 결과셋: {0}")]
    MalformedResultSet(String),

    #[error("잘못된 binlog 이벤트: {0}")]
    MalformedEvent(String),

    #[error("Binlog 파일이 아닙니다: {0}")]
    NotABinlogFile(String),

    #[error("Binlog 파일이 잘렸습니다: {0}")]
    TruncatedFile(String),

    #[error("I/O 에러: {0}")]
    IoError(String),
}

impl From<io::Error> for ReplicantError {
    fn from(err: io::Error) -> Self {
        ReplicantError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReplicantError>;
