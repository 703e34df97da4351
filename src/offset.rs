//! Binlog 좌표 (파일명 + 바이트 위치)
//!
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use serde::{Deserialize, Serialize};
use std::fmt;

/// Binlog 파일 위치 정보
///
/// 복제 세션은 이 값을 필드 단위로 수정하지 않고 항상 통째로 교체합니다.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename.split('.').next_back().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sequence() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
    }

    #[test]
    fn test_file_sequence_invalid() {
        let pos = BinlogPosition::new("not-a-binlog", 4);
        assert_eq!(pos.file_sequence(), None);
    }

    #[test]
    fn test_display() {
        let pos = BinlogPosition::new("mysql-bin.000001", 4);
        assert_eq!(pos.to_string(), "mysql-bin.000001:4");
    }
}
