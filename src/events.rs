//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// MySQL Binlog 이벤트 타입
///
/// 알 수 없는 타입 코드는 `Other`로 보존됩니다. 헤더만으로 다음 이벤트
/// 경계를 찾을 수 있으므로 스트림 에러가 아닙니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// 쿼리 이벤트 (DDL, BEGIN/COMMIT)
    Query,
    /// 마스터 종료 이벤트
    Stop,
    /// 로테이션 이벤트 (새 binlog 파일)
    Rotate,
    /// INSERT_ID / LAST_INSERT_ID 이벤트
    Intvar,
    /// Binlog 포맷 기술 이벤트 (파일 선두)
    FormatDescription,
    /// 트랜잭션 커밋 (XID) 이벤트
    Xid,
    /// 테이블 맵 이벤트 (컬럼 타입/메타데이터)
    TableMap,
    /// 그 외 타입 코드
    Other(u8),
}

impl EventType {
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => EventType::Query,
            3 => EventType::Stop,
            4 => EventType::Rotate,
            5 => EventType::Intvar,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            other => EventType::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EventType::Query => 2,
            EventType::Stop => 3,
            EventType::Rotate => 4,
            EventType::Intvar => 5,
            EventType::FormatDescription => 15,
            EventType::Xid => 16,
            EventType::TableMap => 19,
            EventType::Other(code) => *code,
        }
    }
}

/// Binlog 이벤트 공통 헤더 (19 bytes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위 epoch)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// 이벤트를 생성한 MySQL 서버 ID
    pub server_id: u32,
    /// 헤더를 포함한 전체 이벤트 크기 (바이트)
    pub event_size: u32,
    /// 다음 이벤트의 로그 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    /// 타임스탬프를 UTC 시각으로 변환
    pub fn datetime(&self) -> DateTime<Utc> {
        // u32 범위의 초 단위 epoch은 항상 유효한 시각
        Utc.timestamp_opt(i64::from(self.timestamp), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 쿼리를 실행한 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    /// 서버측 에러 코드 (0 = 성공)
    pub error_code: u16,
    /// 기본 데이터베이스명
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일에서의 시작 위치
    pub position: u64,
}

/// 컬럼 타입별 메타데이터
///
/// 테이블 맵 이벤트의 메타데이터 블록은 스키마 자기기술이 없어서,
/// 각 컬럼이 소비하는 폭과 해석이 선언된 타입 코드에 따라 달라집니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnMeta {
    /// MYSQL_TYPE_STRING: byte 0 = 실제 서브타입, byte 1 = 필드 길이
    String { real_type: u8, length: u8 },
    /// MYSQL_TYPE_VAR_STRING: 2바이트 LE 필드 길이
    VarString { length: u16 },
    /// MYSQL_TYPE_BLOB: pack-length 지시자 (1..4), 길이 자체가 아님
    Blob { pack_length: u8 },
    /// MYSQL_TYPE_DECIMAL: byte 0 = precision, byte 1 = decimals
    Decimal { precision: u8, decimals: u8 },
    /// MYSQL_TYPE_FLOAT / DOUBLE: pack-length
    Float { pack_length: u8 },
    /// MYSQL_TYPE_ENUM: byte 0 = 실제 타입 (ENUM|SET), byte 1 = pack-length
    Enum { real_type: u8, pack_length: u8 },
    /// MYSQL_TYPE_BIT: 비트 수 / 바이트 수 쌍
    Bit { bits: u8, bytes: u8 },
    /// 메타데이터가 없는 타입
    None,
}

/// 테이블 맵 이벤트 데이터 (스키마 정보)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID (6 bytes)
    pub table_id: u64,
    /// 플래그
    pub flags: u16,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 선언 순서대로의 컬럼 타입 코드들
    pub column_types: Vec<u8>,
    /// 컬럼별 해석된 메타데이터
    pub column_meta: Vec<ColumnMeta>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

/// 이벤트 타입별 본문
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    Query(QueryEventData),
    Rotate(RotateEventData),
    TableMap(TableMapData),
    /// 헤더만 의미가 있는 타입들: 본문 존재/크기 검증만 수행
    Stop,
    FormatDescription,
    Intvar,
    Xid,
    /// 인식하지 못한 타입 코드. 원본 본문을 그대로 보존합니다.
    Unknown(Vec<u8>),
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: BinlogEventData,
}

impl BinlogEvent {
    /// 디코더가 본문을 해석하지 못한 이벤트인지 여부
    pub fn is_unhandled(&self) -> bool {
        matches!(self.data, BinlogEventData::Unknown(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for code in 0u8..=255 {
            assert_eq!(EventType::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_event_type_known_codes() {
        assert_eq!(EventType::from_code(2), EventType::Query);
        assert_eq!(EventType::from_code(4), EventType::Rotate);
        assert_eq!(EventType::from_code(19), EventType::TableMap);
        assert_eq!(EventType::from_code(30), EventType::Other(30));
    }

    #[test]
    fn test_header_datetime() {
        let header = EventHeader {
            timestamp: 0,
            event_type: EventType::Stop,
            server_id: 1,
            event_size: 19,
            next_pos: 23,
            flags: 0,
        };
        assert_eq!(header.datetime().timestamp(), 0);
    }
}
