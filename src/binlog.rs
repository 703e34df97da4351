//! MySQL Binlog 이벤트 디코더
//!
//! Binlog 파일/스트림의 바이너리 형식을 파싱합니다.
//! 파일 헤더: 4 바이트 매직 넘버 (0xfe 0x62 0x69 0x6e)
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Size (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Body (event_size - 19 bytes)

use crate::error::{ReplicantError, Result};
use crate::events::*;
use crate::protocol::{read_fixed_bytes, read_lenenc_int};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::debug;

/// Binlog 파일 매직 넘버 (0xfe "bin")
pub const BINLOG_MAGIC: &[u8] = &[0xfe, 0x62, 0x69, 0x6e];

/// 이벤트 공통 헤더 크기
pub const EVENT_HEADER_SIZE: usize = 19;

/// MySQL 컬럼 타입 코드
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const BIT: u8 = 16;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

fn short_body(what: &str) -> ReplicantError {
    ReplicantError::MalformedEvent(format!("event body too short: {}", what))
}

/// 이벤트 본문 안에서의 lenenc 읽기
///
/// 완전한 이벤트 안에서 바이트가 모자라면 재시도가 아니라 손상입니다.
fn body_lenenc(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u64> {
    read_lenenc_int(cursor).map_err(|e| match e {
        ReplicantError::TruncatedInput(_) => short_body(what),
        other => other,
    })
}

fn body_bytes(cursor: &mut Cursor<&[u8]>, len: usize, what: &str) -> Result<Vec<u8>> {
    read_fixed_bytes(cursor, len).map_err(|_| short_body(what))
}

/// Binlog 파일 매직 넘버 검증
pub fn verify_magic(data: &[u8]) -> Result<()> {
    if data.len() < BINLOG_MAGIC.len() {
        return Err(ReplicantError::NotABinlogFile(
            "file shorter than magic header".to_string(),
        ));
    }

    if &data[0..4] == BINLOG_MAGIC {
        Ok(())
    } else {
        Err(ReplicantError::NotABinlogFile(format!(
            "bad magic: {:02x?}",
            &data[0..4]
        )))
    }
}

/// 이벤트 헤더 파싱 (고정 19바이트 레이아웃)
pub fn parse_event_header(data: &[u8]) -> Result<EventHeader> {
    if data.len() < EVENT_HEADER_SIZE {
        return Err(ReplicantError::MalformedEvent(format!(
            "event header needs {} bytes, got {}",
            EVENT_HEADER_SIZE,
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);

    let timestamp = cursor.read_u32::<LittleEndian>().map_err(|_| short_body("timestamp"))?;
    let type_code = cursor.read_u8().map_err(|_| short_body("type"))?;
    let server_id = cursor.read_u32::<LittleEndian>().map_err(|_| short_body("server id"))?;
    let event_size = cursor.read_u32::<LittleEndian>().map_err(|_| short_body("size"))?;
    let next_pos = cursor.read_u32::<LittleEndian>().map_err(|_| short_body("next pos"))?;
    let flags = cursor.read_u16::<LittleEndian>().map_err(|_| short_body("flags"))?;

    Ok(EventHeader {
        timestamp,
        event_type: EventType::from_code(type_code),
        server_id,
        event_size,
        next_pos,
        flags,
    })
}

/// 완전한 이벤트 (헤더 + 본문) 파싱
///
/// 선언된 크기보다 짧은 본문은 `MalformedEvent`이며, 이벤트 중간에서는
/// 재동기화할 수 없으므로 호출자는 스트림을 중단해야 합니다.
pub fn parse_event(data: &[u8]) -> Result<BinlogEvent> {
    let header = parse_event_header(data)?;

    let event_size = header.event_size as usize;
    if event_size < EVENT_HEADER_SIZE {
        return Err(ReplicantError::MalformedEvent(format!(
            "declared event size {} below header size",
            event_size
        )));
    }
    if data.len() < event_size {
        return Err(ReplicantError::MalformedEvent(format!(
            "event body shorter than declared: {} < {}",
            data.len(),
            event_size
        )));
    }

    let body = &data[EVENT_HEADER_SIZE..event_size];
    let data = parse_event_body(&header, body)?;

    Ok(BinlogEvent { header, data })
}

/// 이벤트 타입에 따른 본문 디스패치
///
/// 인식하지 못한 타입은 에러가 아니라 `Unknown`으로 보고되어, 이후
/// 이벤트의 바이트 계산이 어긋나지 않습니다.
pub fn parse_event_body(header: &EventHeader, body: &[u8]) -> Result<BinlogEventData> {
    match header.event_type {
        EventType::Query => Ok(BinlogEventData::Query(parse_query_event(body)?)),
        EventType::Rotate => Ok(BinlogEventData::Rotate(parse_rotate_event(body)?)),
        EventType::TableMap => Ok(BinlogEventData::TableMap(parse_table_map_event(body)?)),
        EventType::Stop => Ok(BinlogEventData::Stop),
        EventType::FormatDescription => {
            // binlog-version (2) + server-version (50) + timestamp (4) + header-length (1)
            if body.len() < 57 {
                return Err(short_body("format description"));
            }
            Ok(BinlogEventData::FormatDescription)
        }
        EventType::Intvar => {
            // type (1) + value (8)
            if body.len() < 9 {
                return Err(short_body("intvar"));
            }
            Ok(BinlogEventData::Intvar)
        }
        EventType::Xid => {
            // xid (8)
            if body.len() < 8 {
                return Err(short_body("xid"));
            }
            Ok(BinlogEventData::Xid)
        }
        EventType::Other(code) => {
            debug!("unhandled event type {} ({} byte body)", code, body.len());
            Ok(BinlogEventData::Unknown(body.to_vec()))
        }
    }
}

/// QUERY 이벤트 파싱 (2)
fn parse_query_event(body: &[u8]) -> Result<QueryEventData> {
    let mut cursor = Cursor::new(body);

    let thread_id = cursor.read_u32::<LittleEndian>().map_err(|_| short_body("thread id"))?;
    let exec_time = cursor.read_u32::<LittleEndian>().map_err(|_| short_body("exec time"))?;
    let db_len = cursor.read_u8().map_err(|_| short_body("db length"))? as usize;
    let error_code = cursor.read_u16::<LittleEndian>().map_err(|_| short_body("error code"))?;
    let status_len = cursor.read_u16::<LittleEndian>().map_err(|_| short_body("status length"))? as usize;

    // Status variables skip
    body_bytes(&mut cursor, status_len, "status variables")?;

    // 데이터베이스명 + null terminator
    let db_bytes = body_bytes(&mut cursor, db_len, "database name")?;
    let database = String::from_utf8_lossy(&db_bytes).to_string();
    cursor.read_u8().map_err(|_| short_body("database terminator"))?;

    // 나머지 전부가 쿼리
    let query = String::from_utf8_lossy(&body[cursor.position() as usize..]).to_string();

    Ok(QueryEventData {
        thread_id,
        exec_time,
        error_code,
        database,
        query,
    })
}

/// ROTATE 이벤트 파싱 (4)
fn parse_rotate_event(body: &[u8]) -> Result<RotateEventData> {
    let mut cursor = Cursor::new(body);

    let position = cursor.read_u64::<LittleEndian>().map_err(|_| short_body("rotate position"))?;
    let filename_bytes = &body[cursor.position() as usize..];
    let next_binlog_name = String::from_utf8_lossy(filename_bytes).to_string();

    Ok(RotateEventData {
        next_binlog_name,
        position,
    })
}

/// TABLE_MAP 이벤트 파싱 (19)
fn parse_table_map_event(body: &[u8]) -> Result<TableMapData> {
    let mut cursor = Cursor::new(body);

    let table_id = cursor
        .read_u48::<LittleEndian>()
        .map_err(|_| short_body("table id"))?;
    let flags = cursor.read_u16::<LittleEndian>().map_err(|_| short_body("table flags"))?;

    // 데이터베이스명: 길이 + 바이트 + null terminator
    let db_len = cursor.read_u8().map_err(|_| short_body("db length"))? as usize;
    let db_bytes = body_bytes(&mut cursor, db_len, "database name")?;
    let database = String::from_utf8_lossy(&db_bytes).to_string();
    cursor.read_u8().map_err(|_| short_body("database terminator"))?;

    // 테이블명: 길이 + 바이트 + null terminator
    let tbl_len = cursor.read_u8().map_err(|_| short_body("table length"))? as usize;
    let tbl_bytes = body_bytes(&mut cursor, tbl_len, "table name")?;
    let table = String::from_utf8_lossy(&tbl_bytes).to_string();
    cursor.read_u8().map_err(|_| short_body("table terminator"))?;

    // 컬럼 타입들
    let column_count = body_lenenc(&mut cursor, "column count")? as usize;
    let column_types = body_bytes(&mut cursor, column_count, "column types")?;

    // 타입 의존적인 메타데이터 블록
    let metadata_len = body_lenenc(&mut cursor, "metadata length")? as usize;
    let metadata = body_bytes(&mut cursor, metadata_len, "column metadata")?;
    let column_meta = parse_column_metadata(&column_types, &metadata)?;

    // nullable bitmap
    let nullable_len = (column_count + 7) / 8;
    let nullable_bitmap = body_bytes(&mut cursor, nullable_len, "nullable bitmap")?;

    Ok(TableMapData {
        table_id,
        flags,
        database,
        table,
        column_types,
        column_meta,
        nullable_bitmap,
    })
}

/// 컬럼 타입 코드가 메타데이터에서 소비하는 폭
///
/// 알 수 없는 타입 코드는 폭 0으로 처리합니다. 미래의 타입이 끼어 있어도
/// 이후 컬럼들의 오프셋 추적이 어긋나지 않게 하기 위한 규칙이며, 여기
/// 한 곳에서만 결정됩니다.
pub fn column_metadata_width(col_type: u8) -> usize {
    match col_type {
        column_type::STRING
        | column_type::VAR_STRING
        | column_type::DECIMAL
        | column_type::ENUM
        | column_type::BIT => 2,
        column_type::BLOB | column_type::FLOAT | column_type::DOUBLE => 1,
        _ => 0,
    }
}

/// 테이블 맵의 컬럼별 메타데이터 해석
///
/// 선언 순서대로 컬럼을 돌며 타입별 폭만큼 오프셋을 전진시킵니다.
/// 선언된 메타데이터 길이를 넘어 읽는 일은 없습니다.
pub fn parse_column_metadata(column_types: &[u8], metadata: &[u8]) -> Result<Vec<ColumnMeta>> {
    let mut column_meta = Vec::with_capacity(column_types.len());
    let mut offset = 0usize;

    for (i, &col_type) in column_types.iter().enumerate() {
        let width = column_metadata_width(col_type);
        if offset + width > metadata.len() {
            return Err(ReplicantError::MalformedEvent(format!(
                "column {} (type {}) metadata overruns block: {} + {} > {}",
                i,
                col_type,
                offset,
                width,
                metadata.len()
            )));
        }

        let span = &metadata[offset..offset + width];
        let decoded = match col_type {
            // byte 0: real type, byte 1: field length
            column_type::STRING => ColumnMeta::String {
                real_type: span[0],
                length: span[1],
            },
            // 2 byte length (little-endian)
            column_type::VAR_STRING => ColumnMeta::VarString {
                length: u16::from_le_bytes([span[0], span[1]]),
            },
            // the pack length (1 .. 4)
            column_type::BLOB => ColumnMeta::Blob { pack_length: span[0] },
            // byte 0: precision, byte 1: decimals
            column_type::DECIMAL => ColumnMeta::Decimal {
                precision: span[0],
                decimals: span[1],
            },
            // pack length
            column_type::FLOAT | column_type::DOUBLE => ColumnMeta::Float { pack_length: span[0] },
            // byte 0: real type (ENUM|SET), byte 1: pack length
            column_type::ENUM => ColumnMeta::Enum {
                real_type: span[0],
                pack_length: span[1],
            },
            column_type::BIT => ColumnMeta::Bit {
                bits: span[0],
                bytes: span[1],
            },
            _ => ColumnMeta::None,
        };

        column_meta.push(decoded);
        offset += width;
    }

    Ok(column_meta)
}
