//! MySQL 프로토콜 와이어 코덱
//!
//! 패킷 프레이밍 (3 bytes length + 1 byte sequence), length-encoded 정수,
//! 핸드셰이크 챌린지, COM_QUERY / COM_BINLOG_DUMP 직렬화를 담당합니다.
//! 모든 디코드 루틴은 입력 바이트에 대한 순수 함수이며 블로킹하지 않고,
//! 호출이 끝난 뒤 입력 버퍼에 대한 참조를 보존하지 않습니다.

use crate::error::{ReplicantError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BytesMut};
use std::io::{Cursor, Read, Write};

/// 패킷 헤더 크기 (3 bytes length + 1 byte sequence)
pub const NET_HEADER_SIZE: usize = 4;

/// COM_QUERY 명령어 코드
pub const COM_QUERY: u8 = 0x03;

/// COM_BINLOG_DUMP 명령어 코드
pub const COM_BINLOG_DUMP: u8 = 0x12;

/// COM_BINLOG_DUMP 플래그: 스트림 끝에서 블로킹하지 않고 EOF 반환
pub const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;

/// 핸드셰이크 페이로드의 최소 고정 크기
///
/// protocol version (1) + server version ("" + nul, 1) + thread id (4)
/// + scramble part 1 (8) + filler (1) + capabilities lower (2) + charset (1)
/// + status (2) + capabilities upper (2) + auth data len (1) + reserved (10)
/// + scramble part 2 (13)
const MIN_HANDSHAKE_SIZE: usize = 46;

/// 패킷 헤더 읽기
///
/// 4바이트 미만이면 `TruncatedInput`을 반환하며, 실패 시 아무것도
/// 소비하지 않으므로 바이트가 더 모인 뒤 그대로 재호출할 수 있습니다.
pub fn read_packet_header(buf: &[u8]) -> Result<(u32, u8)> {
    if buf.len() < NET_HEADER_SIZE {
        return Err(ReplicantError::TruncatedInput(format!(
            "packet header needs 4 bytes, got {}",
            buf.len()
        )));
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]);
    let sequence = buf[3];

    Ok((length, sequence))
}

/// 패킷 헤더 + 페이로드를 하나의 프레임으로 직렬화
pub fn encode_frame(sequence: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(NET_HEADER_SIZE + payload.len());
    let length = (payload.len() as u32).to_le_bytes();
    frame.extend_from_slice(&length[0..3]);
    frame.push(sequence);
    frame.extend_from_slice(payload);
    frame
}

/// Length-encoded 정수 읽기
///
/// 태그 바이트 규칙: `<0xfb`은 그 바이트 자체, `0xfb`은 NULL 컬럼 표시
/// (0으로 읽음), `0xfc`은 2바이트 LE, `0xfd`은 3바이트, `0xfe`은 8바이트.
/// `0xff`은 예약값이므로 `MalformedInteger`.
pub fn read_lenenc_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let tag = cursor
        .read_u8()
        .map_err(|_| ReplicantError::TruncatedInput("lenenc tag".to_string()))?;

    match tag {
        0..=0xfa => Ok(u64::from(tag)),
        0xfb => Ok(0),
        0xfc => Ok(u64::from(cursor.read_u16::<LittleEndian>().map_err(|_| {
            ReplicantError::TruncatedInput("lenenc u16".to_string())
        })?)),
        0xfd => Ok(u64::from(cursor.read_u24::<LittleEndian>().map_err(|_| {
            ReplicantError::TruncatedInput("lenenc u24".to_string())
        })?)),
        0xfe => Ok(cursor.read_u64::<LittleEndian>().map_err(|_| {
            ReplicantError::TruncatedInput("lenenc u64".to_string())
        })?),
        0xff => Err(ReplicantError::MalformedInteger(
            "reserved lenenc tag 0xff".to_string(),
        )),
    }
}

/// Length-encoded 정수 쓰기
pub fn write_lenenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfb {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfc);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xff_ffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[0..3]);
    } else {
        buf.push(0xfe);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// 선언된 길이만큼 바이트 읽기
///
/// 남은 바이트가 선언보다 적으면 `TruncatedInput`.
pub fn read_fixed_bytes(cursor: &mut Cursor<&[u8]>, declared_len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; declared_len];
    Read::read_exact(cursor, &mut bytes).map_err(|_| {
        ReplicantError::TruncatedInput(format!("expected {} more bytes", declared_len))
    })?;
    Ok(bytes)
}

/// 선언된 길이의 문자열 읽기 (길이는 보통 직전의 lenenc 정수)
pub fn read_lenenc_string(cursor: &mut Cursor<&[u8]>, declared_len: usize) -> Result<String> {
    let bytes = read_fixed_bytes(cursor, declared_len)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// null로 끝나는 문자열 읽기
pub fn read_null_terminated_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = cursor
            .read_u8()
            .map_err(|_| ReplicantError::TruncatedInput("unterminated string".to_string()))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xff
}

/// EOF 패킷 확인 (0xFE, 페이로드 9바이트 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xfe && data.len() < 9
}

/// Error 패킷에서 에러 코드와 메시지 추출
///
/// 레이아웃: 0xFF + code (2) + '#' + sql-state (5) + message
pub fn parse_error_packet(data: &[u8]) -> (u16, String) {
    if data.len() < 3 {
        return (0, String::new());
    }
    let code = u16::from_le_bytes([data[1], data[2]]);
    let message = if data.len() > 9 && data[3] == b'#' {
        String::from_utf8_lossy(&data[9..]).to_string()
    } else {
        String::from_utf8_lossy(&data[3..]).to_string()
    };
    (code, message)
}

/// COM_QUERY 패킷 페이로드 생성
pub fn encode_query(statement: &str) -> Vec<u8> {
    let mut payload = vec![COM_QUERY];
    payload.extend_from_slice(statement.as_bytes());
    payload
}

/// 서버가 핸드셰이크로 보내는 인증 챌린지
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// 20바이트 챌린지 논스 (8 + 12로 나뉘어 전송됨)
    pub challenge: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
}

impl AuthChallenge {
    /// 핸드셰이크 페이로드 디코드
    ///
    /// 최소 고정 크기보다 짧으면 `MalformedPacket`. 프레임 계층이 완전한
    /// 패킷만 넘기므로, 여기서의 모든 읽기 실패는 프로토콜 위반입니다.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < MIN_HANDSHAKE_SIZE {
            return Err(ReplicantError::MalformedPacket(format!(
                "handshake payload too short: {} < {}",
                payload.len(),
                MIN_HANDSHAKE_SIZE
            )));
        }

        Self::decode_fields(payload)
            .map_err(|e| ReplicantError::MalformedPacket(format!("handshake: {}", e)))
    }

    fn decode_fields(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);

        // Protocol version (1 byte)
        let protocol_version = cursor
            .read_u8()
            .map_err(|_| ReplicantError::TruncatedInput("protocol version".to_string()))?;

        // Server version (null-terminated string)
        let server_version = read_null_terminated_string(&mut cursor)?;

        // Connection (thread) ID (4 bytes)
        let connection_id = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| ReplicantError::TruncatedInput("connection id".to_string()))?;

        // Auth plugin data part 1 (8 bytes)
        let challenge_part1 = read_fixed_bytes(&mut cursor, 8)?;

        // Filler (1 byte, always 0x00)
        cursor
            .read_u8()
            .map_err(|_| ReplicantError::TruncatedInput("filler".to_string()))?;

        // Capability flags (lower 2 bytes)
        let capabilities_lower = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| ReplicantError::TruncatedInput("capabilities lower".to_string()))?;

        // Character set (1 byte)
        let charset = cursor
            .read_u8()
            .map_err(|_| ReplicantError::TruncatedInput("charset".to_string()))?;

        // Status flags (2 bytes)
        let status = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| ReplicantError::TruncatedInput("status".to_string()))?;

        // Capability flags (upper 2 bytes)
        let capabilities_upper = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| ReplicantError::TruncatedInput("capabilities upper".to_string()))?;

        let capabilities = (u32::from(capabilities_upper) << 16) | u32::from(capabilities_lower);

        // Length of auth plugin data (1 byte)
        let auth_data_len = cursor
            .read_u8()
            .map_err(|_| ReplicantError::TruncatedInput("auth data length".to_string()))?;

        // Reserved (10 bytes)
        read_fixed_bytes(&mut cursor, 10)?;

        // Auth plugin data part 2 (at least 13 bytes, last one is a nul)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let challenge_part2 = read_fixed_bytes(&mut cursor, part2_len)?;

        let mut challenge = challenge_part1;
        challenge.extend_from_slice(&challenge_part2[..challenge_part2.len() - 1]);

        Ok(AuthChallenge {
            protocol_version,
            server_version,
            connection_id,
            challenge,
            capabilities,
            charset,
            status,
        })
    }
}

/// COM_BINLOG_DUMP 요청
#[derive(Debug, Clone)]
pub struct BinlogDumpCommand {
    /// 시작 위치 (4 bytes로 전송)
    pub position: u32,
    /// 플래그 (e.g. BINLOG_DUMP_NON_BLOCK)
    pub flags: u16,
    /// 요청하는 (슬레이브측) 서버 ID
    pub server_id: u32,
    /// 대상 binlog 파일명. 이스케이프 없이 그대로 복사됩니다 (SQL이 아님).
    pub filename: String,
}

impl BinlogDumpCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();

        buffer.write_u8(COM_BINLOG_DUMP)?;

        // Binlog position (4 bytes, little-endian)
        buffer.write_u32::<LittleEndian>(self.position)?;

        // Flags (2 bytes)
        buffer.write_u16::<LittleEndian>(self.flags)?;

        // Server ID (4 bytes)
        buffer.write_u32::<LittleEndian>(self.server_id)?;

        // Binlog filename
        Write::write_all(&mut buffer, self.filename.as_bytes())?;

        Ok(buffer)
    }
}

/// 결과셋의 필드 정의 블록 건너뛰기
///
/// `packets`는 컬럼 개수 패킷 다음부터의 패킷들입니다. 필드 정의 블록을
/// 닫는 EOF 마커 다음 인덱스를 반환합니다.
pub fn skip_field_definitions(packets: &[Vec<u8>]) -> Result<usize> {
    for (i, packet) in packets.iter().enumerate() {
        if is_eof_packet(packet) {
            return Ok(i + 1);
        }
    }

    Err(ReplicantError::MalformedResultSet(
        "field definitions not terminated by EOF".to_string(),
    ))
}

/// 수신 바이트를 쌓아 완전한 패킷 단위로 꺼내는 큐
///
/// `length + 4` 바이트가 모이기 전에는 프레임을 반환하지 않으며, 부분
/// 패킷은 건드리지 않고 그대로 둡니다. 덕분에 `TruncatedInput`이 이 계층
/// 밖으로 새어나가지 않습니다.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: BytesMut,
}

impl PacketBuffer {
    pub fn new() -> Self {
        PacketBuffer {
            buf: BytesMut::new(),
        }
    }

    /// 수신한 바이트 추가
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 다음 완전한 프레임 엿보기 (소비하지 않음)
    pub fn peek_frame(&self) -> Option<(u8, &[u8])> {
        let (length, sequence) = read_packet_header(&self.buf).ok()?;
        let total = NET_HEADER_SIZE + length as usize;
        if self.buf.len() < total {
            return None;
        }
        Some((sequence, &self.buf[NET_HEADER_SIZE..total]))
    }

    /// 다음 완전한 프레임 소비
    pub fn consume_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        let (length, sequence) = read_packet_header(&self.buf).ok()?;
        let total = NET_HEADER_SIZE + length as usize;
        if self.buf.len() < total {
            return None;
        }
        self.buf.advance(NET_HEADER_SIZE);
        let payload = self.buf.split_to(length as usize).to_vec();
        Some((sequence, payload))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
