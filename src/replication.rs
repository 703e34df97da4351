//! MySQL 복제 상태 머신
//!
//! 핸드셰이크 → 인증 → SHOW MASTER STATUS → COM_BINLOG_DUMP 순서를
//! 끝까지 끌고 가는 sans-IO 세션입니다. 소켓은 직접 만지지 않습니다.
//! 호출자(전송 계층)가 수신 바이트를 `feed`로 넣고 `poll`을 돌리면,
//! 보낼 프레임과 디코드된 이벤트가 `Step`으로 나옵니다.

use crate::auth;
use crate::binlog;
use crate::error::{ReplicantError, Result};
use crate::events::{BinlogEvent, BinlogEventData};
use crate::offset::BinlogPosition;
use crate::protocol::{self, AuthChallenge, BinlogDumpCommand, PacketBuffer};
use std::io::Cursor;
use tracing::{info, warn};

/// Binlog 체크섬 비활성화 문장
///
/// 5.6 이후 마스터는 기본적으로 이벤트마다 CRC32를 덧붙이는데, 그대로 두면
/// 이벤트 크기 계산이 어긋나므로 덤프 전에 꺼 달라고 요청합니다.
const CHECKSUM_STATEMENT: &str = "SET @master_binlog_checksum='NONE'";

/// 현재 binlog 좌표를 묻는 고정 문장
const MASTER_STATUS_STATEMENT: &str = "SHOW MASTER STATUS";

/// 복제 세션의 현재 단계
///
/// 상태별 핸들러 함수 포인터 대신, 단계 태그에 대한 match 하나로 모든
/// 전이를 처리합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
    /// 서버의 핸드셰이크 패킷 대기
    AwaitingHandshake,
    /// 인증 응답을 보낸 뒤 OK/ERR 대기
    AwaitingAuthResult,
    /// 체크섬 비활성화 문장에 대한 응답 대기
    AwaitingChecksumAck,
    /// SHOW MASTER STATUS 결과셋 수집 중
    AwaitingStatusResult,
    /// COM_BINLOG_DUMP 이후 이벤트 스트림 수신 중
    Dumping,
    /// 종료됨 (정상 종료 또는 복구 불가능한 에러)
    Closed,
}

/// `poll` 한 번의 결과
#[derive(Debug)]
pub enum Step {
    /// 완전한 패킷이 아직 없음. 바이트가 더 도착한 뒤 다시 호출.
    NeedMore,
    /// 이 페이로드를 프레임에 담아 마스터로 전송해야 함
    Send { sequence: u8, payload: Vec<u8> },
    /// 디코드된 binlog 이벤트
    Event(BinlogEvent),
    /// 패킷 하나를 소비했고 밖으로 내보낼 것은 없음. 계속 호출.
    Continue,
    /// 스트림 종료
    Closed,
}

/// 세션 설정 (세션 수명 동안 불변)
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// COM_BINLOG_DUMP에 실어 보내는 요청측 서버 ID
    pub server_id: u32,
}

/// 연결 하나의 복제 상태
pub struct ReplicationSession {
    config: SessionConfig,
    phase: ReplicationPhase,
    recv: PacketBuffer,
    /// SHOW MASTER STATUS 결과셋 패킷 누적분
    status_packets: Vec<Vec<u8>>,
    status_eofs: u8,
    /// 마지막으로 알게 된 binlog 좌표. 항상 통째로 교체됩니다.
    position: Option<BinlogPosition>,
}

impl ReplicationSession {
    pub fn new(config: SessionConfig) -> Self {
        ReplicationSession {
            config,
            phase: ReplicationPhase::AwaitingHandshake,
            recv: PacketBuffer::new(),
            status_packets: Vec::new(),
            status_eofs: 0,
            position: None,
        }
    }

    pub fn phase(&self) -> ReplicationPhase {
        self.phase
    }

    /// 마지막으로 알게 된 binlog 좌표
    pub fn position(&self) -> Option<&BinlogPosition> {
        self.position.as_ref()
    }

    /// 전송 계층이 수신한 바이트 추가
    pub fn feed(&mut self, data: &[u8]) {
        self.recv.feed(data);
    }

    /// 세션 종료. 연결별 상태를 해제합니다.
    pub fn close(&mut self) {
        self.phase = ReplicationPhase::Closed;
        self.recv = PacketBuffer::new();
        self.status_packets = Vec::new();
        self.status_eofs = 0;
    }

    /// 상태 머신을 한 단계 전진
    ///
    /// 버퍼에 완전한 패킷이 없으면 `NeedMore`를 반환하며 아무것도 소비하지
    /// 않습니다. 같은 호출을 바이트가 더 모인 뒤 그대로 반복하면 됩니다.
    pub fn poll(&mut self) -> Result<Step> {
        if self.phase == ReplicationPhase::Closed {
            return Ok(Step::Closed);
        }

        let (sequence, payload) = match self.recv.consume_frame() {
            Some(frame) => frame,
            None => return Ok(Step::NeedMore),
        };

        match self.on_frame(sequence, payload) {
            Ok(step) => Ok(step),
            Err(e) => {
                // 복구 불가능한 디코드 실패는 이 연결을 끝냄
                self.close();
                Err(e)
            }
        }
    }

    /// 완전한 패킷 하나에 대한 단일 전이 함수
    fn on_frame(&mut self, sequence: u8, payload: Vec<u8>) -> Result<Step> {
        match self.phase {
            ReplicationPhase::AwaitingHandshake => {
                let challenge = AuthChallenge::decode(&payload)?;

                info!(
                    "MySQL server version: {}, connection id: {}",
                    challenge.server_version, challenge.connection_id
                );

                let auth_packet = auth::create_handshake_response(
                    &challenge,
                    &self.config.username,
                    &self.config.password,
                    self.config.database.as_deref(),
                )?;

                self.phase = ReplicationPhase::AwaitingAuthResult;
                Ok(Step::Send {
                    sequence: sequence.wrapping_add(1),
                    payload: auth_packet,
                })
            }

            ReplicationPhase::AwaitingAuthResult => {
                if protocol::is_error_packet(&payload) {
                    let (code, message) = protocol::parse_error_packet(&payload);
                    return Err(ReplicantError::AuthenticationFailed(format!(
                        "server error {}: {}",
                        code, message
                    )));
                }
                if !protocol::is_ok_packet(&payload) {
                    return Err(ReplicantError::MalformedPacket(format!(
                        "auth result should be OK or ERR, got 0x{:02x}",
                        payload.first().copied().unwrap_or(0)
                    )));
                }

                info!("authentication successful");

                self.phase = ReplicationPhase::AwaitingChecksumAck;
                Ok(Step::Send {
                    sequence: 0,
                    payload: protocol::encode_query(CHECKSUM_STATEMENT),
                })
            }

            ReplicationPhase::AwaitingChecksumAck => {
                if protocol::is_error_packet(&payload) {
                    let (code, message) = protocol::parse_error_packet(&payload);
                    warn!(
                        "master rejected binlog checksum override ({}: {}), continuing",
                        code, message
                    );
                }

                self.status_packets.clear();
                self.status_eofs = 0;
                self.phase = ReplicationPhase::AwaitingStatusResult;
                Ok(Step::Send {
                    sequence: 0,
                    payload: protocol::encode_query(MASTER_STATUS_STATEMENT),
                })
            }

            ReplicationPhase::AwaitingStatusResult => {
                if protocol::is_error_packet(&payload) {
                    let (code, message) = protocol::parse_error_packet(&payload);
                    return Err(ReplicantError::MalformedResultSet(format!(
                        "server error {}: {}",
                        code, message
                    )));
                }

                let is_eof = protocol::is_eof_packet(&payload);
                self.status_packets.push(payload);
                if is_eof {
                    self.status_eofs += 1;
                }

                // 필드 정의 블록과 행 블록을 닫는 두 번째 EOF까지 수집
                if self.status_eofs < 2 {
                    return Ok(Step::Continue);
                }

                let position = parse_master_status(&self.status_packets)?;
                self.status_packets = Vec::new();

                info!(
                    "reading binlog from: binlog-file: {}, binlog-pos: {}",
                    position.filename, position.position
                );

                let dump = BinlogDumpCommand {
                    position: position.position as u32,
                    flags: 0,
                    server_id: self.config.server_id,
                    filename: position.filename.clone(),
                };
                let payload = dump.encode()?;

                self.position = Some(position);
                self.phase = ReplicationPhase::Dumping;
                Ok(Step::Send {
                    sequence: 0,
                    payload,
                })
            }

            ReplicationPhase::Dumping => {
                if protocol::is_error_packet(&payload) {
                    let (code, message) = protocol::parse_error_packet(&payload);
                    return Err(ReplicantError::MalformedPacket(format!(
                        "server error {} in dump stream: {}",
                        code, message
                    )));
                }
                if protocol::is_eof_packet(&payload) {
                    info!("binlog stream ended (EOF from master)");
                    self.close();
                    return Ok(Step::Closed);
                }

                // 첫 바이트 0x00은 OK 표시이고 실제 이벤트는 그 다음부터
                let event_data = if protocol::is_ok_packet(&payload) && payload.len() > 1 {
                    &payload[1..]
                } else {
                    &payload[..]
                };

                let event = binlog::parse_event(event_data)?;
                self.track_position(&event);
                Ok(Step::Event(event))
            }

            ReplicationPhase::Closed => Ok(Step::Closed),
        }
    }

    /// 이벤트 헤더/회전 이벤트로 현재 좌표 갱신
    fn track_position(&mut self, event: &BinlogEvent) {
        if let BinlogEventData::Rotate(rotate) = &event.data {
            self.position = Some(BinlogPosition::new(
                rotate.next_binlog_name.clone(),
                rotate.position,
            ));
            return;
        }

        if event.header.next_pos != 0 {
            if let Some(current) = self.position.take() {
                self.position = Some(BinlogPosition::new(
                    current.filename,
                    u64::from(event.header.next_pos),
                ));
            }
        }
    }
}

fn resultset_err(e: ReplicantError) -> ReplicantError {
    match e {
        ReplicantError::TruncatedInput(msg) => ReplicantError::MalformedResultSet(msg),
        other => other,
    }
}

/// SHOW MASTER STATUS 결과셋에서 binlog 좌표 추출
///
/// 컬럼 0이 파일명, 컬럼 1이 텍스트로 된 위치이며, 나머지 컬럼은 해석
/// 없이 건너뜁니다. 행이 여러 개면 마지막 행이 이깁니다.
fn parse_master_status(packets: &[Vec<u8>]) -> Result<BinlogPosition> {
    let first = packets.first().ok_or_else(|| {
        ReplicantError::MalformedResultSet("empty result set".to_string())
    })?;

    let mut cursor = Cursor::new(first.as_slice());
    let column_count = protocol::read_lenenc_int(&mut cursor).map_err(resultset_err)?;

    let rest = &packets[1..];
    let row_start = protocol::skip_field_definitions(rest)?;

    let mut result: Option<BinlogPosition> = None;

    for packet in &rest[row_start..] {
        // 행 블록을 닫는 두 번째 EOF
        if protocol::is_eof_packet(packet) {
            break;
        }

        let mut cursor = Cursor::new(packet.as_slice());
        let mut filename: Option<String> = None;
        let mut position: Option<u64> = None;

        for i in 0..column_count {
            let field_len =
                protocol::read_lenenc_int(&mut cursor).map_err(resultset_err)? as usize;

            if i == 0 {
                if field_len == 0 {
                    return Err(ReplicantError::MalformedResultSet(
                        "empty binlog file name".to_string(),
                    ));
                }
                filename = Some(
                    protocol::read_lenenc_string(&mut cursor, field_len).map_err(resultset_err)?,
                );
            } else if i == 1 {
                if field_len == 0 {
                    return Err(ReplicantError::MalformedResultSet(
                        "empty binlog position".to_string(),
                    ));
                }
                let text =
                    protocol::read_lenenc_string(&mut cursor, field_len).map_err(resultset_err)?;
                position = Some(text.parse().map_err(|_| {
                    ReplicantError::MalformedResultSet(format!(
                        "binlog position not numeric: {}",
                        text
                    ))
                })?);
            } else {
                protocol::read_fixed_bytes(&mut cursor, field_len).map_err(resultset_err)?;
            }
        }

        match (filename, position) {
            // 이전 행의 값은 통째로 교체됨
            (Some(filename), Some(position)) => {
                result = Some(BinlogPosition::new(filename, position));
            }
            _ => {
                return Err(ReplicantError::MalformedResultSet(
                    "row missing binlog coordinates".to_string(),
                ));
            }
        }
    }

    result.ok_or_else(|| ReplicantError::MalformedResultSet("no data row".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::protocol::{encode_frame, COM_BINLOG_DUMP, COM_QUERY};

    fn test_config() -> SessionConfig {
        SessionConfig {
            username: "repl".to_string(),
            password: "secret".to_string(),
            database: None,
            server_id: 2,
        }
    }

    fn handshake_payload() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.push(10); // protocol version
        payload.extend_from_slice(b"8.0.32\0");
        payload.extend_from_slice(&42u32.to_le_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // scramble part 1
        payload.push(0);
        payload.extend_from_slice(&0xf7ffu16.to_le_bytes());
        payload.push(33);
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&0x8001u16.to_le_bytes());
        payload.push(21);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        payload
    }

    fn ok_payload() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    fn eof_payload() -> Vec<u8> {
        vec![0xfe, 0x00, 0x00, 0x02, 0x00]
    }

    fn lenenc_str(value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        protocol::write_lenenc_int(&mut out, value.len() as u64);
        out.extend_from_slice(value.as_bytes());
        out
    }

    /// 5컬럼짜리 SHOW MASTER STATUS 결과셋 패킷들
    fn master_status_packets(file: &str, pos: &str) -> Vec<Vec<u8>> {
        let mut row = Vec::new();
        row.extend_from_slice(&lenenc_str(file));
        row.extend_from_slice(&lenenc_str(pos));
        row.extend_from_slice(&lenenc_str("")); // Binlog_Do_DB
        row.extend_from_slice(&lenenc_str("")); // Binlog_Ignore_DB
        row.extend_from_slice(&lenenc_str("")); // Executed_Gtid_Set

        vec![
            vec![0x05], // column count
            b"def-file".to_vec(),
            b"def-pos".to_vec(),
            b"def-do".to_vec(),
            b"def-ignore".to_vec(),
            b"def-gtid".to_vec(),
            eof_payload(),
            row,
            eof_payload(),
        ]
    }

    fn stop_event_bytes(next_pos: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        bytes.push(3); // STOP_EVENT
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&19u32.to_le_bytes());
        bytes.extend_from_slice(&next_pos.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes
    }

    fn expect_send(step: Step) -> (u8, Vec<u8>) {
        match step {
            Step::Send { sequence, payload } => (sequence, payload),
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn test_full_session_flow() {
        let mut session = ReplicationSession::new(test_config());
        assert_eq!(session.phase(), ReplicationPhase::AwaitingHandshake);

        // 핸드셰이크 → 인증 응답 전송
        session.feed(&encode_frame(0, &handshake_payload()));
        let (sequence, payload) = expect_send(session.poll().unwrap());
        assert_eq!(sequence, 1);
        assert!(payload.ends_with(b"mysql_native_password\0"));
        assert_eq!(session.phase(), ReplicationPhase::AwaitingAuthResult);

        // 인증 OK → 체크섬 문장 전송
        session.feed(&encode_frame(2, &ok_payload()));
        let (sequence, payload) = expect_send(session.poll().unwrap());
        assert_eq!(sequence, 0);
        assert_eq!(payload[0], COM_QUERY);
        assert!(payload.ends_with(b"'NONE'"));

        // 체크섬 OK → SHOW MASTER STATUS 전송
        session.feed(&encode_frame(1, &ok_payload()));
        let (_, payload) = expect_send(session.poll().unwrap());
        assert_eq!(payload[0], COM_QUERY);
        assert_eq!(&payload[1..], b"SHOW MASTER STATUS");
        assert_eq!(session.phase(), ReplicationPhase::AwaitingStatusResult);

        // 결과셋 수신 → 마지막 EOF에서 COM_BINLOG_DUMP 전송
        let packets = master_status_packets("mysql-bin.000012", "4096");
        let count = packets.len();
        for (i, packet) in packets.into_iter().enumerate() {
            session.feed(&encode_frame((i + 1) as u8, &packet));
            let step = session.poll().unwrap();
            if i + 1 < count {
                match step {
                    Step::Continue => {}
                    other => panic!("packet {} gave {:?}", i, other),
                }
            } else {
                let (_, payload) = expect_send(step);
                assert_eq!(payload[0], COM_BINLOG_DUMP);
                assert_eq!(&payload[1..5], &4096u32.to_le_bytes());
                assert_eq!(&payload[7..11], &2u32.to_le_bytes());
                assert_eq!(&payload[11..], b"mysql-bin.000012");
            }
        }

        assert_eq!(session.phase(), ReplicationPhase::Dumping);
        assert_eq!(
            session.position(),
            Some(&BinlogPosition::new("mysql-bin.000012", 4096))
        );

        // 덤프 스트림의 이벤트 패킷 (OK 바이트 + 이벤트)
        let mut dump_packet = vec![0x00];
        dump_packet.extend_from_slice(&stop_event_bytes(4242));
        session.feed(&encode_frame(1, &dump_packet));

        match session.poll().unwrap() {
            Step::Event(event) => {
                assert_eq!(event.header.event_type, EventType::Stop);
            }
            other => panic!("expected Event, got {:?}", other),
        }

        // 이벤트의 next_pos가 좌표에 반영됨 (파일명은 유지)
        assert_eq!(
            session.position(),
            Some(&BinlogPosition::new("mysql-bin.000012", 4242))
        );
    }

    #[test]
    fn test_master_status_extraction_ignores_extra_columns() {
        let packets = master_status_packets("mysql-bin.000012", "4096");
        let position = parse_master_status(&packets).unwrap();

        assert_eq!(position.filename, "mysql-bin.000012");
        assert_eq!(position.position, 4096);
    }

    #[test]
    fn test_master_status_empty_filename() {
        let packets = master_status_packets("", "4096");
        assert!(matches!(
            parse_master_status(&packets),
            Err(ReplicantError::MalformedResultSet(_))
        ));
    }

    #[test]
    fn test_master_status_non_numeric_position() {
        let packets = master_status_packets("mysql-bin.000012", "not-a-number");
        assert!(matches!(
            parse_master_status(&packets),
            Err(ReplicantError::MalformedResultSet(_))
        ));
    }

    #[test]
    fn test_master_status_no_data_row() {
        let mut packets = master_status_packets("mysql-bin.000012", "4096");
        packets.remove(7); // 데이터 행 제거
        assert!(matches!(
            parse_master_status(&packets),
            Err(ReplicantError::MalformedResultSet(_))
        ));
    }

    #[test]
    fn test_auth_rejected() {
        let mut session = ReplicationSession::new(test_config());

        session.feed(&encode_frame(0, &handshake_payload()));
        expect_send(session.poll().unwrap());

        let mut err_payload = vec![0xff];
        err_payload.extend_from_slice(&1045u16.to_le_bytes());
        err_payload.push(b'#');
        err_payload.extend_from_slice(b"28000");
        err_payload.extend_from_slice(b"Access denied");
        session.feed(&encode_frame(2, &err_payload));

        assert!(matches!(
            session.poll(),
            Err(ReplicantError::AuthenticationFailed(_))
        ));
        assert_eq!(session.phase(), ReplicationPhase::Closed);
    }

    #[test]
    fn test_auth_result_protocol_violation() {
        let mut session = ReplicationSession::new(test_config());

        session.feed(&encode_frame(0, &handshake_payload()));
        expect_send(session.poll().unwrap());

        // OK도 ERR도 아닌 상태 바이트
        session.feed(&encode_frame(2, &[0x01, 0x02, 0x03]));
        assert!(matches!(
            session.poll(),
            Err(ReplicantError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_poll_is_idempotent_on_partial_packet() {
        let mut session = ReplicationSession::new(test_config());
        let frame = encode_frame(0, &handshake_payload());

        // 헤더조차 완성되지 않은 상태: 아무것도 소비하지 않고 NeedMore
        session.feed(&frame[..3]);
        assert!(matches!(session.poll().unwrap(), Step::NeedMore));
        assert!(matches!(session.poll().unwrap(), Step::NeedMore));
        assert_eq!(session.phase(), ReplicationPhase::AwaitingHandshake);

        // 나머지 바이트가 도착하면 같은 호출이 그대로 성공
        session.feed(&frame[3..]);
        let (sequence, _) = expect_send(session.poll().unwrap());
        assert_eq!(sequence, 1);
    }

    #[test]
    fn test_dump_stream_eof_closes_session() {
        let mut session = ReplicationSession::new(test_config());
        session.feed(&encode_frame(0, &handshake_payload()));
        expect_send(session.poll().unwrap());
        session.feed(&encode_frame(2, &ok_payload()));
        expect_send(session.poll().unwrap());
        session.feed(&encode_frame(1, &ok_payload()));
        expect_send(session.poll().unwrap());

        for packet in master_status_packets("mysql-bin.000001", "4") {
            session.feed(&encode_frame(1, &packet));
            session.poll().unwrap();
        }
        assert_eq!(session.phase(), ReplicationPhase::Dumping);

        session.feed(&encode_frame(1, &eof_payload()));
        assert!(matches!(session.poll().unwrap(), Step::Closed));
        assert_eq!(session.phase(), ReplicationPhase::Closed);
    }

    #[test]
    fn test_rotate_event_replaces_position() {
        let mut session = ReplicationSession::new(test_config());
        session.feed(&encode_frame(0, &handshake_payload()));
        expect_send(session.poll().unwrap());
        session.feed(&encode_frame(2, &ok_payload()));
        expect_send(session.poll().unwrap());
        session.feed(&encode_frame(1, &ok_payload()));
        expect_send(session.poll().unwrap());
        for packet in master_status_packets("mysql-bin.000001", "120") {
            session.feed(&encode_frame(1, &packet));
            session.poll().unwrap();
        }

        // ROTATE 이벤트: 위치 4, 다음 파일 mysql-bin.000002
        let mut body = Vec::new();
        body.extend_from_slice(&4u64.to_le_bytes());
        body.extend_from_slice(b"mysql-bin.000002");

        let event_size = (binlog::EVENT_HEADER_SIZE + body.len()) as u32;
        let mut event = Vec::new();
        event.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        event.push(4); // ROTATE_EVENT
        event.extend_from_slice(&1u32.to_le_bytes());
        event.extend_from_slice(&event_size.to_le_bytes());
        event.extend_from_slice(&0u32.to_le_bytes());
        event.extend_from_slice(&0u16.to_le_bytes());
        event.extend_from_slice(&body);

        let mut dump_packet = vec![0x00];
        dump_packet.extend_from_slice(&event);
        session.feed(&encode_frame(1, &dump_packet));

        match session.poll().unwrap() {
            Step::Event(event) => assert_eq!(event.header.event_type, EventType::Rotate),
            other => panic!("expected Event, got {:?}", other),
        }
        assert_eq!(
            session.position(),
            Some(&BinlogPosition::new("mysql-bin.000002", 4))
        );
    }
}
