//! 로컬 binlog 파일 디코드
//!
//! 네트워크 상태 머신을 거치지 않고, 매직 헤더 + 연속된 이벤트 레코드로
//! 이루어진 binlog 파일을 직접 읽어 이벤트 디코더에 넘깁니다.

use crate::binlog::{self, EVENT_HEADER_SIZE};
use crate::error::{ReplicantError, Result};
use crate::events::BinlogEvent;
use std::fmt::Write as _;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

/// 파일 스캔 결과 요약
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// 디코드되어 sink로 전달된 이벤트 수
    pub events: u64,
    /// 본문 디코드에 실패했지만 경계는 유지되어 건너뛴 이벤트 수
    pub undecodable: u64,
    /// 파일이 이벤트 경계 중간에서 끝났는지 여부
    pub truncated: bool,
}

/// Binlog 파일을 순서대로 디코드해서 sink로 전달
///
/// 개별 이벤트의 디코드 실패는 hex 덤프와 함께 보고만 하고 스캔을
/// 계속합니다. 파일 자체의 크기 계산이 깨진 경우에만 중단합니다.
/// 헤더 경계에서 19바이트가 안 남는 것은 예상되는 스트림 끝 조건이며
/// 에러가 아닙니다.
pub async fn replay_binlog_file<P, F>(path: P, mut sink: F) -> Result<ReplaySummary>
where
    P: AsRef<Path>,
    F: FnMut(BinlogEvent),
{
    let path = path.as_ref();
    let mut file = File::open(path).await.map_err(|e| {
        ReplicantError::IoError(format!("opening '{}' failed: {}", path.display(), e))
    })?;

    // 매직 헤더 (4 bytes)
    let mut magic = [0u8; 4];
    let read = read_up_to(&mut file, &mut magic).await?;
    if read < magic.len() {
        return Err(ReplicantError::NotABinlogFile(format!(
            "'{}': file shorter than magic header",
            path.display()
        )));
    }
    binlog::verify_magic(&magic)?;

    let mut summary = ReplaySummary::default();

    loop {
        // 고정 19바이트 이벤트 헤더
        let mut header_buf = [0u8; EVENT_HEADER_SIZE];
        let read = read_up_to(&mut file, &mut header_buf).await?;
        if read == 0 {
            break;
        }
        if read < EVENT_HEADER_SIZE {
            let end = ReplicantError::TruncatedFile(format!(
                "'{}': {} trailing bytes do not form an event header",
                path.display(),
                read
            ));
            warn!("{}", end);
            summary.truncated = true;
            break;
        }

        let header = binlog::parse_event_header(&header_buf)?;
        let event_size = header.event_size as usize;
        if event_size < EVENT_HEADER_SIZE {
            // 파일 자체의 크기 계산을 믿을 수 없으므로 여기서 중단
            return Err(ReplicantError::MalformedEvent(format!(
                "'{}': declared event size {} below header size",
                path.display(),
                event_size
            )));
        }

        // 헤더 뒤에 event_size - 19 바이트의 본문
        let mut event_buf = header_buf.to_vec();
        event_buf.resize(event_size, 0);
        let body_read = read_up_to(&mut file, &mut event_buf[EVENT_HEADER_SIZE..]).await?;
        if body_read < event_size - EVENT_HEADER_SIZE {
            let end = ReplicantError::TruncatedFile(format!(
                "'{}': event body truncated ({} of {} bytes)",
                path.display(),
                body_read,
                event_size - EVENT_HEADER_SIZE
            ));
            warn!("{}", end);
            summary.truncated = true;
            break;
        }

        match binlog::parse_event(&event_buf) {
            Ok(event) => {
                summary.events += 1;
                sink(event);
            }
            Err(e) => {
                summary.undecodable += 1;
                error!(
                    "'{}': undecodable {:?} event: {}",
                    path.display(),
                    header.event_type,
                    e
                );
                error!("offending bytes:\n{}", hex_dump(&event_buf[EVENT_HEADER_SIZE..]));
            }
        }
    }

    info!(
        "'{}': {} events decoded, {} skipped, truncated: {}",
        path.display(),
        summary.events,
        summary.undecodable,
        summary.truncated
    );

    Ok(summary)
}

/// 버퍼가 차거나 EOF에 도달할 때까지 읽기
async fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| ReplicantError::IoError(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 진단용 hex 덤프 (한 줄에 16바이트, 오른쪽에 ASCII)
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();

    for chunk in bytes.chunks(16) {
        for byte in chunk {
            let _ = write!(out, "{:02x} ", byte);
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push(' ');
        for &byte in chunk {
            out.push(if (0x20..0x7f).contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::BINLOG_MAGIC;
    use crate::events::EventType;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("replicant-test-{}-{}", std::process::id(), name))
    }

    fn stop_event_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        bytes.push(3); // STOP_EVENT
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&19u32.to_le_bytes());
        bytes.extend_from_slice(&23u32.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes
    }

    #[tokio::test]
    async fn test_replay_event_then_truncated_header() {
        // 매직 + 완전한 이벤트 하나 + 잘린 두 번째 헤더 (3 bytes)
        let mut contents = BINLOG_MAGIC.to_vec();
        contents.extend_from_slice(&stop_event_bytes());
        contents.extend_from_slice(&[0x01, 0x02, 0x03]);

        let path = temp_path("truncated-tail.bin");
        std::fs::write(&path, &contents).unwrap();

        let mut seen = Vec::new();
        let summary = replay_binlog_file(&path, |event| seen.push(event))
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(summary.events, 1);
        assert_eq!(summary.undecodable, 0);
        assert!(summary.truncated);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].header.event_type, EventType::Stop);
    }

    #[tokio::test]
    async fn test_replay_clean_end() {
        let mut contents = BINLOG_MAGIC.to_vec();
        contents.extend_from_slice(&stop_event_bytes());
        contents.extend_from_slice(&stop_event_bytes());

        let path = temp_path("clean-end.bin");
        std::fs::write(&path, &contents).unwrap();

        let summary = replay_binlog_file(&path, |_| {}).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(summary.events, 2);
        assert!(!summary.truncated);
    }

    #[tokio::test]
    async fn test_replay_rejects_bad_magic() {
        let path = temp_path("bad-magic.bin");
        std::fs::write(&path, [0x00, 0x01, 0x02, 0x03, 0x04]).unwrap();

        let result = replay_binlog_file(&path, |_| {}).await;
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ReplicantError::NotABinlogFile(_))));
    }

    #[tokio::test]
    async fn test_replay_skips_undecodable_event() {
        // QUERY 이벤트인데 본문이 고정 필드조차 담지 못할 만큼 짧음.
        // 경계는 event_size로 알 수 있으므로 다음 이벤트는 정상 디코드.
        let mut bad_event = Vec::new();
        bad_event.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        bad_event.push(2); // QUERY_EVENT
        bad_event.extend_from_slice(&1u32.to_le_bytes());
        bad_event.extend_from_slice(&22u32.to_le_bytes()); // 19 + 3
        bad_event.extend_from_slice(&0u32.to_le_bytes());
        bad_event.extend_from_slice(&0u16.to_le_bytes());
        bad_event.extend_from_slice(&[0xde, 0xad, 0xbe]);

        let mut contents = BINLOG_MAGIC.to_vec();
        contents.extend_from_slice(&bad_event);
        contents.extend_from_slice(&stop_event_bytes());

        let path = temp_path("undecodable.bin");
        std::fs::write(&path, &contents).unwrap();

        let mut seen = Vec::new();
        let summary = replay_binlog_file(&path, |event| seen.push(event))
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(summary.undecodable, 1);
        assert_eq!(summary.events, 1);
        assert_eq!(seen[0].header.event_type, EventType::Stop);
    }

    #[test]
    fn test_hex_dump_format() {
        let dump = hex_dump(&[0x41, 0x42, 0x00]);
        assert!(dump.starts_with("41 42 00 "));
        assert!(dump.ends_with(" AB.\n"));
    }
}
