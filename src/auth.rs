//! MySQL 인증 처리
//!
//! Native password authentication 구현

use crate::error::Result;
use crate::protocol::AuthChallenge;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const NO_SCHEMA: u32 = 16;
    pub const COMPRESS: u32 = 32;
    pub const ODBC: u32 = 64;
    pub const LOCAL_FILES: u32 = 128;
    pub const IGNORE_SPACE: u32 = 256;
    pub const PROTOCOL_41: u32 = 512;
    pub const INTERACTIVE: u32 = 1024;
    pub const SSL: u32 = 2048;
    pub const IGNORE_SIGPIPE: u32 = 4096;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    pub const CONNECT_ATTRS: u32 = 1 << 20;
}

/// 이 클라이언트가 원하는 capability 집합
fn desired_capabilities() -> u32 {
    capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH
}

/// Native password 인증 응답 (20 bytes) 생성
///
/// SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password)))
/// 빈 비밀번호는 빈 응답 필드가 되며, 그 역시 유효한 응답입니다.
pub fn scramble_password(password: &str, challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(challenge + SHA1(SHA1(password)))
    let mut combined = challenge.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    // XOR(SHA1(password), SHA1(challenge + SHA1(SHA1(password))))
    let mut response = Vec::with_capacity(20);
    for i in 0..20 {
        response.push(stage1[i] ^ stage3[i]);
    }

    response
}

/// SHA1 해시 계산 (MySQL native password의 표준 해시)
fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// 핸드셰이크 응답 패킷 페이로드 생성
///
/// capability는 클라이언트가 원하는 집합과 서버가 제공한 집합의 교집합.
/// charset은 챌린지의 값을 그대로 따릅니다.
pub fn create_handshake_response(
    challenge: &AuthChallenge,
    username: &str,
    password: &str,
    database: Option<&str>,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let mut caps = desired_capabilities() & challenge.capabilities;
    if database.is_some() {
        caps |= capabilities::CONNECT_WITH_DB;
    }

    // Client capability flags (4 bytes)
    buffer.write_u32::<LittleEndian>(caps)?;

    // Max packet size (4 bytes) - 0 means default (16MB)
    buffer.write_u32::<LittleEndian>(0)?;

    // Character set (1 byte)
    buffer.write_u8(challenge.charset)?;

    // Reserved (23 bytes of zeros)
    Write::write_all(&mut buffer, &[0u8; 23])?;

    // Username (null-terminated string)
    Write::write_all(&mut buffer, username.as_bytes())?;
    buffer.write_u8(0)?;

    // Authentication response (length-prefixed)
    let auth_response = scramble_password(password, &challenge.challenge);
    buffer.write_u8(auth_response.len() as u8)?;
    Write::write_all(&mut buffer, &auth_response)?;

    // Database name (null-terminated string, if provided)
    if let Some(db) = database {
        Write::write_all(&mut buffer, db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    // Authentication plugin name (null-terminated)
    Write::write_all(&mut buffer, b"mysql_native_password")?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge_with(nonce: &[u8], capabilities: u32) -> AuthChallenge {
        AuthChallenge {
            protocol_version: 10,
            server_version: "8.0.32".to_string(),
            connection_id: 1,
            challenge: nonce.to_vec(),
            capabilities,
            charset: 33,
            status: 2,
        }
    }

    #[test]
    fn test_scramble_empty_password() {
        let response = scramble_password("", &[1, 2, 3, 4]);
        assert!(response.is_empty());
    }

    #[test]
    fn test_scramble_deterministic() {
        let nonce: Vec<u8> = (1..=20).collect();
        let first = scramble_password("secret", &nonce);
        let second = scramble_password("secret", &nonce);

        assert_eq!(first.len(), 20); // SHA1 digest size
        assert_eq!(first, second);
    }

    #[test]
    fn test_scramble_depends_on_nonce() {
        let nonce_a: Vec<u8> = (1..=20).collect();
        let nonce_b: Vec<u8> = (21..=40).collect();

        assert_ne!(
            scramble_password("secret", &nonce_a),
            scramble_password("secret", &nonce_b)
        );
    }

    #[test]
    fn test_handshake_response_capability_intersection() {
        // 서버가 PROTOCOL_41 | SECURE_CONNECTION만 제공하는 경우
        let offered = capabilities::PROTOCOL_41 | capabilities::SECURE_CONNECTION;
        let challenge = challenge_with(&(1u8..=20).collect::<Vec<u8>>(), offered);

        let packet = create_handshake_response(&challenge, "repl", "secret", None).unwrap();
        let caps = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);

        assert_eq!(caps, offered);
    }

    #[test]
    fn test_handshake_response_layout() {
        let challenge = challenge_with(&(1u8..=20).collect::<Vec<u8>>(), u32::MAX);
        let packet = create_handshake_response(&challenge, "repl", "secret", Some("db")).unwrap();

        // capabilities(4) + max packet(4) + charset(1) + reserved(23)
        assert_eq!(packet[8], 33);
        assert_eq!(&packet[9..32], &[0u8; 23]);
        assert_eq!(&packet[32..37], b"repl\0");
        assert_eq!(packet[37], 20); // auth response length
        assert_eq!(&packet[58..61], b"db\0");
        assert!(packet.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn test_handshake_response_empty_password() {
        let challenge = challenge_with(&(1u8..=20).collect::<Vec<u8>>(), u32::MAX);
        let packet = create_handshake_response(&challenge, "repl", "", None).unwrap();

        // auth response length 바이트가 0이고 응답 필드가 비어 있음
        assert_eq!(packet[37], 0);
        assert_eq!(&packet[38..59], b"mysql_native_password");
    }
}
