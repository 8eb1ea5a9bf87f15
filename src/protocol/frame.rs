//! Frame codec: `Length(u32 BE) || Obs(u8) || Body[Length]`, where
//! `Body[i] = PlainBody[i] XOR Obs`. `Obs` is a fresh random byte per
//! outgoing frame; it is a static-pattern breaker, not encryption.

use tokio::io::{AsyncRead, AsyncReadExt};

/// 32 MiB. Frames larger than this are rejected before any allocation.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(u32),
    #[error("short read while decoding frame: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes `plain` as a complete frame ready to write to the wire.
pub fn encode_frame(plain: &[u8]) -> Vec<u8> {
    let obs: u8 = rand::random();
    encode_frame_with_obs(plain, obs)
}

fn encode_frame_with_obs(plain: &[u8], obs: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + plain.len());
    out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
    out.push(obs);
    out.extend(plain.iter().map(|b| b ^ obs));
    out
}

/// Reads and decodes one frame from `reader`, returning the recovered plain body.
pub async fn decode_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut obs_buf = [0u8; 1];
    reader.read_exact(&mut obs_buf).await?;
    let obs = obs_buf[0];

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    for b in body.iter_mut() {
        *b ^= obs;
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encoding_matches_exact_bytes() {
        let wire = encode_frame_with_obs(b"hello", 0xAA);
        assert_eq!(
            wire,
            vec![0x00, 0x00, 0x00, 0x05, 0xAA, 0xC2, 0xCF, 0xC6, 0xC6, 0xC5]
        );
    }

    #[tokio::test]
    async fn decode_recovers_plain_body() {
        let wire = encode_frame_with_obs(b"hello", 0xAA);
        let mut cursor = std::io::Cursor::new(wire);
        let plain = decode_frame(&mut cursor).await.unwrap();
        assert_eq!(plain, b"hello");
    }

    #[tokio::test]
    async fn encode_decode_round_trip_for_arbitrary_bodies() {
        for body in [&b""[..], b"x", b"a longer payload with various bytes \x00\xff\x7f"] {
            let wire = encode_frame(body);
            let mut cursor = std::io::Cursor::new(wire);
            let decoded = decode_frame(&mut cursor).await.unwrap();
            assert_eq!(decoded, body);
        }
    }

    #[tokio::test]
    async fn oversize_length_is_rejected_before_allocating() {
        let mut fake_header = Vec::new();
        fake_header.extend_from_slice(&0x04_00_00_01u32.to_be_bytes());
        // No further bytes are supplied; a correct implementation must
        // reject based on the length field alone, before trying to read
        // the (nonexistent) obs byte or body.
        let mut cursor = std::io::Cursor::new(fake_header);
        let err = decode_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(0x04_00_00_01)));
    }

    #[test]
    fn xor_round_trips_for_every_obs_byte() {
        let plain = b"the quick brown fox";
        for obs in 0u8..=255 {
            let wire = encode_frame_with_obs(plain, obs);
            let body = &wire[5..];
            let recovered: Vec<u8> = body.iter().map(|b| b ^ obs).collect();
            assert_eq!(recovered, plain);
        }
    }
}
