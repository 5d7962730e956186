//! Per-frame binary record.
//!
//! Layout: 4-byte magic `VTRF`, one version byte, then the bincode body.

use crate::error::{TrajectoryError, TrajectoryResult};
use crate::frame::TrajectoryFrame;

const MAGIC: &[u8; 4] = b"VTRF";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;

/// Encodes a frame into its binary record.
pub fn encode_frame(frame: &TrajectoryFrame) -> TrajectoryResult<Vec<u8>> {
    let body = bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| TrajectoryError::Codec(e.to_string()))?;

    let mut record = Vec::with_capacity(HEADER_LEN + body.len());
    record.extend_from_slice(MAGIC);
    record.push(VERSION);
    record.extend_from_slice(&body);
    Ok(record)
}

/// Decodes a binary record produced by [`encode_frame`].
pub fn decode_frame(bytes: &[u8]) -> TrajectoryResult<TrajectoryFrame> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(TrajectoryError::Codec("not a frame record".to_string()));
    }
    if bytes[MAGIC.len()] != VERSION {
        return Err(TrajectoryError::Codec(format!(
            "unsupported frame record version {}",
            bytes[MAGIC.len()]
        )));
    }

    let (frame, _) = bincode::serde::decode_from_slice::<TrajectoryFrame, _>(
        &bytes[HEADER_LEN..],
        bincode::config::standard(),
    )
    .map_err(|e| TrajectoryError::Codec(e.to_string()))?;

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> TrajectoryFrame {
        TrajectoryFrame {
            timestep: 7,
            atom_count: 1,
            box_bounds: [0.0, 1.0, 0.0, 1.0, 0.0, 1.0],
            tilt: Some([0.1, 0.0, 0.0]),
            periodic: [true, false, true],
            columns: vec!["id".into(), "x".into(), "y".into(), "z".into()],
            ids: vec![11],
            positions: vec![0.25, 0.5, 0.75],
            types: vec![1],
            min: [0.25, 0.5, 0.75],
            max: [0.25, 0.5, 0.75],
        }
    }

    #[test]
    fn test_record_carries_header() {
        let bytes = encode_frame(&frame()).unwrap();
        assert_eq!(&bytes[..4], b"VTRF");
        assert_eq!(bytes[4], 1);
        assert_eq!(decode_frame(&bytes).unwrap(), frame());
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        assert!(matches!(decode_frame(b"nope"), Err(TrajectoryError::Codec(_))));

        let mut bytes = encode_frame(&frame()).unwrap();
        bytes[4] = 9;
        let err = decode_frame(&bytes).unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn test_truncated_body() {
        let bytes = encode_frame(&frame()).unwrap();
        assert!(decode_frame(&bytes[..bytes.len() - 3]).is_err());
    }
}
