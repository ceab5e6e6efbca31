//! Utility functions shared by the broker clients and sessions
//!
//! Record batch checksum verification and timestamp formatting.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use tracing::debug;

/// Timestamp layout used in generated messages and log views
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Formats a local time the way producer messages embed it
pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Verify CRC32-C of a Kafka record batch
///
/// Kafka record batch format (v2):
/// - baseOffset: int64 (8 bytes) - offset 0
/// - batchLength: int32 (4 bytes) - offset 8
/// - partitionLeaderEpoch: int32 (4 bytes) - offset 12
/// - magic: int8 (1 byte) - offset 16
/// - crc: int32 (4 bytes) - offset 17
/// - attributes onwards: covered by CRC - offset 21
///
/// Returns Ok(batch_length) if CRC matches, Err with details if not
pub fn verify_record_batch_crc(data: &[u8]) -> Result<usize> {
    // Minimum size for a record batch header
    if data.len() < 21 {
        return Err(anyhow!("Record batch too short: {} bytes", data.len()));
    }

    // Read batch length (offset 8, 4 bytes, big-endian)
    let batch_length = i32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;

    // Total batch size = 8 (baseOffset) + 4 (batchLength) + batchLength
    let total_batch_size = 12 + batch_length;
    if data.len() < total_batch_size {
        return Err(anyhow!(
            "Incomplete record batch: expected {} bytes, got {}",
            total_batch_size,
            data.len()
        ));
    }

    // Read magic byte (offset 16)
    let magic = data[16];
    if magic != 2 {
        // Only verify CRC for magic version 2 (modern format)
        debug!("Skipping CRC check for magic version {}", magic);
        return Ok(total_batch_size);
    }

    // Read stored CRC (offset 17, 4 bytes, big-endian)
    let stored_crc = u32::from_be_bytes([data[17], data[18], data[19], data[20]]);

    // Compute CRC32-C over data from attributes (offset 21) to end of batch
    let crc_data = &data[21..total_batch_size];
    let computed_crc = crc32c::crc32c(crc_data);

    if stored_crc != computed_crc {
        return Err(anyhow!(
            "CRC mismatch: stored=0x{:08x}, computed=0x{:08x}",
            stored_crc,
            computed_crc
        ));
    }

    Ok(total_batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn batch_with_crc(payload: &[u8]) -> Vec<u8> {
        // baseOffset(8) + batchLength(4) + leaderEpoch(4) + magic(1) + crc(4) + payload
        let batch_length = (4 + 1 + 4 + payload.len()) as i32;
        let mut data = Vec::new();
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(&batch_length.to_be_bytes());
        data.extend_from_slice(&0i32.to_be_bytes());
        data.push(2);
        data.extend_from_slice(&crc32c::crc32c(payload).to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_verify_crc_accepts_valid_batch() {
        let data = batch_with_crc(b"attributes-and-records");
        assert_eq!(verify_record_batch_crc(&data).unwrap(), data.len());
    }

    #[test]
    fn test_verify_crc_detects_mismatch() {
        let mut data = batch_with_crc(b"attributes-and-records");
        let last = data.len() - 1;
        data[last] ^= 0x01;
        let err = verify_record_batch_crc(&data).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn test_verify_crc_rejects_short_input() {
        assert!(verify_record_batch_crc(&[0u8; 10]).is_err());
        let data = batch_with_crc(b"abc");
        assert!(verify_record_batch_crc(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn test_format_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(format_timestamp(at), "2024-03-09 14:05:07.000");
    }
}
