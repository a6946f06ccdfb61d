//! Content type detection for the first segment of a stream.

/// MPEG transport stream sync byte.
const TS_SYNC_BYTE: u8 = 0x47;
const TS_PACKET_SIZE: usize = 188;

/// Guess the MIME type of buffered stream data.
pub fn content_type(data: &[u8]) -> &'static str {
    if is_transport_stream(data) {
        "video/mp2t"
    } else if data.len() >= 8 && &data[4..8] == b"ftyp" {
        "video/mp4"
    } else if data.starts_with(b"FLV") {
        "video/x-flv"
    } else if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        "video/x-matroska"
    } else if data.starts_with(b"#EXTM3U") {
        "application/vnd.apple.mpegurl"
    } else if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xF1]) || data.starts_with(&[0xFF, 0xF9]) {
        "audio/aac"
    } else {
        "application/octet-stream"
    }
}

fn is_transport_stream(data: &[u8]) -> bool {
    if data.first() != Some(&TS_SYNC_BYTE) {
        return false;
    }
    // Require a second sync byte when there is enough data to check.
    match data.get(TS_PACKET_SIZE) {
        Some(b) => *b == TS_SYNC_BYTE,
        None => true,
    }
}
