//! Git packet-line framing.
//!
//! Each packet line is a 4-hex-digit length (counting itself) followed by the
//! payload.  `0000` is a flush packet; `0001` and `0002` are the protocol v2
//! delimiter and response-end packets.

/// Longest payload a single data packet can carry.
pub const MAX_PKT_PAYLOAD: usize = 0xFFFF - 4;

/// The lone flush packet.
pub const FLUSH_PKT: &[u8] = b"0000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Data(Vec<u8>),
    Flush,
    Delimiter,
    ResponseEnd,
}

/// Frame `data` as one packet line, or `None` if it is too long.
pub fn encode_pkt_line(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() > MAX_PKT_PAYLOAD {
        return None;
    }
    let total_len = data.len() + 4;
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    Some(buf)
}

/// `# service=<service>\n` followed by a flush, as sent ahead of a smart
/// HTTP ref advertisement.
pub fn service_header(service: &str) -> Vec<u8> {
    let line = format!("# service={service}\n");
    // Service names are a fixed, short set.
    let mut buf = encode_pkt_line(line.as_bytes()).unwrap_or_default();
    buf.extend_from_slice(FLUSH_PKT);
    buf
}

/// Parse a buffer of packet lines.  Stops at the first malformed packet and
/// returns what was decoded up to there.
pub fn decode_pkt_lines(data: &[u8]) -> Vec<PktLine> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos + 4 <= data.len() {
        let Some(len) = std::str::from_utf8(&data[pos..pos + 4])
            .ok()
            .and_then(|hex| usize::from_str_radix(hex, 16).ok())
        else {
            break;
        };

        match len {
            0 => packets.push(PktLine::Flush),
            1 => packets.push(PktLine::Delimiter),
            2 => packets.push(PktLine::ResponseEnd),
            3 => break,
            n if pos + n > data.len() => break,
            n => {
                packets.push(PktLine::Data(data[pos + 4..pos + n].to_vec()));
                pos += n;
                continue;
            }
        }
        pos += 4;
    }

    packets
}
