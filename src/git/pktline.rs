//! Git packet-line framing.
//!
//! Each packet line is prefixed with a 4-character lowercase hex length that
//! includes itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)

use thiserror::Error;
use tracing::{trace, warn};

/// Largest payload a single data packet may carry.
pub const MAX_PKT_DATA: usize = 65516;

/// The flush packet.
pub const FLUSH_PKT: &[u8] = b"0000";

/// A single packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`).
    Flush,
    /// Delimiter packet (`0001`).
    Delimiter,
    /// Response-end packet (`0002`).
    ResponseEnd,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("packet-line payload of {0} bytes exceeds the {MAX_PKT_DATA} byte limit")]
pub struct PayloadTooLarge(pub usize);

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a byte slice as a data packet (4-hex-digit length prefix + data).
///
/// Callers are responsible for including any trailing newline in `data`.
pub fn encode_pkt_line(data: &[u8]) -> Result<Vec<u8>, PayloadTooLarge> {
    if data.len() > MAX_PKT_DATA {
        return Err(PayloadTooLarge(data.len()));
    }
    let total_len = data.len() + 4;
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

/// The preamble of a smart-HTTP ref advertisement:
/// `pkt-line("# service=<svc>\n")` followed by a flush packet.
pub fn service_announcement(service: &str) -> Result<Vec<u8>, PayloadTooLarge> {
    let mut out = encode_pkt_line(format!("# service={service}\n").as_bytes())?;
    out.extend_from_slice(FLUSH_PKT);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Lazily decode packet lines from raw bytes.
///
/// Iteration stops at the first malformed or truncated position, so callers
/// can read a command section and stop at its flush packet without touching
/// whatever binary payload follows.
pub fn pkt_lines(data: &[u8]) -> PktLines<'_> {
    PktLines { data, pos: 0 }
}

pub struct PktLines<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for PktLines<'_> {
    type Item = PktLine;

    fn next(&mut self) -> Option<PktLine> {
        let pos = self.pos;
        let prefix = self.data.get(pos..pos + 4)?;
        let Some(pkt_len) = parse_len(prefix) else {
            warn!(offset = pos, "invalid packet-line length prefix");
            self.pos = self.data.len();
            return None;
        };

        let (packet, consumed) = match pkt_len {
            0 => (PktLine::Flush, 4),
            1 => (PktLine::Delimiter, 4),
            2 => (PktLine::ResponseEnd, 4),
            3 => {
                warn!(offset = pos, "invalid packet-line length 0003");
                self.pos = self.data.len();
                return None;
            }
            n => {
                if pos + n > self.data.len() {
                    trace!(
                        offset = pos,
                        declared = n,
                        available = self.data.len() - pos,
                        "truncated packet-line"
                    );
                    self.pos = self.data.len();
                    return None;
                }
                (PktLine::Data(self.data[pos + 4..pos + n].to_vec()), n)
            }
        };
        self.pos += consumed;
        Some(packet)
    }
}

fn parse_len(prefix: &[u8]) -> Option<usize> {
    let hex = std::str::from_utf8(prefix).ok()?;
    u16::from_str_radix(hex, 16).ok().map(usize::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
