//! CTCP framing and DCC negotiation.
//!
//! IRC embeds control messages inside chat lines between 0x01 delimiter
//! bytes, and one line may carry several framed sub-messages. This module
//! owns both wire directions: splitting a raw line into sub-messages and
//! classifying them (`DCC SEND` offer, other DCC traffic, generic CTCP), and
//! formatting the `DCC CHAT` invitations and `DCC SEND` advertisements the
//! send path emits. Addresses travel as decimal u32 strings in network byte
//! order per the DCC convention.

use crate::error::DccError;
use std::net::{IpAddr, Ipv4Addr};

/// Delimiter byte that opens and closes a CTCP frame.
pub const CTCP_DELIMITER: u8 = 0x01;

/// A parsed `DCC SEND` offer with decoded fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOffer {
    pub filename: String,
    pub address: IpAddr,
    pub port: u16,
    pub size: u64,
}

/// Classification of one CTCP sub-message.
#[derive(Debug, PartialEq)]
pub enum Classified {
    /// A well-formed `DCC SEND` offer.
    FileOffer(FileOffer),
    /// DCC traffic other than a well-formed SEND offer; the body is the text
    /// after the `DCC ` prefix.
    Dcc(String),
    /// Any other CTCP message, unmodified.
    Ctcp(String),
}

/// An outbound CTCP payload addressed to a nick, handed to the IRC
/// connection for delivery. The payload carries no delimiter bytes; the IRC
/// layer frames it.
#[derive(Debug, Clone, PartialEq)]
pub struct CtcpRequest {
    pub nick: String,
    pub payload: String,
}

/// Split a raw message into CTCP sub-messages.
///
/// The scanner is a two-state machine, outside/inside a frame, toggling on
/// each delimiter byte. Only spans that were both opened and closed by a
/// delimiter count as sub-messages; leading text, text between frames, and
/// an unterminated tail are framing and are discarded. Empty frames and
/// fragments that are not valid UTF-8 are dropped silently, mirroring
/// tolerant CTCP parsing.
pub fn split_frames(raw: &[u8]) -> Vec<&str> {
    let mut frames = Vec::new();
    let mut inside_since: Option<usize> = None;
    for (i, &byte) in raw.iter().enumerate() {
        if byte != CTCP_DELIMITER {
            continue;
        }
        match inside_since.take() {
            // Opening delimiter: the frame starts after it.
            None => inside_since = Some(i + 1),
            Some(start) => {
                if let Ok(text) = std::str::from_utf8(&raw[start..i]) {
                    if !text.is_empty() {
                        frames.push(text);
                    }
                }
            }
        }
    }
    frames
}

/// Classify one decoded sub-message.
///
/// `DCC SEND` offers are parsed fully; an offer advertising port 0 is
/// passive DCC and is rejected here, before any socket exists. Malformed
/// SEND payloads degrade to the plain DCC classification instead of
/// erroring.
pub fn classify(frame: &str) -> Result<Classified, DccError> {
    if frame.starts_with("DCC SEND ") {
        if let Some(offer) = parse_send_offer(&frame["DCC SEND ".len()..]) {
            if offer.port == 0 {
                return Err(DccError::UnsupportedPassiveTransfer {
                    filename: offer.filename,
                });
            }
            return Ok(Classified::FileOffer(offer));
        }
    }
    if let Some(body) = frame.strip_prefix("DCC ") {
        return Ok(Classified::Dcc(body.to_string()));
    }
    Ok(Classified::Ctcp(frame.to_string()))
}

/// Parse the argument list of a `DCC SEND`: everything up to the last three
/// whitespace tokens is the filename (spaces survive unquoted), and the
/// trailing three tokens are the packed address, the port, and the size.
fn parse_send_offer(rest: &str) -> Option<FileOffer> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }
    let (name_tokens, tail) = tokens.split_at(tokens.len() - 3);

    let filename = strip_quotes(&name_tokens.join(" "));
    if filename.is_empty() {
        return None;
    }

    let packed: u32 = tail[0].parse().ok()?;
    let port: u16 = tail[1].parse().ok()?;
    let size: u64 = tail[2].parse().ok()?;

    Some(FileOffer {
        filename,
        address: IpAddr::V4(decode_ipv4(packed)),
        port,
        size,
    })
}

fn strip_quotes(name: &str) -> String {
    name.strip_prefix('"')
        .and_then(|n| n.strip_suffix('"'))
        .unwrap_or(name)
        .to_string()
}

/// Decode the DCC wire form of an IPv4 address (decimal u32, network byte
/// order) into dotted form.
pub fn decode_ipv4(packed: u32) -> Ipv4Addr {
    Ipv4Addr::from(packed)
}

/// Encode an IPv4 address into the DCC wire form.
pub fn encode_ipv4(address: Ipv4Addr) -> u32 {
    u32::from(address)
}

/// Payload of a `DCC CHAT` invitation advertising our chat listener.
pub fn chat_invitation(address: Ipv4Addr, port: u16) -> String {
    format!("DCC CHAT chat {} {}", encode_ipv4(address), port)
}

/// Payload of a `DCC SEND` advertisement for a data listener. Names with
/// spaces are quoted for clients that expect it; our own parser accepts
/// either form because the trailing three tokens are fixed.
pub fn send_advertisement(filename: &str, address: Ipv4Addr, port: u16, size: u64) -> String {
    if filename.contains(' ') {
        format!(
            "DCC SEND \"{}\" {} {} {}",
            filename,
            encode_ipv4(address),
            port,
            size
        )
    } else {
        format!(
            "DCC SEND {} {} {} {}",
            filename,
            encode_ipv4(address),
            port,
            size
        )
    }
}

/// Wrap a CTCP payload in delimiter bytes for transmission inside a chat
/// line we write ourselves (the control connection of a send session).
pub fn frame(payload: &str) -> String {
    format!("\x01{}\x01", payload)
}
