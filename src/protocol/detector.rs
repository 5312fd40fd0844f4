//! Protocol format detection for telling inline commands from RESP frames.

/// Detected protocol format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFormat {
    /// RESP format (starts with a type byte)
    Resp,
    /// Inline/telnet format (plain text)
    Inline,
}

/// Detect the protocol format from the first byte of the buffer.
///
/// RESP2 messages start with one of `+ - : $ *`; anything else
/// (typically a letter) is treated as an inline command.
pub fn detect_format(buffer: &[u8]) -> Option<ProtocolFormat> {
    match buffer.first()? {
        b'+' | b'-' | b':' | b'$' | b'*' => Some(ProtocolFormat::Resp),
        _ => Some(ProtocolFormat::Inline),
    }
}
