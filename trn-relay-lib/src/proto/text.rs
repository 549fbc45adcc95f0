#![forbid(unsafe_code)]

//! Plain-text control messages.
//!
//! Short ASCII tokens, optionally followed by whitespace-separated
//! `key[value]` pairs, NUL-terminated on the wire:
//! `CON`, `HBT`, `PNG mid[7] cid[12345]`, `ACK mid[7] cid[12345] pid[99]`.

pub const TOK_CON: &str = "CON";
pub const TOK_REQ: &str = "REQ";
pub const TOK_HBT: &str = "HBT";
pub const TOK_DIS: &str = "DIS";
pub const TOK_PING: &str = "PING";
pub const TOK_RST: &str = "RST";
pub const TOK_ACK: &str = "ACK";
pub const TOK_NACK: &str = "NACK";
pub const TOK_MSG: &str = "MSG";
pub const TOK_PNG: &str = "PNG";

/// Wire text up to the first NUL.
pub fn as_str(msg: &[u8]) -> &str {
    let end = msg.iter().position(|b| *b == 0).unwrap_or(msg.len());
    std::str::from_utf8(&msg[..end]).unwrap_or("")
}

/// Leading token of a control message.
pub fn token(msg: &[u8]) -> &str {
    as_str(msg).split_whitespace().next().unwrap_or("")
}

/// Extract the integer from a `key[value]` pair, e.g. `mid[ 42]`.
pub fn parse_kv(msg: &[u8], key: &str) -> Option<i64> {
    let text = as_str(msg);
    let start = text.find(&format!("{key}["))? + key.len() + 1;
    let rest = &text[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

/// Build a NUL-terminated control message: token plus `key[value]`
/// pairs.
pub fn message(token: &str, pairs: &[(&str, i64)]) -> Vec<u8> {
    let mut out = String::from(token);
    for (key, val) in pairs {
        out.push_str(&format!(" {key}[{val}]"));
    }
    let mut bytes = out.into_bytes();
    bytes.push(0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_parses_kv_messages() {
        let msg = message(TOK_PNG, &[("mid", 7), ("cid", 12345)]);
        assert_eq!(as_str(&msg), "PNG mid[7] cid[12345]");
        assert_eq!(msg.last(), Some(&0u8));
        assert_eq!(token(&msg), "PNG");
        assert_eq!(parse_kv(&msg, "mid"), Some(7));
        assert_eq!(parse_kv(&msg, "cid"), Some(12345));
        assert_eq!(parse_kv(&msg, "pid"), None);
    }

    #[test]
    fn parses_padded_values_and_bare_tokens() {
        assert_eq!(parse_kv(b"MSG mid[  7]\0", "mid"), Some(7));
        assert_eq!(token(b"HBT\0trailing-junk"), "HBT");
        assert_eq!(token(b""), "");
        assert_eq!(parse_kv(b"MSG mid[x]\0", "mid"), None);
    }
}
