//! Parsed RFC 822 message.
//!
//! [`Message`] keeps the header fields in the order they were received
//! (duplicates included) and exposes the body through a line cursor. A
//! message built from an in-memory buffer can rewind that cursor to the
//! first body byte; a message read from a live stream cannot, and
//! [`Message::rewind_body`] is then a no-op.

use mail_parser::{Addr, HeaderValue, MessageParser};
use std::io::{self, BufRead, Cursor, Read};

/// Header fields consulted when looking for the recipients of a message.
pub const RECIPIENT_FIELDS: [&str; 6] =
    ["to", "cc", "bcc", "resent-to", "resent-cc", "resent-bcc"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A `(display name, address)` pair as found in an address header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub addr: String,
}

impl Address {
    pub fn new(name: &str, addr: &str) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
        }
    }

    fn from_addr(addr: &Addr) -> Self {
        Self::new(
            addr.name.as_deref().unwrap_or_default(),
            addr.address.as_deref().unwrap_or_default(),
        )
    }

    /// Everything after the last `@`, or the whole address when there is none.
    pub fn domain(&self) -> &str {
        self.addr.rsplit('@').next().unwrap_or_default()
    }
}

enum Body {
    Buffered { cursor: Cursor<Vec<u8>>, start: u64 },
    Stream(Box<dyn BufRead>),
}

pub struct Message {
    headers: Vec<Header>,
    body: Body,
}

/// What the header parser did with a line.
enum Feed {
    Header,
    /// Blank separator line, consumed.
    End,
    /// First body line, not consumed.
    Body,
}

#[derive(Default)]
struct HeaderParser {
    headers: Vec<Header>,
    seen_line: bool,
}

impl HeaderParser {
    fn feed(&mut self, raw: &[u8]) -> Feed {
        let line = String::from_utf8_lossy(raw);
        let first = !self.seen_line;
        self.seen_line = true;

        // mbox envelope line
        if first && line.starts_with("From ") {
            return Feed::Header;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Feed::End;
        }

        if line.starts_with([' ', '\t']) {
            return match self.headers.last_mut() {
                Some(last) => {
                    last.value.push_str(line);
                    Feed::Header
                }
                None => Feed::Body,
            };
        }

        match line.split_once(':') {
            Some((name, value)) if is_field_name(name) => {
                self.headers.push(Header {
                    name: name.to_string(),
                    value: value.trim_start().to_string(),
                });
                Feed::Header
            }
            _ => Feed::Body,
        }
    }
}

/// RFC 5322 field names are printable ASCII without spaces or colons.
pub fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

impl Message {
    /// Parses a message held in memory. The body cursor is rewindable.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let mut parser = HeaderParser::default();
        let mut offset = 0;

        while offset < data.len() {
            let end = data[offset..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(data.len(), |pos| offset + pos + 1);
            match parser.feed(&data[offset..end]) {
                Feed::Header => offset = end,
                Feed::End => {
                    offset = end;
                    break;
                }
                Feed::Body => break,
            }
        }

        let start = offset as u64;
        let mut cursor = Cursor::new(data);
        cursor.set_position(start);
        Self {
            headers: parser.headers,
            body: Body::Buffered { cursor, start },
        }
    }

    /// Parses the header block of a live stream. The body is left unread
    /// in the stream and can only be consumed once.
    pub fn from_reader<R: BufRead + 'static>(mut reader: R) -> io::Result<Self> {
        let mut parser = HeaderParser::default();
        let mut line = Vec::new();
        let mut pending = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            match parser.feed(&line) {
                Feed::Header => {}
                Feed::End => break,
                Feed::Body => {
                    pending = std::mem::take(&mut line);
                    break;
                }
            }
        }

        let body: Box<dyn BufRead> = if pending.is_empty() {
            Box::new(reader)
        } else {
            Box::new(Cursor::new(pending).chain(reader))
        };
        Ok(Self {
            headers: parser.headers,
            body: Body::Stream(body),
        })
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// The header block as `Name: value\n` lines, in received order.
    pub fn header_block(&self) -> String {
        let mut block = String::new();
        for header in &self.headers {
            block.push_str(&header.name);
            block.push_str(": ");
            block.push_str(&header.value);
            block.push('\n');
        }
        block
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn header_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.header(name).unwrap_or(default)
    }

    /// Returns every value of `name`, in received order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// First address of the first `field` header, `None` if the header is
    /// absent. A header holding no parsable address gives an empty one.
    pub fn addr(&self, field: &str) -> Option<Address> {
        self.header(field).map(|value| {
            parse_address_field(field, value)
                .into_iter()
                .next()
                .unwrap_or_default()
        })
    }

    /// Every address found across all occurrences of the given fields.
    pub fn addr_list(&self, fields: &[&str]) -> Vec<Address> {
        fields
            .iter()
            .copied()
            .flat_map(|field| {
                self.header_values(field)
                    .flat_map(move |value| parse_address_field(field, value))
            })
            .collect()
    }

    /// Reads the next body line (including its terminator) into `buf`.
    /// Returns 0 at the end of the body.
    pub fn read_body_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match &mut self.body {
            Body::Buffered { cursor, .. } => cursor.read_until(b'\n', buf),
            Body::Stream(reader) => reader.read_until(b'\n', buf),
        }
    }

    /// Reads the remaining body lines from the current cursor position.
    pub fn body_lines(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        loop {
            let mut line = Vec::new();
            if self.read_body_line(&mut line)? == 0 {
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    /// Moves the body cursor back to the first byte after the header block.
    /// Streams cannot be repositioned, so this does nothing for them.
    pub fn rewind_body(&mut self) {
        match &mut self.body {
            Body::Buffered { cursor, start } => cursor.set_position(*start),
            Body::Stream(_) => log::trace!("body is a stream, not rewinding"),
        }
    }
}

/// Parses every address in one header field, in order. Members of a
/// group are listed in place of the group.
pub fn parse_address_field(name: &str, value: &str) -> Vec<Address> {
    let raw = format!("{name}: {value}\n\n");
    let Some(parsed) = MessageParser::new().parse_headers(raw.as_bytes()) else {
        return Vec::new();
    };

    let mut addresses = Vec::new();
    for header in parsed.headers() {
        match &header.value {
            HeaderValue::Address(mail_parser::Address::List(list)) => {
                addresses.extend(list.iter().map(Address::from_addr));
            }
            HeaderValue::Address(mail_parser::Address::Group(groups)) => {
                addresses.extend(
                    groups
                        .iter()
                        .flat_map(|group| group.addresses.iter())
                        .map(Address::from_addr),
                );
            }
            _ => {}
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "From: \"Amitai Schleier\" <schmonz@schmonz.com>\n\
Cc: archive@schmonz.com (Archive Schmonz)\n\
To: qmail@list.cr.yp.to\n\
Subject: announce: queue-repair-symlink3 patch\n\
X-Mailer: MailMate (1.11.3r5509)\n\
MIME-Version: 1.0\n\
\n\
This patch fixes things\n\
(http://example.org/patch)\n\
\n\
Thanks.\n";

    #[test]
    fn test_headers_preserve_order() {
        let message = Message::from_bytes(SAMPLE);
        let names: Vec<&str> = message.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["From", "Cc", "To", "Subject", "X-Mailer", "MIME-Version"]
        );
        assert!(message
            .header_block()
            .starts_with("From: \"Amitai Schleier\" <schmonz@schmonz.com>\nCc: "));
        assert!(message.header_block().ends_with("MIME-Version: 1.0\n"));
    }

    #[test]
    fn test_body_cursor_starts_after_separator() {
        let mut message = Message::from_bytes(SAMPLE);
        let mut line = Vec::new();
        message.read_body_line(&mut line).unwrap();
        assert!(line.starts_with(b"This patch "));
        line.clear();
        message.read_body_line(&mut line).unwrap();
        assert!(line.starts_with(b"(http://"));
        line.clear();
        message.read_body_line(&mut line).unwrap();
        assert_eq!(line, b"\n");
    }

    #[test]
    fn test_rewind_body_on_buffer_rewinds() {
        let mut message = Message::from_bytes(SAMPLE);
        message.body_lines().unwrap();
        message.rewind_body();

        let mut line = Vec::new();
        message.read_body_line(&mut line).unwrap();
        assert!(line.starts_with(b"This patch "));
    }

    #[test]
    fn test_rewind_body_on_stream_does_not_rewind() {
        let reader = io::BufReader::new(Cursor::new(SAMPLE.as_bytes().to_vec()));
        let mut message = Message::from_reader(reader).unwrap();

        let mut line = Vec::new();
        for _ in 0..3 {
            message.read_body_line(&mut line).unwrap();
        }
        message.rewind_body();
        line.clear();
        message.read_body_line(&mut line).unwrap();
        assert!(!line.starts_with(b"This patch "));
        assert_eq!(line, b"Thanks.\n");
    }

    #[test]
    fn test_stream_keeps_first_body_line_without_separator() {
        let reader = Cursor::new(b"Subject: x\nnot a header line\nmore\n".to_vec());
        let mut message = Message::from_reader(reader).unwrap();
        assert_eq!(message.header("subject"), Some("x"));
        let lines = message.body_lines().unwrap();
        assert_eq!(lines, vec![b"not a header line\n".to_vec(), b"more\n".to_vec()]);
    }

    #[test]
    fn test_addr_on_missing_header_gives_none() {
        let message = Message::from_bytes(SAMPLE);
        assert_eq!(message.addr("blorf"), None);
    }

    #[test]
    fn test_addr_on_non_address_header_is_empty() {
        let message = Message::from_bytes(SAMPLE);
        assert_eq!(message.addr("x-mailer"), Some(Address::default()));
        assert_eq!(message.addr("subject"), Some(Address::default()));
    }

    #[test]
    fn test_addr_on_address_headers() {
        let message = Message::from_bytes(SAMPLE);
        assert_eq!(
            message.addr("from"),
            Some(Address::new("Amitai Schleier", "schmonz@schmonz.com"))
        );
        assert_eq!(message.addr("cc").unwrap().addr, "archive@schmonz.com");
    }

    #[test]
    fn test_addr_takes_first_of_several() {
        let message = Message::from_bytes(
            "From: \"The qsecretary program\" <bounce@trusted.example>, other@example.net\n\n",
        );
        assert_eq!(
            message.addr("from"),
            Some(Address::new("The qsecretary program", "bounce@trusted.example"))
        );
        assert_eq!(message.addr_list(&["from"]).len(), 2);
    }

    #[test]
    fn test_quoted_display_name_keeps_inner_whitespace() {
        let message =
            Message::from_bytes("From: \"The   qsecretary program\" <bounce@trusted.example>\n\n");
        let from = message.addr("from").unwrap();
        assert_eq!(from.name, "The   qsecretary program");
        assert_eq!(from.addr, "bounce@trusted.example");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let message = Message::from_bytes(SAMPLE);
        assert_eq!(message.header("SUBJECT"), Some("announce: queue-repair-symlink3 patch"));
        assert_eq!(message.header_or("X-Invented", ""), "");
    }

    #[test]
    fn test_addr_list_collects_across_fields() {
        let message = Message::from_bytes(SAMPLE);
        let mut recipients = message.addr_list(&["to"]);
        assert_eq!(recipients, vec![Address::new("", "qmail@list.cr.yp.to")]);

        recipients.extend(message.addr_list(&["blorf"]));
        assert_eq!(recipients.len(), 1);

        recipients.extend(message.addr_list(&["from"]));
        assert_eq!(recipients.len(), 2);
        assert_eq!(
            recipients[1],
            Address::new("Amitai Schleier", "schmonz@schmonz.com")
        );
    }

    #[test]
    fn test_addr_list_splits_lists_and_repeated_headers() {
        let message = Message::from_bytes(
            "To: \"Doe, Jane\" <jane@example.com>, bob@example.com\n\
             Cc: Carol <carol@example.com>\n\
             To: dave@example.com\n\n",
        );
        let addrs: Vec<String> = message
            .addr_list(&RECIPIENT_FIELDS)
            .into_iter()
            .map(|a| a.addr)
            .collect();
        assert_eq!(
            addrs,
            vec![
                "jane@example.com",
                "bob@example.com",
                "dave@example.com",
                "carol@example.com"
            ]
        );
    }

    #[test]
    fn test_folded_header_is_unfolded() {
        let message = Message::from_bytes("To: a@example.com,\n\tb@example.com\nSubject: hi\n\nbody\n");
        assert_eq!(message.header("to"), Some("a@example.com,\tb@example.com"));
        assert_eq!(message.addr_list(&["to"]).len(), 2);
    }

    #[test]
    fn test_crlf_separator_and_mbox_line() {
        let mut message =
            Message::from_bytes("From someone Mon Jul 30 09:09:23 2018\r\nSubject: x\r\n\r\nbody\r\n");
        assert_eq!(message.headers().len(), 1);
        assert_eq!(message.header("subject"), Some("x"));
        assert_eq!(message.body_lines().unwrap(), vec![b"body\r\n".to_vec()]);
    }

    #[test]
    fn test_message_without_headers() {
        let mut message = Message::from_bytes("just some text\nand more\n");
        assert!(message.headers().is_empty());
        assert_eq!(message.body_lines().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_address_field_forms() {
        assert_eq!(
            parse_address_field("From", "The qsecretary program <bounce@trusted.example>"),
            vec![Address::new("The qsecretary program", "bounce@trusted.example")]
        );
        assert_eq!(
            parse_address_field("To", "<only@example.com>"),
            vec![Address::new("", "only@example.com")]
        );
        assert_eq!(
            parse_address_field("To", "Team: a@example.com, b@example.com;")
                .into_iter()
                .map(|a| a.addr)
                .collect::<Vec<_>>(),
            vec!["a@example.com", "b@example.com"]
        );
    }

    #[test]
    fn test_domain_is_after_last_at() {
        assert_eq!(Address::new("", "a@b@trusted.example").domain(), "trusted.example");
        assert_eq!(Address::new("", "no-at-sign").domain(), "no-at-sign");
    }
}
