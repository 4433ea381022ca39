//! [`Message`] over a raw RFC 5322 message.
//!
//! Attachments are located with `mail-parser`; renaming one rewrites the
//! `filename`/`name` parameters in that part's own header block and leaves
//! every other byte of the message as it was received.

use crate::interceptor::{Message, MessageError};
use base64::prelude::*;
use mail_parser::{MessageParser, MimeHeaders};
use std::collections::HashMap;
use std::ops::Range;

/// Max bytes of UTF-8 text per RFC 2047 encoded word.
const ENCODED_WORD_CHUNK: usize = 45;

/// A top-level header to change, addressed the way the milter protocol
/// does it: name plus 1-based occurrence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderChange {
    pub name: String,
    pub index: u32,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct MessageChanges {
    pub headers: Vec<HeaderChange>,
    /// Replacement body, only when something below the top-level headers
    /// changed.
    pub body: Option<Vec<u8>>,
}

impl MessageChanges {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.body.is_none()
    }
}

#[derive(Debug)]
struct MimeAttachment {
    filename: Option<String>,
    header: Range<usize>,
    renamed: Option<String>,
}

#[derive(Debug)]
pub struct MimeMessage {
    raw: Vec<u8>,
    body_offset: usize,
    sender: String,
    subject: String,
    subject_changed: bool,
    attachments: Vec<MimeAttachment>,
}

impl MimeMessage {
    /// Parse `raw` (headers and body). `envelope_sender` is the SMTP
    /// `MAIL FROM` address; when it is empty the `From` header is used.
    pub fn parse(raw: Vec<u8>, envelope_sender: &str) -> Result<Self, MessageError> {
        let (body_offset, header_sender, subject, attachments) = {
            let parsed = MessageParser::default()
                .parse(raw.as_slice())
                .ok_or_else(|| MessageError::Malformed("unable to parse message".to_string()))?;

            let body_offset = parsed
                .parts
                .first()
                .map(|root| root.offset_body as usize)
                .unwrap_or(raw.len());

            let header_sender = parsed
                .from()
                .and_then(|from| from.first())
                .and_then(|addr| addr.address.as_deref())
                .unwrap_or_default()
                .to_string();

            let attachments = parsed
                .attachments()
                .map(|part| MimeAttachment {
                    filename: part.attachment_name().map(str::to_string),
                    header: part.offset_header as usize..part.offset_body as usize,
                    renamed: None,
                })
                .collect::<Vec<_>>();

            (
                body_offset,
                header_sender,
                parsed.subject().unwrap_or_default().to_string(),
                attachments,
            )
        };

        let envelope = envelope_sender
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim();
        let sender = if envelope.is_empty() {
            header_sender
        } else {
            envelope.to_string()
        };

        Ok(Self {
            raw,
            body_offset,
            sender,
            subject,
            subject_changed: false,
            attachments,
        })
    }

    pub fn attachment_names(&self) -> Vec<Option<&str>> {
        (0..self.attachments.len())
            .map(|index| self.attachment_filename(index))
            .collect()
    }

    /// The whole message with all edits applied.
    pub fn render(&self) -> Vec<u8> {
        self.render_with_offset().0
    }

    /// Edits expressed as top-level header changes plus an optional body
    /// replacement, for hosts that received headers and body separately.
    pub fn into_changes(self) -> MessageChanges {
        let (rendered, body_offset) = self.render_with_offset();

        let headers = diff_header_blocks(&self.raw[..self.body_offset], &rendered[..body_offset]);
        let body = (rendered[body_offset..] != self.raw[self.body_offset..])
            .then(|| rendered[body_offset..].to_vec());

        MessageChanges { headers, body }
    }

    fn render_with_offset(&self) -> (Vec<u8>, usize) {
        let mut edits: Vec<(Range<usize>, Vec<u8>)> = Vec::new();

        // A single-part message can itself be the attachment, its header
        // block is then the top-level one.
        let root_rename = self
            .attachments
            .iter()
            .find(|a| a.header.start < self.body_offset)
            .and_then(|a| a.renamed.as_deref());
        let new_subject = self.subject_changed.then_some(self.subject.as_str());

        let mut body_offset = self.body_offset;
        if root_rename.is_some() || new_subject.is_some() {
            let block = rewrite_header_block(&self.raw[..self.body_offset], root_rename, new_subject);
            body_offset = block.len();
            edits.push((0..self.body_offset, block));
        }

        for attachment in &self.attachments {
            if attachment.header.start < self.body_offset {
                continue;
            }
            if let Some(name) = &attachment.renamed {
                let block = rewrite_header_block(&self.raw[attachment.header.clone()], Some(name.as_str()), None);
                edits.push((attachment.header.clone(), block));
            }
        }

        edits.sort_by_key(|(range, _)| range.start);

        let mut out = Vec::with_capacity(self.raw.len() + 256);
        let mut cursor = 0;
        for (range, replacement) in edits {
            if range.start < cursor {
                continue;
            }
            out.extend_from_slice(&self.raw[cursor..range.start]);
            out.extend_from_slice(&replacement);
            cursor = range.end;
        }
        out.extend_from_slice(&self.raw[cursor..]);

        (out, body_offset)
    }
}

impl Message for MimeMessage {
    fn sender(&self) -> &str {
        &self.sender
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn set_subject(&mut self, subject: &str) -> Result<(), MessageError> {
        self.subject = subject.to_string();
        self.subject_changed = true;
        Ok(())
    }

    fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    fn attachment_filename(&self, index: usize) -> Option<&str> {
        let attachment = self.attachments.get(index)?;
        attachment
            .renamed
            .as_deref()
            .or(attachment.filename.as_deref())
    }

    fn set_attachment_filename(&mut self, index: usize, filename: &str) -> Result<(), MessageError> {
        let raw_len = self.raw.len();
        let attachment = self.attachments.get_mut(index).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no attachment at position {}", index + 1),
            )
        })?;

        if attachment.header.start > attachment.header.end || attachment.header.end > raw_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("header block of attachment {} lies outside the message", index + 1),
            )
            .into());
        }

        attachment.renamed = Some(filename.to_string());
        Ok(())
    }
}

/// Byte ranges of the fields in a header block, folded lines included. Lines
/// without a colon (the blank separator line) are their own range.
fn field_ranges(block: &[u8]) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    let mut pos = 0;

    while pos < block.len() {
        let line_end = block[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(block.len(), |i| pos + i + 1);

        match ranges.last_mut() {
            Some(last) if matches!(block[pos], b' ' | b'\t') => last.end = line_end,
            _ => ranges.push(pos..line_end),
        }
        pos = line_end;
    }

    ranges
}

fn line_ending(field: &[u8]) -> &'static str {
    if field.ends_with(b"\r\n") {
        "\r\n"
    } else if field.ends_with(b"\n") {
        "\n"
    } else {
        ""
    }
}

fn unfold(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .replace(['\r', '\n'], "")
        .trim()
        .to_string()
}

/// Unfolded (name, value) pairs of a header block.
fn header_fields(block: &[u8]) -> Vec<(String, String)> {
    field_ranges(block)
        .into_iter()
        .filter_map(|range| {
            let field = &block[range];
            let colon = field.iter().position(|&b| b == b':')?;
            Some((
                String::from_utf8_lossy(&field[..colon]).trim().to_string(),
                unfold(&field[colon + 1..]),
            ))
        })
        .collect()
}

fn diff_header_blocks(old: &[u8], new: &[u8]) -> Vec<HeaderChange> {
    let old_fields = header_fields(old);
    let mut occurrences: HashMap<String, u32> = HashMap::new();
    let mut changes = Vec::new();

    for (position, (name, value)) in header_fields(new).into_iter().enumerate() {
        let index = occurrences.entry(name.to_ascii_lowercase()).or_insert(0);
        *index += 1;

        let unchanged = old_fields
            .get(position)
            .is_some_and(|(old_name, old_value)| old_name == &name && old_value == &value);
        if !unchanged {
            changes.push(HeaderChange {
                name,
                index: *index,
                value,
            });
        }
    }

    changes
}

/// Rewrite the filename parameters and/or the subject of a header block.
fn rewrite_header_block(block: &[u8], filename: Option<&str>, subject: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len() + 64);
    let mut pending_subject = subject;

    for range in field_ranges(block) {
        let field = &block[range];
        let eol = line_ending(field);

        let Some(colon) = field.iter().position(|&b| b == b':') else {
            if let Some(subject) = pending_subject.take() {
                let line = if eol.is_empty() { "\r\n" } else { eol };
                out.extend_from_slice(format!("Subject: {}{line}", encode_header_value(subject)).as_bytes());
            }
            out.extend_from_slice(field);
            continue;
        };

        let name = String::from_utf8_lossy(&field[..colon]).trim().to_string();
        let value = unfold(&field[colon + 1..]);

        let replacement = match name.to_ascii_lowercase().as_str() {
            "content-disposition" => filename.map(|f| set_parameter(&value, "filename", f, true)),
            "content-type" => filename.and_then(|f| {
                let updated = set_parameter(&value, "name", f, false);
                (updated != value).then_some(updated)
            }),
            "subject" => pending_subject.take().map(encode_header_value),
            _ => None,
        };

        match replacement {
            Some(value) => out.extend_from_slice(format!("{name}: {value}{eol}").as_bytes()),
            None => out.extend_from_slice(field),
        }
    }

    if let Some(subject) = pending_subject {
        out.extend_from_slice(format!("Subject: {}\r\n", encode_header_value(subject)).as_bytes());
    }

    out
}

/// Split on `separator` outside of quoted strings.
fn split_unquoted(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (idx, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == separator && !in_quotes => {
                parts.push(&value[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// Replace every form of `param` (plain, RFC 2231 extended and continued)
/// with a single `param` carrying `new_value`. Returns `value` unchanged if
/// the parameter is absent and `add_if_missing` is false.
fn set_parameter(value: &str, param: &str, new_value: &str, add_if_missing: bool) -> String {
    let segments = split_unquoted(value, ';');
    let mut out = vec![segments[0].trim().to_string()];
    let mut inserted = false;

    for segment in &segments[1..] {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let key = segment.split('=').next().unwrap_or_default().trim();
        let base = key.split('*').next().unwrap_or_default();
        if base.eq_ignore_ascii_case(param) {
            if !inserted {
                out.push(format_parameter(param, new_value));
                inserted = true;
            }
            continue;
        }
        out.push(segment.to_string());
    }

    if !inserted {
        if !add_if_missing {
            return value.to_string();
        }
        out.push(format_parameter(param, new_value));
    }

    out.join("; ")
}

fn format_parameter(param: &str, value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        return format!("{param}=\"{escaped}\"");
    }

    // RFC 2231 extended value
    let mut encoded = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("{param}*=UTF-8''{encoded}")
}

/// Header value as-is when it is plain ASCII, otherwise as RFC 2047 encoded
/// words.
pub fn encode_header_value(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && (!c.is_ascii_control() || c == '\t')) {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk_start = 0;
    for (idx, c) in value.char_indices() {
        if idx + c.len_utf8() - chunk_start > ENCODED_WORD_CHUNK {
            words.push(&value[chunk_start..idx]);
            chunk_start = idx;
        }
    }
    words.push(&value[chunk_start..]);

    words
        .into_iter()
        .map(|word| format!("=?UTF-8?B?{}?=", BASE64_STANDARD.encode(word)))
        .collect::<Vec<_>>()
        .join(" ")
}
