/// Characters that are rejected in a filename by at least one of the
/// filesystems an attachment is likely to be saved to. C0 control characters
/// are handled separately.
const INVALID_FILENAME_CHARS: &[char] = &['"', '<', '>', '|', ':', '*', '?', '\\', '/'];

pub const DEFAULT_PLACEHOLDER: char = '_';

fn is_invalid_filename_char(c: char) -> bool {
    c < '\u{20}' || INVALID_FILENAME_CHARS.contains(&c)
}

/// Replace every run of characters that are not allowed in a filename with a
/// single `placeholder`.
///
/// - sanitize_filename("a/b:c", '_') -> "a_b_c"
/// - sanitize_filename("a<>b", '_') -> "a_b"
pub fn sanitize_filename(name: &str, placeholder: char) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut in_invalid_run = false;

    for c in name.chars() {
        if is_invalid_filename_char(c) {
            if !in_invalid_run {
                sanitized.push(placeholder);
                in_invalid_run = true;
            }
        } else {
            sanitized.push(c);
            in_invalid_run = false;
        }
    }

    sanitized
}
