use chrono::NaiveDate;

/// Number of characters at the start of a subject that may hold a date.
pub const DATE_PREFIX_LEN: usize = 10;

pub const DEFAULT_DATE_FORMAT: &str = "%d.%m.%Y";

/// Rewrite a subject that starts with a date into a sortable form.
///
/// The first ten characters are parsed with `date_format`. On success the
/// result is the date as `YYYYMMDD`, a space, and the trimmed remainder of the
/// subject. `None` means the subject has no date prefix; callers then use
/// an empty segment.
///
/// ```
/// use attach_rename_milter::subject::rewrite_subject;
///
/// assert_eq!(
///     rewrite_subject("15.03.2024 Weekly Report", "%d.%m.%Y").as_deref(),
///     Some("20240315 Weekly Report")
/// );
/// assert_eq!(rewrite_subject("Short", "%d.%m.%Y"), None);
/// ```
pub fn rewrite_subject(subject: &str, date_format: &str) -> Option<String> {
    // Index by characters so a multi-byte subject never splits a code point.
    let split = subject
        .char_indices()
        .nth(DATE_PREFIX_LEN)
        .map(|(idx, _)| idx)
        .or_else(|| (subject.chars().count() == DATE_PREFIX_LEN).then_some(subject.len()))?;

    let (date_part, remainder) = subject.split_at(split);
    let date = NaiveDate::parse_from_str(date_part, date_format).ok()?;

    Some(format!("{} {}", date.format("%Y%m%d"), remainder.trim()))
}
