use crate::config_store::ConfigStore;
use crate::sanitize::{sanitize_filename, DEFAULT_PLACEHOLDER};
use crate::subject::{rewrite_subject, DEFAULT_DATE_FORMAT};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MARKER_PREFIX: &str = "WORKBOOK_";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("I/O failure while rewriting message: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// The fields of an outbound message the interceptor reads and edits.
///
/// Implementations must never change the sender or attachment contents.
pub trait Message {
    fn sender(&self) -> &str;
    fn subject(&self) -> &str;
    fn set_subject(&mut self, subject: &str) -> Result<(), MessageError>;
    fn attachment_count(&self) -> usize;
    /// Filename of the attachment at `index`, `None` if it has none.
    fn attachment_filename(&self, index: usize) -> Option<&str>;
    fn set_attachment_filename(&mut self, index: usize, filename: &str) -> Result<(), MessageError>;
}

#[derive(Debug, Clone)]
pub struct RewriteSettings {
    pub marker_prefix: String,
    pub date_format: String,
    pub placeholder: char,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        Self {
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            placeholder: DEFAULT_PLACEHOLDER,
        }
    }
}

/// What happened to one message.
#[derive(Debug)]
pub enum Disposition {
    /// No mapping is loaded, nothing can qualify.
    NoMapping,
    UnknownSender,
    NoAttachments,
    NoQualifyingAttachments,
    Rewritten {
        target: String,
        attachments: usize,
        subject_changed: bool,
    },
    /// Processing stopped at the first failure. Renames already applied
    /// stay applied.
    Failed {
        attachments: usize,
        error: MessageError,
    },
}

impl Disposition {
    pub fn is_modified(&self) -> bool {
        match self {
            Disposition::Rewritten { .. } => true,
            Disposition::Failed { attachments, .. } => *attachments > 0,
            _ => false,
        }
    }
}

/// Fires the completion callback exactly once when dropped.
struct CompletionGuard<F: FnOnce()> {
    signal: Option<F>,
}

impl<F: FnOnce()> Drop for CompletionGuard<F> {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal();
        }
    }
}

pub struct MessageInterceptor {
    store: Arc<ConfigStore>,
    settings: RewriteSettings,
}

impl MessageInterceptor {
    pub fn new(store: Arc<ConfigStore>, settings: RewriteSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &RewriteSettings {
        &self.settings
    }

    /// Evaluate one message and rewrite it if its sender is mapped.
    ///
    /// `complete` is called exactly once before this returns, whatever the
    /// outcome, including when rewriting fails part way or panics.
    pub fn process<M, F>(&self, message: &mut M, complete: F) -> Disposition
    where
        M: Message + ?Sized,
        F: FnOnce(),
    {
        let _completion = CompletionGuard {
            signal: Some(complete),
        };

        let disposition = self.rewrite(message);
        match &disposition {
            Disposition::Rewritten {
                target,
                attachments,
                subject_changed,
            } => log::info!(
                "Rewrote {attachments} attachment(s) from {} (mapped to {target}), subject changed: {subject_changed}",
                message.sender()
            ),
            Disposition::Failed { attachments, error } => log::error!(
                "Abandoned rewrite of message from {} after {attachments} attachment(s): {error}",
                message.sender()
            ),
            other => log::debug!("Message from {} passed through: {other:?}", message.sender()),
        }
        disposition
    }

    fn rewrite<M: Message + ?Sized>(&self, message: &mut M) -> Disposition {
        // Held for this message only, a concurrent reload cannot free it.
        let snapshot = self.store.current_snapshot();
        if snapshot.is_empty() {
            return Disposition::NoMapping;
        }

        let Some(target) = snapshot.target_for(message.sender()) else {
            return Disposition::UnknownSender;
        };

        if message.attachment_count() == 0 {
            return Disposition::NoAttachments;
        }

        let new_subject = rewrite_subject(message.subject().trim(), &self.settings.date_format);
        let name_prefix = new_subject.as_deref().unwrap_or_default();

        let mut renamed = 0;
        for index in 0..message.attachment_count() {
            let new_name = match message.attachment_filename(index) {
                Some(filename) if filename.starts_with(&self.settings.marker_prefix) => {
                    let composed = format!("{name_prefix}-{}{}", index + 1, extension_of(filename));
                    sanitize_filename(&composed, self.settings.placeholder)
                }
                _ => continue,
            };

            if let Err(error) = message.set_attachment_filename(index, &new_name) {
                return Disposition::Failed {
                    attachments: renamed,
                    error,
                };
            }
            renamed += 1;
        }

        if renamed == 0 {
            return Disposition::NoQualifyingAttachments;
        }

        // Without a date prefix the subject is blanked, matching the empty
        // segment the attachments were named with.
        let subject = new_subject.unwrap_or_default();
        let subject_changed = message.subject() != subject;
        if let Err(error) = message.set_subject(&subject) {
            return Disposition::Failed {
                attachments: renamed,
                error,
            };
        }

        Disposition::Rewritten {
            target: target.to_string(),
            attachments: renamed,
            subject_changed,
        }
    }
}

/// Extension of the final path component including the leading dot, or ""
/// when there is none (dot files and trailing dots have no extension).
pub fn extension_of(filename: &str) -> &str {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match base.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < base.len() => &base[idx..],
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_map::{AddressMapping, MappingError};
    use crate::config_store::MappingSource;
    use std::cell::Cell;

    struct StaticSource(AddressMapping);

    impl MappingSource for StaticSource {
        fn load(&self) -> Result<AddressMapping, MappingError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug, Default)]
    struct TestMessage {
        sender: String,
        subject: String,
        attachments: Vec<Option<String>>,
        fail_on_rename: Option<usize>,
    }

    impl TestMessage {
        fn new(sender: &str, subject: &str, attachments: &[&str]) -> Self {
            Self {
                sender: sender.to_string(),
                subject: subject.to_string(),
                attachments: attachments.iter().map(|a| Some(a.to_string())).collect(),
                fail_on_rename: None,
            }
        }

        fn names(&self) -> Vec<&str> {
            self.attachments
                .iter()
                .map(|a| a.as_deref().unwrap_or(""))
                .collect()
        }
    }

    impl Message for TestMessage {
        fn sender(&self) -> &str {
            &self.sender
        }

        fn subject(&self) -> &str {
            &self.subject
        }

        fn set_subject(&mut self, subject: &str) -> Result<(), MessageError> {
            self.subject = subject.to_string();
            Ok(())
        }

        fn attachment_count(&self) -> usize {
            self.attachments.len()
        }

        fn attachment_filename(&self, index: usize) -> Option<&str> {
            self.attachments.get(index)?.as_deref()
        }

        fn set_attachment_filename(&mut self, index: usize, filename: &str) -> Result<(), MessageError> {
            if self.fail_on_rename == Some(index) {
                return Err(MessageError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "attachment stream closed",
                )));
            }
            self.attachments[index] = Some(filename.to_string());
            Ok(())
        }
    }

    fn interceptor_with(pairs: &[(&str, &str)]) -> MessageInterceptor {
        let mapping = AddressMapping::from_pairs(pairs.iter().copied());
        let store = Arc::new(ConfigStore::with_source(Box::new(StaticSource(mapping))));
        assert!(store.reload().is_accepted());
        MessageInterceptor::new(store, RewriteSettings::default())
    }

    fn run(interceptor: &MessageInterceptor, message: &mut TestMessage) -> (Disposition, usize) {
        let completions = Cell::new(0);
        let disposition = interceptor.process(message, || completions.set(completions.get() + 1));
        (disposition, completions.get())
    }

    #[test]
    fn test_rewrites_matching_sender() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message = TestMessage::new(
            "SENDER@EXAMPLE.COM",
            "15.03.2024 Weekly Report",
            &["WORKBOOK_abc.xlsx", "notes.txt"],
        );

        let (disposition, completions) = run(&interceptor, &mut message);
        assert_eq!(completions, 1);
        match disposition {
            Disposition::Rewritten {
                target,
                attachments,
                subject_changed,
            } => {
                assert_eq!(target, "target@example.org");
                assert_eq!(attachments, 1);
                assert!(subject_changed);
            }
            other => panic!("Expected rewrite, got {other:?}"),
        }
        assert_eq!(message.names(), vec!["20240315 Weekly Report-1.xlsx", "notes.txt"]);
        assert_eq!(message.subject, "20240315 Weekly Report");
        assert_eq!(message.sender, "SENDER@EXAMPLE.COM");
    }

    #[test]
    fn test_position_counts_all_attachments() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message = TestMessage::new(
            "sender@example.com",
            "  01.02.2024 Sales  ",
            &["cover.pdf", "WORKBOOK_1.xlsx", "WORKBOOK_2.csv", "workbook_lower.xlsx"],
        );

        let (disposition, _) = run(&interceptor, &mut message);
        assert!(disposition.is_modified());
        assert_eq!(
            message.names(),
            vec![
                "cover.pdf",
                "20240201 Sales-2.xlsx",
                "20240201 Sales-3.csv",
                "workbook_lower.xlsx"
            ]
        );
        assert_eq!(message.subject, "20240201 Sales");
    }

    #[test]
    fn test_unknown_sender_is_untouched() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message =
            TestMessage::new("other@example.com", "15.03.2024 Weekly Report", &["WORKBOOK_abc.xlsx"]);

        let (disposition, completions) = run(&interceptor, &mut message);
        assert!(matches!(disposition, Disposition::UnknownSender));
        assert_eq!(completions, 1);
        assert_eq!(message.names(), vec!["WORKBOOK_abc.xlsx"]);
        assert_eq!(message.subject, "15.03.2024 Weekly Report");
    }

    #[test]
    fn test_no_attachments_is_untouched() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message = TestMessage::new("sender@example.com", "15.03.2024 Weekly Report", &[]);

        let (disposition, completions) = run(&interceptor, &mut message);
        assert!(matches!(disposition, Disposition::NoAttachments));
        assert_eq!(completions, 1);
        assert_eq!(message.subject, "15.03.2024 Weekly Report");
    }

    #[test]
    fn test_empty_mapping_passes_through() {
        let interceptor = interceptor_with(&[]);
        let mut message =
            TestMessage::new("sender@example.com", "15.03.2024 Report", &["WORKBOOK_abc.xlsx"]);

        let (disposition, completions) = run(&interceptor, &mut message);
        assert!(matches!(disposition, Disposition::NoMapping));
        assert_eq!(completions, 1);
        assert_eq!(message.names(), vec!["WORKBOOK_abc.xlsx"]);
    }

    #[test]
    fn test_no_qualifying_attachment_keeps_subject() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message =
            TestMessage::new("sender@example.com", "15.03.2024 Report", &["report.xlsx"]);
        message.attachments.push(None);

        let (disposition, _) = run(&interceptor, &mut message);
        assert!(matches!(disposition, Disposition::NoQualifyingAttachments));
        assert_eq!(message.subject, "15.03.2024 Report");
    }

    #[test]
    fn test_subject_without_date() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message = TestMessage::new("sender@example.com", "Weekly", &["WORKBOOK_abc.xlsx"]);

        let (disposition, _) = run(&interceptor, &mut message);
        match disposition {
            Disposition::Rewritten {
                attachments,
                subject_changed,
                ..
            } => {
                assert_eq!(attachments, 1);
                assert!(subject_changed);
            }
            other => panic!("Expected rewrite, got {other:?}"),
        }
        assert_eq!(message.names(), vec!["-1.xlsx"]);
        assert_eq!(message.subject, "");
    }

    #[test]
    fn test_composed_name_is_sanitized() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message = TestMessage::new(
            "sender@example.com",
            "15.03.2024 Sales: North/South",
            &["WORKBOOK_x.xlsx"],
        );

        run(&interceptor, &mut message);
        assert_eq!(message.names(), vec!["20240315 Sales_ North_South-1.xlsx"]);
        // The subject itself keeps its characters
        assert_eq!(message.subject, "20240315 Sales: North/South");
    }

    #[test]
    fn test_failure_stops_processing_and_still_completes() {
        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let mut message = TestMessage::new(
            "sender@example.com",
            "15.03.2024 Report",
            &["WORKBOOK_a.xlsx", "WORKBOOK_b.xlsx", "WORKBOOK_c.xlsx"],
        );
        message.fail_on_rename = Some(1);

        let (disposition, completions) = run(&interceptor, &mut message);
        assert_eq!(completions, 1);
        match disposition {
            Disposition::Failed {
                attachments,
                error: MessageError::Io(_),
            } => assert_eq!(attachments, 1),
            other => panic!("Expected failure, got {other:?}"),
        }
        // First rename is not rolled back, the rest are abandoned
        assert_eq!(
            message.names(),
            vec!["20240315 Report-1.xlsx", "WORKBOOK_b.xlsx", "WORKBOOK_c.xlsx"]
        );
        assert_eq!(message.subject, "15.03.2024 Report");
    }

    #[test]
    fn test_completion_fires_on_panic() {
        struct PanickingMessage;

        impl Message for PanickingMessage {
            fn sender(&self) -> &str {
                panic!("host handed over a broken message")
            }
            fn subject(&self) -> &str {
                ""
            }
            fn set_subject(&mut self, _: &str) -> Result<(), MessageError> {
                Ok(())
            }
            fn attachment_count(&self) -> usize {
                0
            }
            fn attachment_filename(&self, _: usize) -> Option<&str> {
                None
            }
            fn set_attachment_filename(&mut self, _: usize, _: &str) -> Result<(), MessageError> {
                Ok(())
            }
        }

        let interceptor = interceptor_with(&[("sender@example.com", "target@example.org")]);
        let completions = Cell::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            interceptor.process(&mut PanickingMessage, || completions.set(completions.get() + 1))
        }));
        assert!(result.is_err());
        assert_eq!(completions.get(), 1);
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("WORKBOOK_abc.xlsx"), ".xlsx");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("WORKBOOK_abc"), "");
        assert_eq!(extension_of(".hidden"), "");
        assert_eq!(extension_of("trailing."), "");
        assert_eq!(extension_of("dir.d/file"), "");
        assert_eq!(extension_of(r"C:\dir.d\file.txt"), ".txt");
    }
}
