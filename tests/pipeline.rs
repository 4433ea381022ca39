use attach_rename_milter::{
    ConfigStore, Disposition, Message, MessageInterceptor, MimeMessage, RewriteSettings,
};
use mail_parser::{MessageParser, MimeHeaders};
use std::sync::Arc;

const MAPPINGS: &str = "\
- domain:
    name: Reports@Example.com
    address: archive@example.org
- comment:
    text: ignored
";

const MESSAGE: &str = "From: Reports <reports@example.com>\r\n\
To: team@example.org\r\n\
Subject: 01.02.2024 Monthly Figures\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"SEP\"\r\n\
\r\n\
--SEP\r\n\
Content-Type: text/plain\r\n\
\r\n\
Figures attached.\r\n\
--SEP\r\n\
Content-Type: application/pdf; name=\"cover.pdf\"\r\n\
Content-Disposition: attachment; filename=\"cover.pdf\"\r\n\
\r\n\
JVBERi0=\r\n\
--SEP\r\n\
Content-Type: application/octet-stream; name=\"WORKBOOK_77e1.xlsx\"\r\n\
Content-Disposition: attachment; filename=\"WORKBOOK_77e1.xlsx\"\r\n\
\r\n\
UEsDBAo=\r\n\
--SEP--\r\n";

fn interceptor(dir: &tempfile::TempDir) -> MessageInterceptor {
    let path = dir.path().join("mappings.yaml");
    std::fs::write(&path, MAPPINGS).unwrap();
    let store = Arc::new(ConfigStore::new(&path));
    assert!(store.reload().is_accepted());
    MessageInterceptor::new(store, RewriteSettings::default())
}

#[test]
fn mapped_message_is_rewritten_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let interceptor = interceptor(&dir);

    let mut message = MimeMessage::parse(MESSAGE.as_bytes().to_vec(), "<REPORTS@example.com>").unwrap();
    let mut completions = 0;
    let disposition = interceptor.process(&mut message, || completions += 1);

    assert_eq!(completions, 1);
    match disposition {
        Disposition::Rewritten {
            target,
            attachments,
            subject_changed,
        } => {
            assert_eq!(target, "archive@example.org");
            assert_eq!(attachments, 1);
            assert!(subject_changed);
        }
        other => panic!("unexpected disposition: {other:?}"),
    }

    let rendered = message.render();
    let parsed = MessageParser::default().parse(rendered.as_slice()).unwrap();
    assert_eq!(parsed.subject(), Some("20240201 Monthly Figures"));
    let names: Vec<_> = parsed
        .attachments()
        .map(|part| part.attachment_name().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["cover.pdf", "20240201 Monthly Figures-2.xlsx"]);
}

#[test]
fn unmapped_message_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let interceptor = interceptor(&dir);

    let mut message = MimeMessage::parse(MESSAGE.as_bytes().to_vec(), "<other@example.com>").unwrap();
    let mut completions = 0;
    let disposition = interceptor.process(&mut message, || completions += 1);

    assert_eq!(completions, 1);
    assert!(matches!(disposition, Disposition::UnknownSender));
    assert_eq!(message.render(), MESSAGE.as_bytes());
    assert!(message.into_changes().is_empty());
}

#[test]
fn missing_mapping_document_passes_messages_through() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ConfigStore::new(dir.path().join("absent.yaml")));
    assert!(!store.reload().is_accepted());
    let interceptor = MessageInterceptor::new(store, RewriteSettings::default());

    let mut message = MimeMessage::parse(MESSAGE.as_bytes().to_vec(), "reports@example.com").unwrap();
    let disposition = interceptor.process(&mut message, || {});

    assert!(matches!(disposition, Disposition::NoMapping));
    assert_eq!(message.subject(), "01.02.2024 Monthly Figures");
}
