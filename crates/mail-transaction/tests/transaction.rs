use bytes::Bytes;
use mail_transaction::{
    create_transaction, AttachmentInfo, AttachmentStream, StreamEvent, Transaction,
    TransactionConfig, TransactionError,
};
use mailbody::{ContentTransferEncoding, MimePart};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A Czech pangram in ISO-8859-2
const CZECH_PANGRAM: &[u8] = &[
    0x50, 0xF8, 0xED, 0x6C, 0x69, 0xB9, 0x20, 0xBE, 0x6C, 0x75, 0xBB, 0x6F, 0x76, 0xE8, 0x6B,
    0xFD, 0x20, 0x6B, 0xF9, 0xF2, 0xFA, 0xEC, 0x6C, 0x20, 0xEF, 0xE2, 0x62, 0x65, 0x6C, 0x73,
    0x6b, 0xE9, 0x20, 0xF3, 0x64, 0x79, 0x2E,
];

fn specimen(name: &str) -> Vec<u8> {
    let path = format!("{}/tests/specimens/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {path}: {err:#}"))
}

/// Feed data into the transaction one line at a time
fn add_lines(transaction: &mut Transaction, data: &[u8]) {
    for line in data.split_inclusive(|&b| b == b'\n') {
        transaction.add_data(line).unwrap();
    }
}

fn output(transaction: &Transaction) -> Bytes {
    transaction.message_stream().unwrap().get_data()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    memchr::memmem::find(haystack, needle).is_some()
}

type Attachments = Arc<Mutex<BTreeMap<String, (AttachmentInfo, Bytes)>>>;

/// A hook that reads each stream as soon as it is handed over
fn collect_attachments(transaction: &mut Transaction) -> Attachments {
    let attachments: Attachments = Default::default();
    let collected = attachments.clone();
    transaction
        .attachment_hooks(move |info: AttachmentInfo, mut stream: AttachmentStream| {
            let mut data = vec![];
            while let Some(event) = stream.try_next() {
                match event {
                    StreamEvent::Data(chunk) => data.extend_from_slice(&chunk),
                    StreamEvent::End => break,
                }
            }
            let name = info.filename.clone().unwrap_or_else(|| info.part.id_string());
            collected.lock().insert(name, (info, Bytes::from(data)));
        })
        .unwrap();
    attachments
}

#[test_log::test(tokio::test)]
async fn body_filter_plumbing() {
    let calls = Arc::new(Mutex::new(vec![]));
    let mut transaction = create_transaction();
    let recorded = calls.clone();
    transaction
        .add_body_filter(
            "text/plain",
            move |ct: &str, charset: &str, body: &[u8]| -> Option<Vec<u8>> {
                recorded.lock().push((
                    ct.to_string(),
                    charset.to_string(),
                    String::from_utf8_lossy(body).to_string(),
                ));
                None
            },
        )
        .unwrap();

    for line in [
        "Content-Type: multipart/alternative; boundary=abcd\n",
        "\n",
        "--abcd\n",
        "Content-Type: text/plain\n",
        "\n",
        "Text part\n",
        "--abcd\n",
        "Content-Type: text/html\n",
        "\n",
        "<p>HTML part</p>\n",
        "--abcd--\n",
    ] {
        transaction.add_data(line).unwrap();
    }
    transaction.end_data().await.unwrap();

    let calls = calls.lock();
    k9::assert_equal!(calls.len(), 1);
    let (ct, charset, body) = &calls[0];
    k9::assert_equal!(ct, "text/plain");
    k9::assert_equal!(charset, "utf-8");
    k9::assert_equal!(body.trim(), "Text part");
}

#[test_log::test(tokio::test)]
async fn attachment_hook_before_banner_and_filter() {
    let called = Arc::new(Mutex::new(0));
    let mut transaction = create_transaction();
    transaction
        .attachment_hooks(|_: AttachmentInfo, _: AttachmentStream| {})
        .unwrap();
    transaction.set_banner("banner", None).unwrap();
    let counter = called.clone();
    transaction
        .add_body_filter("", move |_: &str, _: &str, _: &[u8]| -> Option<Vec<u8>> {
            *counter.lock() += 1;
            None
        })
        .unwrap();

    for line in ["Content-Type: text/plain\n", "\n", "Some text\n"] {
        transaction.add_data(line).unwrap();
    }
    transaction.end_data().await.unwrap();

    k9::assert_equal!(*called.lock(), 1);
    let body = output(&transaction);
    assert!(String::from_utf8_lossy(&body).trim().ends_with("banner"));
    assert_eq!(body, "Content-Type: text/plain\n\nSome text\nbanner\n");
}

#[test_log::test(tokio::test)]
async fn registration_order_is_irrelevant() {
    let message = concat!(
        "Content-Type: multipart/mixed; boundary=b\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "hello\r\n",
        "--b\r\n",
        "Content-Type: application/pdf; name=doc.pdf\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "JVBERi0=\r\n",
        "--b--\r\n",
    );

    async fn run(message: &str, hook_first: bool) -> (Bytes, Vec<String>) {
        let mut transaction = create_transaction();
        let attachments = if hook_first {
            let attachments = collect_attachments(&mut transaction);
            transaction.set_banner("BANNER", None).unwrap();
            attachments
        } else {
            transaction.set_banner("BANNER", None).unwrap();
            collect_attachments(&mut transaction)
        };
        transaction.add_data(message).unwrap();
        transaction.end_data().await.unwrap();
        let names = attachments.lock().keys().cloned().collect();
        (output(&transaction), names)
    }

    let (hook_first, names) = run(message, true).await;
    k9::assert_equal!(names, vec!["doc.pdf".to_string()]);
    k9::assert_equal!(run(message, false).await, (hook_first.clone(), names));
    assert!(contains(&hook_first, b"hello\r\nBANNER\r\n--b\r\n"));
    assert!(contains(&hook_first, b"JVBERi0=\r\n--b--\r\n"));
}

#[test_log::test(tokio::test)]
async fn non_utf8_content_survives_parse_body() {
    let mut message = b"Content-Type: text/plain; charset=iso-8859-2; format=flowed\n\n".to_vec();
    message.extend_from_slice(CZECH_PANGRAM);
    message.push(b'\n');

    let mut transaction = create_transaction();
    transaction.set_parse_body(true);
    transaction
        .attachment_hooks(|_: AttachmentInfo, _: AttachmentStream| {})
        .unwrap();
    add_lines(&mut transaction, &message);
    transaction.end_data().await.unwrap();

    let body = output(&transaction);
    assert!(contains(&body, CZECH_PANGRAM));
    assert_eq!(body.as_ref(), message.as_slice());

    let text = transaction.body().unwrap().body_text().unwrap();
    k9::assert_equal!(
        text,
        "P\u{159}\u{ed}li\u{161} \u{17e}lu\u{165}ov\u{10d}k\u{fd} k\u{16f}\u{148}\u{fa}\u{11b}l \u{10f}\u{e2}belsk\u{e9} \u{f3}dy.\n"
    );
}

#[test_log::test(tokio::test)]
async fn no_munging_without_parse_body() {
    let mut message = b"Content-Type: text/plain; charset=iso-8859-2; format=flowed\n\n".to_vec();
    message.extend_from_slice(CZECH_PANGRAM);
    message.push(b'\n');

    let mut transaction = create_transaction();
    add_lines(&mut transaction, &message);
    transaction.end_data().await.unwrap();

    assert!(!transaction.parse_body());
    assert!(transaction.body().is_none());
    assert_eq!(output(&transaction).as_ref(), message.as_slice());
}

#[test_log::test(tokio::test)]
async fn banner_keeps_bytes_invalid_in_declared_charset() {
    let message: &[u8] = b"Content-Type: text/plain; charset=utf-8\r\n\r\ncaf\xe9 \xff ok\r\n";

    let mut transaction = create_transaction();
    transaction.set_banner("BANNER", None).unwrap();
    transaction.add_data(message).unwrap();
    transaction.end_data().await.unwrap();

    let body = transaction.body().unwrap();
    assert_eq!(body.decode_body().unwrap().as_ref(), b"caf\xe9 \xff ok\r\nBANNER\r\n");
    k9::assert_equal!(
        body.headers().get_first("Content-Type").unwrap().get_value(),
        "text/plain; charset=utf-8"
    );
    k9::assert_equal!(body.info().encoding, ContentTransferEncoding::QuotedPrintable);

    // rewriting text that was not decodable would lose bytes
    let mut transaction = create_transaction();
    transaction
        .add_body_filter("text/plain", |_: &str, _: &str, body: &[u8]| {
            Some(String::from_utf8_lossy(body).to_uppercase().into_bytes())
        })
        .unwrap();
    transaction.add_data(message).unwrap();
    transaction.end_data().await.unwrap();
    assert_eq!(output(&transaction).as_ref(), message);
}

#[test_log::test(tokio::test)]
async fn banner_after_unterminated_header_block() {
    let mut transaction = create_transaction();
    transaction.set_banner("BANNER", None).unwrap();
    transaction.add_data("Content-Type: text/plain").unwrap();
    transaction.end_data().await.unwrap();
    assert_eq!(output(&transaction), "Content-Type: text/plain\r\n\r\nBANNER\r\n");
}

#[test_log::test(tokio::test)]
async fn banner_with_nested_mime_structure() {
    let mut transaction = create_transaction();
    transaction
        .set_banner("TEXT_BANNER", Some("HTML_BANNER"))
        .unwrap();
    for line in [
        r#"Content-Type: multipart/mixed; boundary="TOP_LEVEL""#,
        "",
        "--TOP_LEVEL",
        r#"Content-Type: multipart/alternative; boundary="INNER_LEVEL""#,
        "",
        "--INNER_LEVEL",
        "Content-Type: text/plain; charset=us-ascii",
        "",
        "Hello, this is a text part",
        "--INNER_LEVEL",
        "Content-Type: text/html; charset=us-ascii",
        "",
        "<p>This is an html part</p>",
        "--INNER_LEVEL--",
        "--TOP_LEVEL--",
    ] {
        transaction.add_data(format!("{line}\r\n")).unwrap();
    }
    transaction.end_data().await.unwrap();

    let body = output(&transaction);
    assert!(contains(
        &body,
        b"Hello, this is a text part\r\nTEXT_BANNER\r\n--INNER_LEVEL\r\n"
    ));
    assert!(contains(
        &body,
        b"<p>This is an html part</p>\r\nHTML_BANNER\r\n--INNER_LEVEL--\r\n"
    ));
    assert!(body.ends_with(b"--INNER_LEVEL--\r\n--TOP_LEVEL--\r\n"));
}

#[test_log::test(tokio::test)]
async fn escaped_text_banner_in_html() {
    let mut transaction = create_transaction();
    transaction.set_banner("Fish & chips\nsecond", None).unwrap();
    transaction
        .add_data("Content-Type: text/html\r\n\r\n<html><body><p>hi</p></body></html>\r\n")
        .unwrap();
    transaction.end_data().await.unwrap();
    assert_eq!(
        output(&transaction),
        "Content-Type: text/html\r\n\r\n<html><body><p>hi</p>Fish &amp; chips<br/>\r\nsecond\r\n</body></html>\r\n"
    );
}

#[test_log::test(tokio::test)]
async fn banner_skips_attachments() {
    let message = concat!(
        "Content-Type: multipart/mixed; boundary=b\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain\r\n",
        "Content-Disposition: attachment; filename=notes.txt\r\n",
        "\r\n",
        "notes\r\n",
        "--b--\r\n",
    );
    let mut transaction = create_transaction();
    transaction.set_banner("BANNER", None).unwrap();
    let attachments = collect_attachments(&mut transaction);
    transaction.add_data(message).unwrap();
    transaction.end_data().await.unwrap();

    assert_eq!(output(&transaction), message);
    let attachments = attachments.lock();
    let (info, data) = &attachments["notes.txt"];
    k9::assert_equal!(info.content_type, "text/plain");
    assert_eq!(data, "notes\r\n");
}

#[test_log::test(tokio::test)]
async fn varied_base64_fold_lengths_preserve_data() {
    let message = specimen("varied-fold-lengths-preserve-data.eml");
    let mut transaction = create_transaction();
    transaction.set_parse_body(true);
    let attachments = collect_attachments(&mut transaction);
    add_lines(&mut transaction, &message);
    transaction.end_data().await.unwrap();

    let body = transaction.body().unwrap();
    k9::assert_equal!(body.children().len(), 6);

    let attachments = attachments.lock();
    k9::assert_equal!(attachments.len(), 5);
    let (_, first) = attachments.values().next().unwrap();
    k9::assert_equal!(first.len(), 3000);
    for (name, (info, data)) in attachments.iter() {
        k9::assert_equal!(info.size, 3000);
        k9::assert_equal!(info.content_type, "application/octet-stream");
        assert!(data == first, "{name} differs from the other attachments");
    }

    assert_eq!(output(&transaction).as_ref(), message.as_slice());
}

#[test_log::test(tokio::test)]
async fn base64_root_part_decodes_exactly() {
    let message = specimen("base64-root-part.eml");
    let mut transaction = create_transaction();
    transaction.set_parse_body(true);
    add_lines(&mut transaction, &message);
    transaction.end_data().await.unwrap();

    let body = transaction.body().unwrap();
    k9::assert_equal!(body.info().encoding, ContentTransferEncoding::Base64);
    k9::assert_equal!(body.body_text().unwrap().len(), 425);
}

#[test_log::test(tokio::test)]
async fn untouched_messages_reassemble_identically() {
    let messages: Vec<Vec<u8>> = vec![
        specimen("varied-fold-lengths-preserve-data.eml"),
        specimen("base64-root-part.eml"),
        b"Content-Type: multipart/mixed; boundary=x\n\npreamble\n--x\n\nhi\n--x--\nepilogue\n"
            .to_vec(),
        b"Content-Type: multipart/mixed; boundary=x\r\n\r\n--x\r\n\r\nno terminator\r\n"
            .to_vec(),
    ];

    for message in messages {
        let mut transaction = create_transaction();
        transaction
            .add_body_filter("", |_: &str, _: &str, _: &[u8]| -> Option<Vec<u8>> { None })
            .unwrap();
        add_lines(&mut transaction, &message);
        transaction.end_data().await.unwrap();
        assert_eq!(output(&transaction).as_ref(), message.as_slice());
    }
}

#[test_log::test(tokio::test)]
async fn filters_chain() {
    let seen = Arc::new(Mutex::new(vec![]));
    let mut transaction = create_transaction();
    transaction
        .add_body_filter("text/plain", |_: &str, _: &str, body: &[u8]| {
            Some(String::from_utf8_lossy(body).to_uppercase().into_bytes())
        })
        .unwrap();
    let recorded = seen.clone();
    transaction
        .add_body_filter("text/*", move |_: &str, _: &str, body: &[u8]| {
            recorded.lock().push(String::from_utf8_lossy(body).to_string());
            let mut body = body.to_vec();
            body.extend_from_slice(b"-- \r\nsig\r\n");
            Some(body)
        })
        .unwrap();

    transaction
        .add_data("Content-Type: text/plain\r\n\r\nquiet words\r\n")
        .unwrap();
    transaction.end_data().await.unwrap();

    k9::assert_equal!(seen.lock().clone(), vec!["QUIET WORDS\r\n".to_string()]);
    assert_eq!(
        output(&transaction),
        "Content-Type: text/plain\r\n\r\nQUIET WORDS\r\n-- \r\nsig\r\n"
    );
}

#[test_log::test(tokio::test)]
async fn regex_filters_match_media_type() {
    let seen = Arc::new(Mutex::new(vec![]));
    let recorded = seen.clone();
    let mut transaction = create_transaction();
    transaction
        .add_body_filter_regex(
            regex::Regex::new("^text/(plain|calendar)$").unwrap(),
            move |content_type: &str, _: &str, _: &[u8]| -> Option<Vec<u8>> {
                recorded.lock().push(content_type.to_string());
                None
            },
        )
        .unwrap();

    let message = concat!(
        "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "plain\r\n",
        "--b\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<p>html</p>\r\n",
        "--b\r\n",
        "Content-Type: TEXT/Calendar\r\n",
        "\r\n",
        "BEGIN:VCALENDAR\r\n",
        "--b--\r\n",
    );
    transaction.add_data(message).unwrap();
    transaction.end_data().await.unwrap();

    k9::assert_equal!(
        seen.lock().clone(),
        vec!["text/plain".to_string(), "text/calendar".to_string()]
    );
    assert_eq!(output(&transaction), message);
}

#[test_log::test(tokio::test)]
async fn replaced_base64_part_is_reencoded() {
    let message = concat!(
        "Content-Type: multipart/mixed; boundary=b\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "aGVsbG8gd29ybGQ=\r\n",
        "--b--\r\n",
    );
    let mut transaction = create_transaction();
    transaction
        .add_body_filter("text/plain", |_: &str, _: &str, body: &[u8]| {
            Some(body.repeat(20))
        })
        .unwrap();
    transaction.add_data(message).unwrap();
    transaction.end_data().await.unwrap();

    let out = output(&transaction);
    for line in out.split(|&b| b == b'\n') {
        assert!(line.len() <= 78, "line too long: {line:?}");
    }

    let reparsed = MimePart::parse(out);
    let part = &reparsed.children()[0];
    k9::assert_equal!(part.info().encoding, ContentTransferEncoding::Base64);
    k9::assert_equal!(part.body_text().unwrap(), "hello world".repeat(20));
}

#[test_log::test(tokio::test)]
async fn unrepresentable_text_switches_to_utf8() {
    let mut message = b"Content-Type: text/plain; charset=iso-8859-2\r\n\r\n".to_vec();
    message.extend_from_slice(CZECH_PANGRAM);
    message.extend_from_slice(b"\r\n");

    let mut transaction = create_transaction();
    transaction
        .add_body_filter("text/plain", |_: &str, _: &str, body: &[u8]| {
            let mut body = body.to_vec();
            body.extend_from_slice("\u{2603}\r\n".as_bytes());
            Some(body)
        })
        .unwrap();
    transaction.add_data(&message).unwrap();
    transaction.end_data().await.unwrap();

    let reparsed = MimePart::parse(output(&transaction));
    let info = reparsed.info();
    k9::assert_equal!(info.charset.as_deref(), Some("utf-8"));
    k9::assert_equal!(info.encoding, ContentTransferEncoding::QuotedPrintable);
    let text = reparsed.body_text().unwrap();
    assert!(text.starts_with("P\u{159}\u{ed}li\u{161}"));
    assert!(text.trim_end().ends_with('\u{2603}'));
}

#[test_log::test(tokio::test)]
async fn filters_without_parse_body_see_declared_charset() {
    let mut message = b"Content-Type: text/plain; charset=iso-8859-2\r\n\r\n".to_vec();
    message.extend_from_slice(CZECH_PANGRAM);
    message.extend_from_slice(b"\r\n");

    let seen = Arc::new(Mutex::new(vec![]));
    let recorded = seen.clone();
    let mut transaction = create_transaction();
    transaction
        .add_body_filter(
            "text/plain",
            move |_: &str, charset: &str, body: &[u8]| -> Option<Vec<u8>> {
                recorded.lock().push((charset.to_string(), body.to_vec()));
                None
            },
        )
        .unwrap();
    transaction.set_parse_body(false);
    transaction.add_data(&message).unwrap();
    transaction.end_data().await.unwrap();

    let seen = seen.lock();
    k9::assert_equal!(seen.len(), 1);
    k9::assert_equal!(seen[0].0, "iso-8859-2");
    assert!(seen[0].1.starts_with(CZECH_PANGRAM));
    assert_eq!(output(&transaction).as_ref(), message.as_slice());
}

#[test_log::test(tokio::test)]
async fn end_data_waits_for_attachment_consumers() {
    let message = concat!(
        "Content-Type: multipart/mixed; boundary=b\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: image/gif\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "R0lGODlhAQABAAAAACw=\r\n",
        "--b\r\n",
        "Content-Type: application/zip; name=\"a.zip\"\r\n",
        "\r\n",
        "PK\x03\x04\r\n",
        "--b--\r\n",
    );

    let results: Arc<Mutex<BTreeMap<String, usize>>> = Default::default();
    let collected = results.clone();
    let mut transaction = Transaction::with_config(TransactionConfig {
        attachment_chunk_size: 2,
        ..Default::default()
    });
    transaction
        .attachment_hooks(move |info: AttachmentInfo, mut stream: AttachmentStream| {
            let collected = collected.clone();
            tokio::spawn(async move {
                let mut size = 0;
                let mut chunks = 0;
                while let Some(event) = stream.next().await {
                    match event {
                        StreamEvent::Data(data) => {
                            chunks += 1;
                            size += data.len();
                            tokio::task::yield_now().await;
                        }
                        StreamEvent::End => {
                            assert_eq!(chunks, size.div_ceil(2).max(1));
                            collected.lock().insert(info.part.id_string(), size);
                        }
                    }
                }
            });
        })
        .unwrap();
    transaction.add_data(message).unwrap();
    transaction.end_data().await.unwrap();

    let results = results.lock();
    k9::assert_equal!(results.get("0").copied(), Some(14));
    k9::assert_equal!(results.get("1").copied(), Some(6));
}

#[test_log::test(tokio::test)]
async fn dot_stuffed_data() {
    let mut transaction = Transaction::with_config(TransactionConfig {
        dot_stuffed: true,
        ..Default::default()
    });
    for chunk in [
        "Subject: dots\r\n\r\n..leading\r",
        "\n.",
        ".\r\nmiddle\r\n.",
        "\r\n",
        "trailing garbage\r\n",
    ] {
        transaction.add_data(chunk).unwrap();
    }
    transaction.end_data().await.unwrap();
    assert_eq!(
        output(&transaction),
        "Subject: dots\r\n\r\n.leading\r\n.\r\nmiddle\r\n"
    );
    k9::assert_equal!(transaction.data_lines(), 5);
}

#[test_log::test(tokio::test)]
async fn usage_errors() {
    let mut transaction = create_transaction();
    transaction
        .attachment_hooks(|_: AttachmentInfo, _: AttachmentStream| {})
        .unwrap();
    assert!(matches!(
        transaction.attachment_hooks(|_: AttachmentInfo, _: AttachmentStream| {}),
        Err(TransactionError::DuplicateAttachmentHook)
    ));

    transaction.add_data("Subject: hi\r\n\r\nbody\r\n").unwrap();
    transaction.end_data().await.unwrap();

    assert!(matches!(
        transaction.add_data("more"),
        Err(TransactionError::DataAfterEnd)
    ));
    assert!(matches!(
        transaction.end_data().await,
        Err(TransactionError::AlreadyEnded)
    ));
    assert!(matches!(
        transaction.set_banner("late", None),
        Err(TransactionError::RegistrationAfterEnd(_))
    ));
    assert!(matches!(
        transaction.add_body_filter("", |_: &str, _: &str, _: &[u8]| -> Option<Vec<u8>> {
            None
        }),
        Err(TransactionError::RegistrationAfterEnd(_))
    ));
    k9::assert_equal!(
        TransactionError::DataAfterEnd.to_string(),
        "add_data called after end_data"
    );
}
