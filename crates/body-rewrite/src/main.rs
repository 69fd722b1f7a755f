use crate::logging::{DiagnosticFormat, LoggingConfig};
use anyhow::Context;
use clap::Parser;
use mail_transaction::{
    AttachmentInfo, AttachmentStream, StreamEvent, Transaction, TransactionConfig,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

mod logging;

/// Rewrite a message the way a mail transaction does: add banners to
/// its text parts, optionally extract its attachments, and write the
/// resulting message to stdout.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// A TOML file holding transaction settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Banner to append to text/plain parts
    #[arg(long)]
    text_banner: Option<String>,

    /// Banner to place into text/html parts. Defaults to the
    /// text banner, escaped
    #[arg(long, requires = "text_banner")]
    html_banner: Option<String>,

    /// Write each attachment into this directory
    #[arg(long)]
    attachments_dir: Option<PathBuf>,

    /// The input is dot stuffed SMTP DATA, ending with a `.` line
    #[arg(long)]
    dot_stuffed: bool,

    /// Pass text to filters in its declared charset rather than
    /// decoding it first
    #[arg(long)]
    no_parse_body: bool,

    /// How to format diagnostic output on stderr
    #[arg(long, value_enum, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// The message to read. Defaults to stdin
    input: Option<PathBuf>,
}

impl Opt {
    fn load_config(&self) -> anyhow::Result<TransactionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str::<TransactionConfig>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => TransactionConfig::default(),
        };
        if self.dot_stuffed {
            config.dot_stuffed = true;
        }
        Ok(config)
    }

    async fn read_input(&self) -> anyhow::Result<Vec<u8>> {
        match &self.input {
            Some(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display())),
            None => {
                let mut data = vec![];
                tokio::io::stdin()
                    .read_to_end(&mut data)
                    .await
                    .context("reading stdin")?;
                Ok(data)
            }
        }
    }
}

/// Reduce an attachment name to a plain file name that cannot
/// escape the output directory
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

struct AttachmentWriter {
    tasks: Arc<Mutex<Vec<JoinHandle<anyhow::Result<PathBuf>>>>>,
}

impl AttachmentWriter {
    async fn install(transaction: &mut Transaction, dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let tasks: Arc<Mutex<Vec<_>>> = Default::default();
        let spawned = tasks.clone();
        let dir = dir.to_path_buf();
        let counter = AtomicUsize::new(0);
        let used = Mutex::new(HashSet::new());

        transaction.attachment_hooks(move |info: AttachmentInfo, stream: AttachmentStream| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut name = info
                .filename
                .as_deref()
                .and_then(sanitize_file_name)
                .unwrap_or_else(|| format!("attachment-{n}.bin"));
            if !used.lock().insert(name.clone()) {
                name = format!("{n}-{name}");
            }
            tracing::info!(
                "attachment {} ({}, {} bytes) -> {name}",
                info.part.id_string(),
                info.content_type,
                info.size
            );
            spawned
                .lock()
                .push(tokio::spawn(write_attachment(dir.join(name), stream)));
        })?;

        Ok(Self { tasks })
    }

    /// Wait for every attachment file to be written
    async fn finish(self) -> anyhow::Result<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let path = task.await??;
            tracing::debug!("wrote {}", path.display());
        }
        Ok(())
    }
}

async fn write_attachment(path: PathBuf, mut stream: AttachmentStream) -> anyhow::Result<PathBuf> {
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Data(data) => file
                .write_all(&data)
                .await
                .with_context(|| format!("writing {}", path.display()))?,
            StreamEvent::End => break,
        }
    }
    file.flush().await?;
    Ok(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    LoggingConfig {
        filter_env_var: "BODY_REWRITE_LOG",
        default_filter: "body_rewrite=info,mail_transaction=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    let config = opts.load_config()?;
    let data = opts.read_input().await?;

    let mut transaction = Transaction::with_config(config);
    if let Some(text) = &opts.text_banner {
        transaction.set_banner(text, opts.html_banner.as_deref())?;
    }
    let writer = match &opts.attachments_dir {
        Some(dir) => Some(AttachmentWriter::install(&mut transaction, dir).await?),
        None => None,
    };
    if opts.no_parse_body {
        transaction.set_parse_body(false);
    }

    for line in data.split_inclusive(|&b| b == b'\n') {
        transaction.add_data(line)?;
    }
    transaction.end_data().await?;

    if let Some(writer) = writer {
        writer.finish().await?;
    }

    let message = transaction
        .message_stream()
        .context("no message was produced")?;
    let mut stdout = std::io::stdout().lock();
    message
        .write_to(&mut stdout)
        .and_then(|()| stdout.flush())
        .context("writing message to stdout")?;

    tracing::info!(
        "read {} bytes in {} lines, wrote {} bytes",
        transaction.data_bytes(),
        transaction.data_lines(),
        message.len()
    );

    Ok(())
}
