use crate::config_store::ConfigStore;
use crate::interceptor::MessageInterceptor;
use crate::mime::{MessageChanges, MimeMessage};
use indymilter::{run, Actions, Callbacks, Config as IndyConfig, ContextActions, EomContext, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, UnixListener};

/// Largest body chunk a single milter replace-body reply may carry.
const MAX_BODY_CHUNK: usize = 65535;

/// One SMTP transaction as seen by the milter: envelope sender, headers in
/// arrival order, and the body.
#[derive(Debug, Default)]
pub struct Transaction {
    sender: String,
    headers: Vec<u8>,
    body: Vec<u8>,
}

impl Transaction {
    pub fn new(sender: &str) -> Self {
        Self {
            sender: sender.to_string(),
            ..Default::default()
        }
    }

    pub fn push_header(&mut self, name: &str, value: &str) {
        self.headers
            .extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    pub fn push_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    fn into_raw(self) -> (String, Vec<u8>) {
        let mut raw = self.headers;
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.body);
        (self.sender, raw)
    }
}

/// Run one transaction through the interceptor. `None` when the message is
/// left as it was.
pub fn evaluate(interceptor: &MessageInterceptor, transaction: Transaction) -> Option<MessageChanges> {
    let (sender, raw) = transaction.into_raw();

    let mut message = match MimeMessage::parse(raw, &sender) {
        Ok(message) => message,
        Err(e) => {
            log::error!("Skipping message from {sender}: {e}");
            return None;
        }
    };

    let started = Instant::now();
    let disposition = interceptor.process(&mut message, || {
        log::debug!("Evaluated message from {sender} in {:?}", started.elapsed())
    });

    if !disposition.is_modified() {
        return None;
    }
    Some(message.into_changes())
}

/// One modification request sent back to the MTA at end-of-message.
#[derive(Debug, PartialEq, Eq)]
enum EomAction {
    ChangeHeader { name: String, index: i32, value: String },
    ReplaceBody(Vec<u8>),
}

/// Header changes first, then the body split into protocol-sized chunks.
fn plan_actions(changes: MessageChanges) -> anyhow::Result<Vec<EomAction>> {
    let mut actions = Vec::with_capacity(changes.headers.len() + 1);

    for change in changes.headers {
        let index = i32::try_from(change.index)
            .map_err(|_| anyhow::anyhow!("header index {} out of range", change.index))?;
        actions.push(EomAction::ChangeHeader {
            name: change.name,
            index,
            value: change.value,
        });
    }

    if let Some(body) = changes.body {
        actions.extend(
            body.chunks(MAX_BODY_CHUNK)
                .map(|chunk| EomAction::ReplaceBody(chunk.to_vec())),
        );
    }

    Ok(actions)
}

async fn apply_changes(ctx: &EomContext<Transaction>, changes: MessageChanges) -> anyhow::Result<()> {
    for action in plan_actions(changes)? {
        match action {
            EomAction::ChangeHeader { name, index, value } => ctx
                .actions
                .change_header(name.clone(), index, Some(value))
                .await
                .map_err(|e| anyhow::anyhow!("failed to change header {name}: {e}"))?,
            EomAction::ReplaceBody(chunk) => ctx
                .actions
                .replace_body(&chunk)
                .await
                .map_err(|e| anyhow::anyhow!("failed to replace body: {e}"))?,
        }
    }

    Ok(())
}

enum ListenAddress {
    Unix(String),
    Inet(SocketAddr),
}

fn parse_socket(spec: &str) -> anyhow::Result<ListenAddress> {
    if let Some(addr) = spec.strip_prefix("inet:") {
        return Ok(ListenAddress::Inet(addr.parse().map_err(|e| {
            anyhow::anyhow!("invalid inet socket '{addr}': {e}")
        })?));
    }
    let path = spec.strip_prefix("unix:").unwrap_or(spec);
    if path.is_empty() {
        anyhow::bail!("empty socket path");
    }
    Ok(ListenAddress::Unix(path.to_string()))
}

pub struct Milter {
    interceptor: Arc<MessageInterceptor>,
}

impl Milter {
    pub fn new(interceptor: Arc<MessageInterceptor>) -> Self {
        Milter { interceptor }
    }

    fn callbacks(&self) -> Callbacks<Transaction> {
        let interceptor = self.interceptor.clone();

        Callbacks {
            mail: Some(Box::new(
                move |ctx: &mut indymilter::Context<Transaction>, args| {
                    Box::pin(async move {
                        let sender = args
                            .first()
                            .map(|s| s.to_string_lossy().to_string())
                            .unwrap_or_default();
                        log::debug!("Mail from: {}", sender);
                        ctx.data = Some(Transaction::new(&sender));
                        Status::Continue
                    })
                },
            )),

            header: Some(Box::new(
                move |ctx: &mut indymilter::Context<Transaction>, name, value| {
                    Box::pin(async move {
                        if let Some(transaction) = ctx.data.as_mut() {
                            transaction
                                .push_header(&name.to_string_lossy(), &value.to_string_lossy());
                        }
                        Status::Continue
                    })
                },
            )),

            body: Some(Box::new(
                move |ctx: &mut indymilter::Context<Transaction>, body_chunk| {
                    Box::pin(async move {
                        if let Some(transaction) = ctx.data.as_mut() {
                            transaction.push_body(&body_chunk);
                        }
                        Status::Continue
                    })
                },
            )),

            eom: Some(Box::new(move |ctx: &mut EomContext<Transaction>| {
                let interceptor = interceptor.clone();
                Box::pin(async move {
                    let Some(transaction) = ctx.data.take() else {
                        return Status::Accept;
                    };

                    if let Some(changes) = evaluate(&interceptor, transaction) {
                        if let Err(e) = apply_changes(ctx, changes).await {
                            log::error!("Failed to apply message changes: {e}");
                        }
                    }
                    Status::Accept
                })
            })),

            abort: Some(Box::new(
                move |ctx: &mut indymilter::Context<Transaction>| {
                    Box::pin(async move {
                        ctx.data = None;
                        Status::Continue
                    })
                },
            )),

            ..Default::default()
        }
    }

    pub async fn run(&self, socket: &str) -> anyhow::Result<()> {
        let config = IndyConfig {
            actions: Actions::CHANGE_HEADER | Actions::REPLACE_BODY,
            ..Default::default()
        };

        match parse_socket(socket)? {
            ListenAddress::Inet(addr) => {
                log::info!("Starting milter on: inet:{}", addr);
                let listener = TcpListener::bind(addr).await?;
                run(listener, self.callbacks(), config, tokio::signal::ctrl_c()).await?;
            }
            ListenAddress::Unix(path) => {
                log::info!("Starting milter on: {}", path);
                // Remove a stale socket left by a previous run
                if std::path::Path::new(&path).exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = UnixListener::bind(&path)?;
                run(listener, self.callbacks(), config, tokio::signal::ctrl_c()).await?;
            }
        }
        Ok(())
    }
}

/// Reload the mapping whenever the process receives SIGHUP.
#[cfg(unix)]
pub fn reload_on_hangup(store: Arc<ConfigStore>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            log::info!("SIGHUP received, reloading mapping");
            let store = store.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || store.reload()).await {
                log::error!("Mapping reload task failed: {e}");
            }
        }
    });
    Ok(())
}
