//! Scripted in-process SMTP relay for tests.
//!
//! Listens on an ephemeral localhost port, speaks SMTP (plaintext, or
//! implicit TLS with a throwaway certificate from [`TestPki`]) and records
//! every connection, command and accepted message. A [`RelayScript`]
//! switches on the misbehaviour a test needs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_native_tls::{native_tls, TlsAcceptor};
use tracing::debug;

use crate::smtp::state_machine::{Event, State};

const EHLO_REPLY: &str = concat!(
    "250-fake.relay greets you\r\n",
    "250-8BITMIME\r\n",
    "250-AUTH PLAIN LOGIN\r\n",
    "250 SIZE 10485760\r\n"
);

#[derive(Debug, Clone, Default)]
pub struct RelayScript {
    /// Drop every connection before sending the greeting.
    pub hang_up: bool,
    /// Accept connections but never say anything.
    pub silent: bool,
    pub refuse_ehlo: bool,
    /// Close the connection as soon as EHLO arrives.
    pub hang_up_on_ehlo: bool,
    /// Leave AUTH out of the EHLO reply.
    pub no_auth: bool,
    pub reject_auth: bool,
    pub reject_rcpt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    /// Message content with dot-stuffing removed.
    pub data: String,
}

struct Shared {
    connections: AtomicUsize,
    commands: Mutex<Vec<String>>,
    mail_commands: Mutex<Vec<String>>,
    credentials: Mutex<Vec<(String, String)>>,
    messages: Mutex<Vec<Received>>,
    disconnects: watch::Sender<usize>,
}

impl Shared {
    fn record_command(&self, verb: &str) {
        self.commands.lock().unwrap().push(verb.to_owned());
    }

    fn record_disconnect(&self) {
        self.disconnects.send_modify(|count| *count += 1);
    }
}

pub struct FakeRelay {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A throwaway CA and a `localhost` certificate it signed.
pub struct TestPki {
    ca_pem: String,
    cert_pem: String,
    key_pem: String,
}

impl TestPki {
    pub fn generate() -> TestPki {
        let mut ca_params = CertificateParams::new(Vec::<String>::new());
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "fake relay test CA");
        let ca = Certificate::from_params(ca_params).unwrap();

        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_owned()]);
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        let leaf = Certificate::from_params(leaf_params).unwrap();

        TestPki {
            ca_pem: ca.serialize_pem().unwrap(),
            cert_pem: leaf.serialize_pem_with_signer(&ca).unwrap(),
            key_pem: leaf.serialize_private_key_pem(),
        }
    }

    fn acceptor(&self) -> TlsAcceptor {
        let identity = native_tls::Identity::from_pkcs8(
            self.cert_pem.as_bytes(),
            self.key_pem.as_bytes(),
        )
        .unwrap();
        native_tls::TlsAcceptor::new(identity).unwrap().into()
    }

    /// Client side: full verification, trusting only the test CA.
    pub fn connector(&self) -> native_tls::TlsConnector {
        let ca =
            native_tls::Certificate::from_pem(self.ca_pem.as_bytes()).unwrap();
        native_tls::TlsConnector::builder()
            .disable_built_in_roots(true)
            .add_root_certificate(ca)
            .build()
            .unwrap()
    }
}

impl FakeRelay {
    /// Plaintext relay.
    pub async fn start(script: RelayScript) -> FakeRelay {
        FakeRelay::spawn(script, None).await
    }

    /// Relay that expects a TLS handshake before any SMTP, as on port 465.
    pub async fn start_tls(script: RelayScript, pki: &TestPki) -> FakeRelay {
        FakeRelay::spawn(script, Some(pki.acceptor())).await
    }

    async fn spawn(script: RelayScript, tls: Option<TlsAcceptor>) -> FakeRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            connections: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            mail_commands: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            disconnects: watch::channel(0).0,
        });

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let shared = accept_shared.clone();
                let script = script.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(stream) => serve(stream, &script, &shared).await,
                            Err(err) => {
                                debug!(%err, "fake relay TLS handshake failed")
                            }
                        },
                        None => serve(socket, &script, &shared).await,
                    }
                    shared.record_disconnect();
                });
            }
        });

        FakeRelay { addr, shared, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }

    /// Full `MAIL FROM` lines, parameters included.
    pub fn mail_commands(&self) -> Vec<String> {
        self.shared.mail_commands.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> Vec<(String, String)> {
        self.shared.credentials.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<Received> {
        self.shared.messages.lock().unwrap().clone()
    }

    /// Resolves once `count` client connections have ended.
    pub async fn wait_for_disconnects(&self, count: usize) {
        let mut rx = self.shared.disconnects.subscribe();
        rx.wait_for(|seen| *seen >= count).await.unwrap();
    }
}

async fn reply<S>(stream: &mut BufReader<S>, text: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = if text.ends_with("\r\n") {
        text.to_owned()
    } else {
        format!("{}\r\n", text)
    };
    let _ = stream.write_all(text.as_bytes()).await;
    let _ = stream.flush().await;
}

/// Reads one line. `None` once the client is gone or sent garbage.
async fn read_line<S>(stream: &mut BufReader<S>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    match stream.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line),
    }
}

fn decode_plain(args: &str) -> Option<(String, String)> {
    let token = args.split_whitespace().nth(1)?;
    let decoded = String::from_utf8(STANDARD.decode(token).ok()?).ok()?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    Some((parts.next()?.to_owned(), parts.next()?.to_owned()))
}

async fn serve<S>(socket: S, script: &RelayScript, shared: &Shared)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if script.hang_up {
        return;
    }

    let mut stream = BufReader::new(socket);
    if script.silent {
        while read_line(&mut stream).await.is_some() {}
        return;
    }

    reply(&mut stream, "220 fake.relay ESMTP ready").await;

    let mut state = State::Connected;
    let mut mail_from = String::new();
    let mut rcpt_to = Vec::new();

    while let Some(line) = read_line(&mut stream).await {
        let event = Event::parse(&line);
        debug!(verb = event.verb(), ?state, "fake relay received command");
        shared.record_command(event.verb());

        if let Event::Unknown { .. } = event {
            reply(&mut stream, "500 5.5.2 command unrecognized").await;
            continue;
        }

        let Some(next) = state.next(&event) else {
            reply(&mut stream, "503 5.5.1 bad sequence of commands").await;
            continue;
        };

        match &event {
            Event::Hello { extended: true } if script.hang_up_on_ehlo => {
                return;
            }
            Event::Hello { extended: true } if script.refuse_ehlo => {
                reply(&mut stream, "502 5.5.1 EHLO not supported").await;
                continue;
            }
            Event::Hello { extended: true } if script.no_auth => {
                reply(&mut stream, "250-fake.relay greets you\r\n250 8BITMIME")
                    .await;
            }
            Event::Hello { extended: true } => {
                reply(&mut stream, EHLO_REPLY).await;
            }
            Event::Hello { extended: false } => {
                reply(&mut stream, "250 fake.relay").await;
            }
            Event::Auth { .. } if script.reject_auth => {
                reply(&mut stream, "535 5.7.8 authentication credentials invalid")
                    .await;
                continue;
            }
            Event::Auth { args } => {
                if let Some(credentials) = decode_plain(args) {
                    shared.credentials.lock().unwrap().push(credentials);
                }
                reply(&mut stream, "235 2.7.0 authentication successful").await;
            }
            Event::MailFrom { address } => {
                shared
                    .mail_commands
                    .lock()
                    .unwrap()
                    .push(line.trim_end().to_owned());
                mail_from = address.clone();
                rcpt_to.clear();
                reply(&mut stream, "250 2.1.0 sender ok").await;
            }
            Event::RcptTo { .. } if script.reject_rcpt => {
                reply(&mut stream, "550 5.1.1 no such user here").await;
                continue;
            }
            Event::RcptTo { address } => {
                rcpt_to.push(address.clone());
                reply(&mut stream, "250 2.1.5 recipient ok").await;
            }
            Event::Data => {
                reply(&mut stream, "354 end data with <CR><LF>.<CR><LF>").await;
                let mut data = String::new();
                loop {
                    let Some(line) = read_line(&mut stream).await else {
                        return;
                    };
                    if line == ".\r\n" {
                        break;
                    }
                    data.push_str(line.strip_prefix('.').unwrap_or(&line));
                }
                shared.messages.lock().unwrap().push(Received {
                    mail_from: std::mem::take(&mut mail_from),
                    rcpt_to: std::mem::take(&mut rcpt_to),
                    data,
                });
                reply(&mut stream, "250 2.0.0 queued").await;
                state = State::Greeted;
                continue;
            }
            Event::Reset => {
                mail_from.clear();
                rcpt_to.clear();
                reply(&mut stream, "250 2.0.0 reset").await;
            }
            Event::Noop => reply(&mut stream, "250 2.0.0 ok").await,
            Event::Quit => {
                reply(&mut stream, "221 2.0.0 bye").await;
            }
            Event::Unknown { .. } => unreachable!(),
        }

        state = next;
    }
}
