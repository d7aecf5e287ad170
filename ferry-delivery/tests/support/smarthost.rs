//! A scripted smarthost for transport tests.
//!
//! Every connection gets the same script: a greeting, an EHLO capability
//! list, and one reply per verb. What the client sent is kept in a
//! [`Transcript`], with message content recorded after dot-unstuffing so it
//! can be compared with the bytes the transport was asked to send.
#![allow(dead_code)] // Not every test uses every knob

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Mail,
    Rcpt,
    Data,
    /// The reply after the terminating `.`
    EndOfData,
    StartTls,
    Quit,
}

/// One thing the client did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Content(Vec<u8>),
    StartTls,
    Quit,
    Unknown(String),
}

/// How the server misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Close the connection instead of answering command N (0-indexed)
    HangUpAt(usize),
    /// Never answer command N (0-indexed)
    StallAt(usize),
}

#[derive(Debug, Clone)]
struct Script {
    greeting: (u16, String),
    capabilities: Vec<String>,
    replies: HashMap<Verb, (u16, String)>,
    fault: Option<Fault>,
}

impl Default for Script {
    fn default() -> Self {
        let replies = [
            (Verb::Mail, (250, "2.1.0 Sender ok")),
            (Verb::Rcpt, (250, "2.1.5 Recipient ok")),
            (Verb::Data, (354, "Go ahead")),
            (Verb::EndOfData, (250, "2.0.0 Ok: queued as SH-0001")),
            (Verb::StartTls, (502, "5.5.1 Not implemented")),
            (Verb::Quit, (221, "2.0.0 Closing")),
        ]
        .into_iter()
        .map(|(verb, (code, text))| (verb, (code, text.to_string())))
        .collect();

        Self {
            greeting: (220, "smarthost.test ESMTP".to_string()),
            capabilities: vec!["smarthost.test".to_string(), "SIZE 100000".to_string()],
            replies,
            fault: None,
        }
    }
}

impl Script {
    fn reply(&self, verb: Verb) -> (u16, &str) {
        self.replies
            .get(&verb)
            .map_or((500, "5.5.2 Unscripted"), |(code, text)| (*code, text.as_str()))
    }

    fn ehlo_reply(&self) -> String {
        let last = self.capabilities.len().saturating_sub(1);

        self.capabilities
            .iter()
            .enumerate()
            .map(|(i, line)| format!("250{}{line}\r\n", if i == last { ' ' } else { '-' }))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<Seen>>>);

impl Transcript {
    fn push(&self, seen: Seen) {
        self.0.lock().push(seen);
    }

    pub fn all(&self) -> Vec<Seen> {
        self.0.lock().clone()
    }

    pub fn mail_from(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::MailFrom(argument) => Some(argument),
                _ => None,
            })
            .collect()
    }

    pub fn contents(&self) -> Vec<Vec<u8>> {
        self.all()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Content(content) => Some(content),
                _ => None,
            })
            .collect()
    }
}

/// A running smarthost; stops accepting when dropped
pub struct Smarthost {
    addr: SocketAddr,
    transcript: Transcript,
    connections: Arc<AtomicUsize>,
    acceptor: JoinHandle<()>,
}

impl Drop for Smarthost {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl Smarthost {
    pub fn script() -> SmarthostBuilder {
        SmarthostBuilder::default()
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub const fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct SmarthostBuilder {
    script: Script,
}

impl SmarthostBuilder {
    #[must_use]
    pub fn greeting(mut self, code: u16, text: &str) -> Self {
        self.script.greeting = (code, text.to_string());
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn reply(mut self, verb: Verb, code: u16, text: &str) -> Self {
        self.script.replies.insert(verb, (code, text.to_string()));
        self
    }

    #[must_use]
    pub const fn fault(mut self, fault: Fault) -> Self {
        self.script.fault = Some(fault);
        self
    }

    pub async fn start(self) -> std::io::Result<Smarthost> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let transcript = Transcript::default();
        let connections = Arc::new(AtomicUsize::new(0));

        let acceptor = {
            let transcript = transcript.clone();
            let connections = Arc::clone(&connections);

            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::Relaxed);

                    let script = Arc::clone(&script);
                    let transcript = transcript.clone();
                    tokio::spawn(async move {
                        if let Err(err) = converse(stream, &script, &transcript).await {
                            tracing::debug!("smarthost session ended: {err}");
                        }
                    });
                }
            })
        };

        Ok(Smarthost {
            addr,
            transcript,
            connections,
            acceptor,
        })
    }
}

async fn answer<W: AsyncWrite + Unpin>(writer: &mut W, code: u16, text: &str) -> std::io::Result<()> {
    writer.write_all(format!("{code} {text}\r\n").as_bytes()).await?;
    writer.flush().await
}

async fn converse(
    mut stream: TcpStream,
    script: &Script,
    transcript: &Transcript,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    answer(&mut writer, script.greeting.0, &script.greeting.1).await?;

    let mut line = String::new();
    for index in 0.. {
        match script.fault {
            Some(Fault::HangUpAt(n)) if n == index => return Ok(()),
            Some(Fault::StallAt(n)) if n == index => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }
            _ => {}
        }

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let command = line.trim_end();
        let (verb, argument) = command.split_once(' ').unwrap_or((command, ""));

        match verb.to_ascii_uppercase().as_str() {
            "EHLO" | "HELO" => {
                transcript.push(Seen::Ehlo(argument.to_string()));
                writer.write_all(script.ehlo_reply().as_bytes()).await?;
                writer.flush().await?;
            }
            "MAIL" => {
                transcript.push(Seen::MailFrom(argument.to_string()));
                let (code, text) = script.reply(Verb::Mail);
                answer(&mut writer, code, text).await?;
            }
            "RCPT" => {
                transcript.push(Seen::RcptTo(argument.to_string()));
                let (code, text) = script.reply(Verb::Rcpt);
                answer(&mut writer, code, text).await?;
            }
            "STARTTLS" => {
                transcript.push(Seen::StartTls);
                let (code, text) = script.reply(Verb::StartTls);
                answer(&mut writer, code, text).await?;
            }
            "QUIT" => {
                transcript.push(Seen::Quit);
                let (code, text) = script.reply(Verb::Quit);
                return answer(&mut writer, code, text).await;
            }
            "DATA" => {
                transcript.push(Seen::Data);
                let (code, text) = script.reply(Verb::Data);
                answer(&mut writer, code, text).await?;
                if code != 354 {
                    continue;
                }

                let mut content = Vec::new();
                let mut data_line = Vec::new();
                loop {
                    data_line.clear();
                    if reader.read_until(b'\n', &mut data_line).await? == 0 {
                        return Ok(());
                    }
                    if data_line == b".\r\n" {
                        break;
                    }
                    content.extend_from_slice(data_line.strip_prefix(b".").unwrap_or(&data_line));
                }

                transcript.push(Seen::Content(content));
                let (code, text) = script.reply(Verb::EndOfData);
                answer(&mut writer, code, text).await?;
            }
            _ => {
                transcript.push(Seen::Unknown(command.to_string()));
                answer(&mut writer, 500, "5.5.2 Unrecognised command").await?;
            }
        }
    }

    Ok(())
}
