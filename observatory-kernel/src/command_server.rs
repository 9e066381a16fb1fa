/**
 * COMMAND SERVER - Line-oriented TCP front end for operators
 *
 * ROLE:
 * Accepts persistent TCP connections; each input line is one command and
 * gets exactly one reply line, `OK <text>` or `ERROR <text>`. Commands are
 * split like a shell command line and handed to the `CommandRegistry`.
 *
 * OPERATION:
 * - Bad input (parse error, unknown command, wrong arity) answers with an
 *   `ERROR` line and keeps the connection open
 * - Every command is bounded by `reply_timeout_s`
 * - `quit` closes the current connection
 * - `killserver` closes the listener; open connections finish their line
 *   and are closed
 */

use crate::dispatch::{CommandError, CommandRegistry};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of handling one input line.
#[derive(Debug, PartialEq)]
pub enum LineAction {
    Reply(String),
    /// Blank line: nothing to answer.
    Skip,
    Close(String),
    KillServer(String),
}

/// Stops the accept loop from outside, e.g. on ctrl-c.
#[derive(Clone)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

pub struct CommandServer {
    registry: Arc<CommandRegistry>,
    reply_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

fn one_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

pub fn ok_line(text: &str) -> String {
    if text.is_empty() {
        "OK".to_string()
    } else {
        format!("OK {}", one_line(text))
    }
}

pub fn error_line(text: &str) -> String {
    format!("ERROR {}", one_line(text))
}

impl CommandServer {
    pub fn new(registry: CommandRegistry, reply_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { registry: Arc::new(registry), reply_timeout, shutdown }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Interprets one raw line.
    pub async fn handle_line(&self, line: &str) -> LineAction {
        let line = line.trim();
        if line.is_empty() {
            return LineAction::Skip;
        }
        let args = match shell_words::split(line) {
            Ok(args) => args,
            Err(e) => return LineAction::Reply(error_line(&format!("parse error: {e}"))),
        };
        match args.first().map(|a| a.to_ascii_lowercase()).as_deref() {
            Some("quit") => return LineAction::Close(ok_line("bye")),
            Some("killserver") => return LineAction::KillServer(ok_line("server shutting down")),
            _ => {}
        }

        let name = args[0].clone();
        match tokio::time::timeout(self.reply_timeout, self.registry.dispatch(args)).await {
            Ok(Ok(text)) => LineAction::Reply(ok_line(&text)),
            Ok(Err(CommandError::Unknown(cmd))) => {
                LineAction::Reply(error_line(&format!("unknown command {cmd:?}, try help")))
            }
            Ok(Err(e)) => LineAction::Reply(error_line(&e.to_string())),
            Err(_) => LineAction::Reply(error_line(&format!(
                "{name} timed out after {:.1}s",
                self.reply_timeout.as_secs_f64()
            ))),
        }
    }

    pub async fn bind(addr: &str) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    /// Accept loop. Returns once `killserver` or the shutdown handle fires.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let server = Arc::new(self);
        let mut stop = server.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!("[command] listening on {addr}");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("[command] accept failed: {e}");
                            continue;
                        }
                    };
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            debug!("[command] {peer}: {e}");
                        }
                    });
                }
                _ = stop.changed() => break,
            }
        }
        info!("[command] listener closed");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        debug!("[command] {peer} connected");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut stop = self.shutdown.subscribe();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = stop.changed() => break,
            };
            let Some(line) = line else { break };
            match self.handle_line(&line).await {
                LineAction::Skip => {}
                LineAction::Reply(reply) => write_line(&mut write_half, &reply).await?,
                LineAction::Close(reply) => {
                    write_line(&mut write_half, &reply).await?;
                    break;
                }
                LineAction::KillServer(reply) => {
                    info!("[command] killserver from {peer}");
                    write_line(&mut write_half, &reply).await?;
                    let _ = self.shutdown.send(true);
                    break;
                }
            }
        }
        debug!("[command] {peer} disconnected");
        write_half.shutdown().await
    }
}

async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> io::Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CommandRegistry {
        let mut reg = CommandRegistry::new();
        reg.register("echo", "echo <word>...", "repeat", (1, None), |args| async move { Ok(args.join("|")) })
            .unwrap();
        reg.register("multi", "multi", "two lines", (0, Some(0)), |_| async move { Ok("a\nb".to_string()) })
            .unwrap();
        reg.register("slow", "slow", "never answers in time", (0, Some(0)), |_| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        })
        .unwrap();
        reg
    }

    #[tokio::test]
    async fn lines_map_to_replies() {
        let server = CommandServer::new(registry(), Duration::from_millis(200));
        assert_eq!(server.handle_line("echo a 'b c'").await, LineAction::Reply("OK a|b c".into()));
        assert_eq!(server.handle_line("multi").await, LineAction::Reply("OK a b".into()));
        assert_eq!(server.handle_line("   ").await, LineAction::Skip);
        assert_eq!(server.handle_line("QUIT").await, LineAction::Close("OK bye".into()));
        assert!(matches!(server.handle_line("killserver").await, LineAction::KillServer(_)));
    }

    #[tokio::test]
    async fn errors_are_single_lines() {
        let server = CommandServer::new(registry(), Duration::from_millis(200));
        let LineAction::Reply(r) = server.handle_line("bogus").await else { panic!() };
        assert!(r.starts_with("ERROR unknown command"));
        let LineAction::Reply(r) = server.handle_line("echo 'unterminated").await else { panic!() };
        assert!(r.starts_with("ERROR parse error"));
        let LineAction::Reply(r) = server.handle_line("echo").await else { panic!() };
        assert_eq!(r, "ERROR usage: echo <word>...");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_commands_time_out() {
        let server = CommandServer::new(registry(), Duration::from_secs(2));
        let LineAction::Reply(r) = server.handle_line("slow").await else { panic!() };
        assert_eq!(r, "ERROR slow timed out after 2.0s");
    }

    #[tokio::test]
    async fn serves_over_tcp_until_killserver() {
        let listener = CommandServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CommandServer::new(registry(), Duration::from_secs(1));
        let serving = tokio::spawn(server.serve(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut lines = BufReader::new(r).lines();

        write_line(&mut w, "nope").await.unwrap();
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("ERROR"));
        // The connection survives the error.
        write_line(&mut w, "echo hi").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "OK hi");

        write_line(&mut w, "killserver").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "OK server shutting down");
        assert_eq!(lines.next_line().await.unwrap(), None);

        tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn quit_closes_only_that_connection() {
        let listener = CommandServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CommandServer::new(registry(), Duration::from_secs(1));
        let handle = server.shutdown_handle();
        let serving = tokio::spawn(server.serve(listener));

        let a = TcpStream::connect(addr).await.unwrap();
        let (ar, mut aw) = a.into_split();
        let mut a_lines = BufReader::new(ar).lines();
        write_line(&mut aw, "quit").await.unwrap();
        assert_eq!(a_lines.next_line().await.unwrap().unwrap(), "OK bye");
        assert_eq!(a_lines.next_line().await.unwrap(), None);

        let b = TcpStream::connect(addr).await.unwrap();
        let (br, mut bw) = b.into_split();
        let mut b_lines = BufReader::new(br).lines();
        write_line(&mut bw, "echo still here").await.unwrap();
        assert_eq!(b_lines.next_line().await.unwrap().unwrap(), "OK still|here");

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
    }
}
