use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    let mut server = Spawned::start(&binary, &["server", "--listen", "127.0.0.1:0"], "info")?;
    let addr = server.listening_addr().await?;

    // Keep reading relay logs so the pipe never fills.
    let Spawned {
        child: mut server_child,
        stdout: server_stdout,
        ..
    } = server;
    let server_log_task = tokio::spawn(async move {
        let mut lines = server_stdout.lines();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let mut alice = spawn_client(&binary, "alice", &addr).await?;
    let mut bob = spawn_client(&binary, "bob", &addr).await?;

    // Broadcasts reach everyone but the sender.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    let bob_hears_alice = bob.expect_line("waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "alice: Hello from Alice");

    bob.send_line(":PRIVATE alice Hi Alice!")
        .await
        .context("bob send private")?;
    let alice_hears_bob = alice.expect_line("waiting for alice to hear bob").await?;
    assert_eq!(alice_hears_bob, "bob (private): Hi Alice!");

    bob.send_line(":PRIVATE carol anyone there?")
        .await
        .context("bob send private to nobody")?;
    let not_found = bob.expect_line("waiting for lookup failure").await?;
    assert_eq!(not_found, "*** recipient 'carol' not found");

    alice.send_line(":EXIT").await.context("alice send exit")?;
    let alice_quit = alice.expect_line("waiting for alice exit confirmation").await?;
    assert_eq!(alice_quit, "*** leaving chat");

    bob.send_line(":exit").await.context("bob send exit")?;
    let bob_quit = bob.expect_line("waiting for bob exit confirmation").await?;
    assert_eq!(bob_quit, "*** leaving chat");

    alice.exited_cleanly("alice client").await?;
    bob.exited_cleanly("bob client").await?;

    // The relay stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

/// A `chat-relay` process with piped stdio.
struct Spawned {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Spawned {
    fn start(binary: &Path, args: &[&str], log_level: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(args)
            .env("RUST_LOG", log_level)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn chat-relay {args:?}"))?;

        let stdin = child.stdin.take().context("stdin missing after spawn")?;
        let stdout = child.stdout.take().context("stdout missing after spawn")?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Reads the `relay listening on <addr>` log line.
    async fn listening_addr(&mut self) -> Result<String> {
        let banner = self.expect_line("waiting for listening address").await?;
        let addr = banner
            .split_whitespace()
            .last()
            .filter(|token| token.contains(':'))
            .ok_or_else(|| anyhow!("server banner missing socket: {banner}"))?;
        Ok(addr.to_string())
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect_line(&mut self, description: &str) -> Result<String> {
        let mut line = String::new();
        let read = timeout(READ_TIMEOUT, self.stdout.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("{description}: timed out"))?
            .with_context(|| format!("{description}: failed to read line"))?;
        if read == 0 {
            return Err(anyhow!("{description}: stream closed"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Closes stdin, since tokio's blocking stdin reader only returns on EOF.
    async fn exited_cleanly(self, name: &str) -> Result<()> {
        let Spawned {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to await {name} process"))?;
        if !status.success() {
            return Err(anyhow!("{name} exited with status {status}"));
        }
        Ok(())
    }
}

async fn spawn_client(binary: &Path, username: &str, addr: &str) -> Result<Spawned> {
    let mut client = Spawned::start(
        binary,
        &["client", "--username", username, "--server", addr],
        "warn",
    )?;

    for expected in [
        "*** commands: :EXIT quits, :HELP prints usage".to_string(),
        "*** Welcome to the chat!".to_string(),
        format!("*** your username is {username}"),
    ] {
        let line = client.expect_line("waiting for join banner").await?;
        if line != expected {
            return Err(anyhow!("expected '{expected}' for {username}, got '{line}'"));
        }
    }

    Ok(client)
}
