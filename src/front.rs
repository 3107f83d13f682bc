//! Line-oriented demo service served over tunnel connections.
//!
//! One request per line, one reply per line:
//! `PING`, `ECHO <text>`, `CALLBACK <uri>` and `QUIT`. `CALLBACK` makes the
//! serving side open a connection of its own to `<uri>` and relay the
//! answer to a `PING`, which exercises the direction the tunnel exists for.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::tunnel::Protocol;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command<'a> {
    Ping,
    Echo(&'a str),
    Callback(&'a str),
    Quit,
    Unknown,
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    match verb.to_ascii_uppercase().as_str() {
        "PING" => Command::Ping,
        "ECHO" => Command::Echo(rest),
        "CALLBACK" if !rest.trim().is_empty() => Command::Callback(rest.trim()),
        "QUIT" => Command::Quit,
        _ => Command::Unknown,
    }
}

/// Serves one session until `QUIT` or EOF.
pub async fn serve<S>(stream: S, protocol: &Protocol) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut st = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if st.read_line(&mut line).await.context("front: read request")? == 0 {
            return Ok(());
        }

        let reply = match parse_command(&line) {
            Command::Ping => "PONG".to_string(),
            Command::Echo(text) => text.to_string(),
            Command::Callback(uri) => match call(protocol, uri, "PING").await {
                Ok(answer) => format!("OK {answer}"),
                Err(err) => {
                    tracing::debug!(uri, err = %err, "front: callback failed");
                    format!("ERR {err:#}")
                }
            },
            Command::Quit => return Ok(()),
            Command::Unknown => "ERR unknown command".to_string(),
        };

        let out = st.get_mut();
        out.write_all(reply.as_bytes()).await.context("front: write reply")?;
        out.write_all(b"\n").await.context("front: write reply")?;
        out.flush().await.context("front: write reply")?;
    }
}

/// Opens a connection to `uri`, sends one request line and returns the reply.
pub async fn call(protocol: &Protocol, uri: &str, request: &str) -> anyhow::Result<String> {
    let st = protocol.open(uri).await?;
    let mut st = BufReader::new(st);
    st.get_mut()
        .write_all(format!("{request}\nQUIT\n").as_bytes())
        .await?;
    st.get_mut().flush().await?;

    let mut reply = String::new();
    if st.read_line(&mut reply).await? == 0 {
        anyhow::bail!("front: {uri} closed without replying");
    }
    Ok(reply.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::tunnel::{ProtocolOptions, Role};

    async fn session(input: &str, protocol: Protocol) -> String {
        let (ours, mut theirs): (DuplexStream, DuplexStream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { serve(ours, &protocol).await });
        theirs.write_all(input.as_bytes()).await.unwrap();
        theirs.shutdown().await.unwrap();
        let mut out = String::new();
        theirs.read_to_string(&mut out).await.unwrap();
        task.await.unwrap().unwrap();
        out
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("ping\r\n"), Command::Ping);
        assert_eq!(parse_command("ECHO a b\n"), Command::Echo("a b"));
        assert_eq!(
            parse_command("CALLBACK drbfire://h:1?2\n"),
            Command::Callback("drbfire://h:1?2")
        );
        assert_eq!(parse_command("CALLBACK\n"), Command::Unknown);
        assert_eq!(parse_command("quit"), Command::Quit);
        assert_eq!(parse_command("HELLO"), Command::Unknown);
    }

    #[tokio::test]
    async fn ping_echo_and_unknown() {
        let out = session("PING\nECHO hi there\nNOPE\n", Protocol::new(ProtocolOptions::default())).await;
        assert_eq!(out, "PONG\nhi there\nERR unknown command\n");
    }

    #[tokio::test]
    async fn quit_ends_the_session_early() {
        let out = session("PING\nQUIT\nPING\n", Protocol::new(ProtocolOptions::default())).await;
        assert_eq!(out, "PONG\n");
    }

    #[tokio::test]
    async fn callback_reports_errors() {
        let out = session(
            "CALLBACK drbfire://127.0.0.1:1?1\n",
            Protocol::new(ProtocolOptions::default()),
        )
        .await;
        assert!(out.starts_with("ERR "), "got {out:?}");
        assert!(out.contains("missing role"), "got {out:?}");
    }

    #[tokio::test]
    async fn callback_reaches_the_inside_peer() {
        let outside = Arc::new(Protocol::new(ProtocolOptions {
            role: Some(Role::Server),
            ..Default::default()
        }));
        let inside = Arc::new(Protocol::new(ProtocolOptions {
            role: Some(Role::Client),
            ..Default::default()
        }));

        let server = Arc::new(outside.open_server("drbfire://127.0.0.1:0").await.unwrap());
        let vs = Arc::new(inside.open_server(&server.uri()).await.unwrap());

        {
            let (server, outside) = (server.clone(), outside.clone());
            tokio::spawn(async move {
                while let Ok(st) = server.accept().await {
                    let _ = serve(st, &outside).await;
                }
            });
        }
        {
            let (vs, inside) = (vs.clone(), inside.clone());
            tokio::spawn(async move {
                while let Ok(st) = vs.accept().await {
                    let _ = serve(st, &inside).await;
                }
            });
        }

        let reply = call(&inside, &vs.uri(), &format!("CALLBACK {}", vs.uri()))
            .await
            .unwrap();
        assert_eq!(reply, "OK PONG");

        vs.close().await;
        server.close().await;
    }
}
