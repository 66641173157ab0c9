// tests/integration/mock_nsqd.rs

//! A scripted in-process nsqd speaking enough of protocol v2 for the
//! integration suite: it validates the magic, answers IDENTIFY/SUB/PUB
//! families, records every command it sees, and can push MESSAGE frames,
//! heartbeats, or drop its connections on demand.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub verb: String,
    pub args: Vec<String>,
    /// Length-prefixed bodies: one for IDENTIFY/PUB/DPUB/AUTH, one per
    /// message for MPUB.
    pub bodies: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub msg_timeout_ms: u64,
    pub max_msg_timeout_ms: u64,
    /// Answer every DPUB with `E_INVALID`.
    pub reject_dpub: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior {
            msg_timeout_ms: 60_000,
            max_msg_timeout_ms: 900_000,
            reject_dpub: false,
        }
    }
}

enum ServerOp {
    Write(Bytes),
    Drop,
}

pub struct MockNsqd {
    addr: SocketAddr,
    commands: mpsc::UnboundedReceiver<RecordedCommand>,
    conns: Arc<Mutex<Vec<mpsc::UnboundedSender<ServerOp>>>>,
}

impl MockNsqd {
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let conns: Arc<Mutex<Vec<mpsc::UnboundedSender<ServerOp>>>> = Arc::default();

        let accept_conns = Arc::clone(&conns);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (ops_tx, ops_rx) = mpsc::unbounded_channel();
                accept_conns.lock().unwrap().push(ops_tx.clone());
                tokio::spawn(serve_connection(
                    stream,
                    behavior.clone(),
                    commands_tx.clone(),
                    ops_tx,
                    ops_rx,
                ));
            }
        });

        MockNsqd {
            addr,
            commands: commands_rx,
            conns,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn nsqd_address(&self) -> nsq_client::NsqdAddress {
        nsq_client::NsqdAddress::new("127.0.0.1", self.addr.port())
    }

    /// The next recorded command, in arrival order across all connections.
    pub async fn next_command(&mut self) -> RecordedCommand {
        tokio::time::timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("mock nsqd stopped")
    }

    /// Skips ahead to the next command with the given verb.
    pub async fn next_command_of(&mut self, verb: &str) -> RecordedCommand {
        loop {
            let command = self.next_command().await;
            if command.verb == verb {
                return command;
            }
        }
    }

    /// Pushes a MESSAGE frame on the most recent connection.
    pub fn send_message(&self, id: &[u8; 16], attempts: u16, body: &[u8]) {
        self.send_to_latest(ServerOp::Write(message_frame(id, attempts, body)));
    }

    pub fn send_heartbeat(&self) {
        self.send_to_latest(ServerOp::Write(response_frame(b"_heartbeat_")));
    }

    /// Severs every live connection, as a crashed broker would.
    pub fn drop_connections(&self) {
        for conn in self.conns.lock().unwrap().drain(..) {
            let _ = conn.send(ServerOp::Drop);
        }
    }

    fn send_to_latest(&self, op: ServerOp) {
        if let Some(conn) = self.conns.lock().unwrap().last() {
            let _ = conn.send(op);
        }
    }
}

pub fn response_frame(body: &[u8]) -> Bytes {
    frame(0, body)
}

pub fn error_frame(body: &[u8]) -> Bytes {
    frame(1, body)
}

pub fn message_frame(id: &[u8; 16], attempts: u16, body: &[u8]) -> Bytes {
    let timestamp_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let mut payload = BytesMut::new();
    payload.put_u64(timestamp_ns);
    payload.put_u16(attempts);
    payload.put_slice(id);
    payload.put_slice(body);
    frame(2, &payload)
}

fn frame(frame_type: u32, body: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u32((4 + body.len()) as u32);
    out.put_u32(frame_type);
    out.put_slice(body);
    out.freeze()
}

async fn serve_connection(
    stream: TcpStream,
    behavior: MockBehavior,
    commands: mpsc::UnboundedSender<RecordedCommand>,
    ops_tx: mpsc::UnboundedSender<ServerOp>,
    mut ops_rx: mpsc::UnboundedReceiver<ServerOp>,
) {
    let (mut reader, mut writer) = stream.into_split();

    tokio::spawn(async move {
        while let Some(op) = ops_rx.recv().await {
            match op {
                ServerOp::Write(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                ServerOp::Drop => break,
            }
        }
    });

    let mut buf = BytesMut::with_capacity(4096);
    let mut magic_seen = false;
    loop {
        loop {
            if !magic_seen {
                if buf.len() < 4 {
                    break;
                }
                let magic = buf.split_to(4);
                assert_eq!(&magic[..], b"  V2", "client must lead with the V2 magic");
                magic_seen = true;
            }
            let Some(command) = try_parse_command(&mut buf) else {
                break;
            };
            respond(&command, &behavior, &ops_tx);
            if commands.send(command).is_err() {
                return;
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => {
                // Mirror a real broker: once the client half-closes, shut
                // our write side down too.
                let _ = ops_tx.send(ServerOp::Drop);
                return;
            }
            Ok(_) => {}
        }
    }
}

/// Parses one complete command from the buffer, or returns `None` until
/// more bytes arrive. Nothing is consumed for incomplete commands.
fn try_parse_command(buf: &mut BytesMut) -> Option<RecordedCommand> {
    let newline = buf.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&buf[..newline]).to_string();
    let line_end = newline + 1;

    let mut parts = line.split(' ');
    let verb = parts.next().unwrap_or("").to_string();
    let args: Vec<String> = parts.map(str::to_string).collect();

    let bodies = match verb.as_str() {
        "IDENTIFY" | "PUB" | "DPUB" | "AUTH" => {
            if buf.len() < line_end + 4 {
                return None;
            }
            let len = read_u32(&buf[line_end..]) as usize;
            if buf.len() < line_end + 4 + len {
                return None;
            }
            let body = buf[line_end + 4..line_end + 4 + len].to_vec();
            buf.advance(line_end + 4 + len);
            vec![body]
        }
        "MPUB" => {
            if buf.len() < line_end + 4 {
                return None;
            }
            let total = read_u32(&buf[line_end..]) as usize;
            if buf.len() < line_end + 4 + total {
                return None;
            }
            let envelope = &buf[line_end + 4..line_end + 4 + total];
            let count = read_u32(envelope) as usize;
            let mut bodies = Vec::with_capacity(count);
            let mut cursor = 4;
            for _ in 0..count {
                let len = read_u32(&envelope[cursor..]) as usize;
                bodies.push(envelope[cursor + 4..cursor + 4 + len].to_vec());
                cursor += 4 + len;
            }
            buf.advance(line_end + 4 + total);
            bodies
        }
        _ => {
            buf.advance(line_end);
            Vec::new()
        }
    };

    Some(RecordedCommand { verb, args, bodies })
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn respond(
    command: &RecordedCommand,
    behavior: &MockBehavior,
    ops_tx: &mpsc::UnboundedSender<ServerOp>,
) {
    let reply = match command.verb.as_str() {
        "IDENTIFY" => {
            let features = json!({
                "msg_timeout": behavior.msg_timeout_ms,
                "max_msg_timeout": behavior.max_msg_timeout_ms,
                "max_rdy_count": 2500,
                "auth_required": false,
                "version": "1.3.0",
            });
            Some(response_frame(features.to_string().as_bytes()))
        }
        "AUTH" => Some(response_frame(br#"{"identity":"test"}"#)),
        "SUB" | "PUB" | "MPUB" => Some(response_frame(b"OK")),
        "DPUB" => {
            if behavior.reject_dpub {
                Some(error_frame(b"E_INVALID DPUB could not parse timeout"))
            } else {
                Some(response_frame(b"OK"))
            }
        }
        "CLS" => Some(response_frame(b"CLOSE_WAIT")),
        // RDY / FIN / REQ / TOUCH / NOP get no reply.
        _ => None,
    };
    if let Some(frame) = reply {
        let _ = ops_tx.send(ServerOp::Write(frame));
    }
}
