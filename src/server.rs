//! TCP front end for the GDB remote-serial server (§5/§6): a single client
//! at a time, `SO_REUSEADDR`/`TCP_NODELAY`, and 1-second read/accept polls
//! so a SIGINT/SIGTERM-driven `running` flag is checked promptly instead of
//! blocking forever in a `read()`.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::coordinator::DebugCoordinator;
use crate::rsp::{self, Event};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepts GDB connections on `port` until `running` is cleared, serving
/// one client at a time.
pub fn run(coordinator: &mut DebugCoordinator, port: u16, running: &Arc<AtomicBool>) -> Result<()> {
    let listener =
        TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("binding GDB server to port {}", port))?;
    listener.set_nonblocking(true).context("setting listener non-blocking")?;
    info!("listening for a GDB connection on port {}", port);

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("GDB connected from {}", addr);
                if let Err(e) = serve_client(coordinator, stream, running) {
                    warn!("GDB session ended with an error: {}", e);
                }
                info!("GDB disconnected");
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_TIMEOUT);
            }
            Err(e) => return Err(e).context("accepting GDB connection"),
        }
    }
    Ok(())
}

fn serve_client(coordinator: &mut DebugCoordinator, stream: TcpStream, running: &Arc<AtomicBool>) -> Result<()> {
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;
    stream.set_read_timeout(Some(POLL_TIMEOUT)).context("setting read timeout")?;
    let mut reader = stream.try_clone().context("cloning client stream")?;
    let mut writer = stream;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    while running.load(Ordering::SeqCst) {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(()), // client closed the connection
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                for event in rsp::extract_events(&mut buf) {
                    if !handle_event(coordinator, &mut writer, event)? {
                        return Ok(());
                    }
                }
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e).context("reading from GDB client"),
        }
    }
    Ok(())
}

/// Handles one extracted RSP event. Returns `Ok(false)` when the client
/// sent `k` and the session should close.
fn handle_event(coordinator: &mut DebugCoordinator, writer: &mut TcpStream, event: Event) -> Result<bool> {
    match event {
        Event::Ack | Event::Nack => Ok(true),
        Event::Interrupt => {
            // `cmd_continue` polls for halt with its own timeout rather than
            // watching the socket mid-flight, so an out-of-band 0x03 arriving
            // during execution is only ever seen once the next read() lands
            // here between packets; nothing to act on but dropping it.
            Ok(true)
        }
        Event::Packet { payload, checksum_ok } => {
            if !checksum_ok {
                writer.write_all(b"-").context("writing nack")?;
                return Ok(true);
            }
            writer.write_all(b"+").context("writing ack")?;
            if DebugCoordinator::is_kill(&payload) {
                return Ok(false);
            }
            let reply = coordinator.handle_packet(&payload);
            writer.write_all(&rsp::encode_packet(&reply)).context("writing reply packet")?;
            writer.flush().context("flushing reply")?;
            Ok(true)
        }
    }
}
