//! Live fan-out of detection results to UDP and serial listeners.
//!
//! Each transport formats one text line per result from a user-declared
//! field template and writes it best-effort: UDP packets may be lost by
//! design, serial writes share the pooled port with the trigger controller
//! under short per-write locks.

use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use event_tracker::WriterGuard;
use pupil_types::PupilFrame;
use tracing::{debug, error, warn};
use trigger_box::SharedConn;

pub type Result<M> = std::result::Result<M, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown stream field {0:?}")]
    UnknownField(String),
    #[error("empty field template")]
    EmptyTemplate,
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

mod template;
pub use template::{FieldTemplate, StreamField};

enum Transport {
    Udp(UdpSocket),
    Serial(SharedConn),
}

/// One streaming emitter: a transport plus its field template, consuming
/// results on its own thread.
pub struct Streamer {
    control: thread_control::Control,
    handle: Option<std::thread::JoinHandle<()>>,
    /// held while streaming so trial resets are refused (dropped on stop)
    _guard: Option<WriterGuard>,
}

impl Streamer {
    /// Stream over UDP to `target`. Sends are non-blocking best-effort.
    pub fn spawn_udp(
        target: SocketAddr,
        template: FieldTemplate,
        rx: crossbeam_channel::Receiver<PupilFrame>,
        guard: Option<WriterGuard>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(target)?;
        socket.set_nonblocking(true)?;
        Self::spawn("streamer-udp", Transport::Udp(socket), template, rx, guard)
    }

    /// Stream over a pooled serial connection.
    pub fn spawn_serial(
        conn: SharedConn,
        template: FieldTemplate,
        rx: crossbeam_channel::Receiver<PupilFrame>,
        guard: Option<WriterGuard>,
    ) -> Result<Self> {
        Self::spawn(
            "streamer-serial",
            Transport::Serial(conn),
            template,
            rx,
            guard,
        )
    }

    fn spawn(
        name: &str,
        transport: Transport,
        template: FieldTemplate,
        rx: crossbeam_channel::Receiver<PupilFrame>,
        guard: Option<WriterGuard>,
    ) -> Result<Self> {
        let (flag, control) = thread_control::make_pair();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while flag.is_alive() {
                    let frame = match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(frame) => frame,
                        Err(e) if e.is_timeout() => continue,
                        Err(_) => break, // producer gone
                    };
                    let line = template.format_line(&frame);
                    match &transport {
                        Transport::Udp(socket) => send_datagram(socket, line.as_bytes()),
                        Transport::Serial(conn) => {
                            // short per-write lock; the trigger controller
                            // shares this port
                            let mut port = conn.lock();
                            if let Err(e) = port.write_all(line.as_bytes()) {
                                error!("serial stream write failed: {e}");
                            }
                        }
                    }
                }
                // flush pending serial bytes before reporting stopped
                if let Transport::Serial(conn) = &transport {
                    if let Err(e) = conn.lock().flush() {
                        warn!("serial flush on stop failed: {e}");
                    }
                }
                debug!("streamer exiting");
            })?;
        Ok(Self {
            control,
            handle: Some(handle),
            _guard: guard,
        })
    }

    /// Stop the emitter; serial transports flush pending writes. Idempotent.
    pub fn stop(&mut self) {
        self.control.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Best-effort datagram send: liveness beats reliability here.
fn send_datagram(socket: &UdpSocket, data: &[u8]) {
    match socket.send(data) {
        Ok(sent) => {
            if sent != data.len() {
                warn!("incomplete datagram send ({sent}/{} bytes)", data.len());
            }
        }
        Err(e) => match e.kind() {
            std::io::ErrorKind::WouldBlock => {
                warn!("WouldBlock: dropping stream record");
            }
            std::io::ErrorKind::ConnectionRefused => {
                warn!("ConnectionRefused: dropping stream record");
            }
            _ => {
                error!("error sending stream record: {e:?}");
            }
        },
    }
}
