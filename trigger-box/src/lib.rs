//! Serial link to the microcontroller that generates the shared camera
//! frame clock.
//!
//! Wire protocol: `<TX{count}X{delay_us}>` starts a burst of `count` pulses
//! (`0` = until stopped) with `delay_us` microseconds between half-periods,
//! so one frame takes `2 * delay_us`. `<SX>` stops. Device replies are read
//! and discarded.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serial open failed on {port}: {source}")]
    SerialOpen {
        port: String,
        source: serialport::Error,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("invalid frame rate {0}")]
    InvalidFrameRate(f64),
    #[error("trigger thread not running")]
    NotRunning,
}

mod pool;
pub use pool::{SerialConn, SerialPool, SharedConn};

/// Commands consumed by the trigger background thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    StartPulses { count: u32, delay_us: u32 },
    StopPulses,
    Shutdown,
}

impl Cmd {
    /// Bit-exact wire form of the command, 7-bit ASCII.
    pub fn wire_format(&self) -> Option<String> {
        match self {
            Cmd::StartPulses { count, delay_us } => Some(format!("<TX{count}X{delay_us}>")),
            Cmd::StopPulses => Some("<SX>".to_string()),
            Cmd::Shutdown => None,
        }
    }

    fn with_count(self, count: u32) -> Cmd {
        match self {
            Cmd::StartPulses { delay_us, .. } => Cmd::StartPulses { count, delay_us },
            other => other,
        }
    }
}

/// Start command for a target frame rate.
///
/// `delay_us` is the inter-half-period time, so the emitted frame rate is
/// `1e6 / (2 * delay_us)` Hz.
pub fn make_trigger_cmd(fps: f64, count: u32) -> Result<Cmd> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(Error::InvalidFrameRate(fps));
    }
    let exact = 1e6 / (2.0 * fps);
    if exact < 1.0 {
        // the controller cannot do sub-microsecond half-periods
        return Err(Error::InvalidFrameRate(fps));
    }
    let delay_us = exact.round() as u32;
    Ok(Cmd::StartPulses { count: 0, delay_us }.with_count(count))
}

/// Frame period produced by a given half-period delay.
pub fn frame_period(delay_us: u32) -> Duration {
    Duration::from_micros(2 * delay_us as u64)
}

/// Consume `Cmd`s from `rx` and write them to the pooled port.
///
/// The port mutex is held only for the duration of one command write, so
/// other owners (the serial streamer) can interleave.
pub fn launch_background_thread(
    conn: SharedConn,
    rx: crossbeam_channel::Receiver<Cmd>,
) -> std::io::Result<(thread_control::Control, std::thread::JoinHandle<()>)> {
    let (flag, control) = thread_control::make_pair();
    let handle = std::thread::Builder::new()
        .name("trigger-box".to_string())
        .spawn(move || {
            while flag.is_alive() {
                let cmd = match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(cmd) => cmd,
                    Err(e) if e.is_timeout() => continue,
                    Err(_) => break, // all senders gone
                };
                if cmd == Cmd::Shutdown {
                    break;
                }
                let wire = match cmd.wire_format() {
                    Some(w) => w,
                    None => continue,
                };
                let mut port = conn.lock();
                if let Err(e) = port.write_all(wire.as_bytes()).and_then(|_| port.flush()) {
                    error!("trigger write failed: {e}");
                    continue;
                }
                debug!("trigger command sent: {wire}");
                drain_replies(&mut **port);
            }
            debug!("trigger-box thread exiting");
        })?;
    Ok((control, handle))
}

/// Read and discard whatever the device replied. Malformed or absent
/// replies are ignored per protocol.
fn drain_replies(port: &mut dyn SerialConn) {
    let mut scratch = [0u8; 64];
    match port.read(&mut scratch) {
        Ok(0) => {}
        Ok(n) => debug!("discarding {n} reply bytes"),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) => {}
        Err(e) => warn!("trigger reply read error (ignored): {e}"),
    }
}

/// Owner handle for the trigger clock of one experiment run.
pub struct TriggerBox {
    tx: crossbeam_channel::Sender<Cmd>,
    control: thread_control::Control,
    handle: Option<std::thread::JoinHandle<()>>,
    last_delay_us: Mutex<Option<u32>>,
}

impl TriggerBox {
    /// Open `port_path` through the pool and launch the command thread.
    pub fn new(pool: &SerialPool, port_path: &str, baud: u32) -> Result<Self> {
        let conn = pool.open(port_path, baud)?;
        Self::with_conn(conn)
    }

    /// Launch on an already-opened connection (tests, shared ports).
    pub fn with_conn(conn: SharedConn) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (control, handle) = launch_background_thread(conn, rx)?;
        Ok(Self {
            tx,
            control,
            handle: Some(handle),
            last_delay_us: Mutex::new(None),
        })
    }

    pub fn start_fps(&self, fps: f64) -> Result<()> {
        let cmd = make_trigger_cmd(fps, 0)?;
        if let Cmd::StartPulses { delay_us, .. } = cmd {
            *self.last_delay_us.lock() = Some(delay_us);
        }
        self.send(cmd)
    }

    pub fn start_pulses(&self, count: u32, delay_us: u32) -> Result<()> {
        *self.last_delay_us.lock() = Some(delay_us);
        self.send(Cmd::StartPulses { count, delay_us })
    }

    /// Fire-and-forget stop; the protocol has no ack. Callers treat the
    /// absence of frames for twice the inter-frame interval as confirmation.
    pub fn stop_pulses(&self) -> Result<()> {
        self.send(Cmd::StopPulses)
    }

    /// Inter-frame interval of the most recent start command, if any.
    pub fn current_frame_period(&self) -> Option<Duration> {
        self.last_delay_us.lock().map(frame_period)
    }

    fn send(&self, cmd: Cmd) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::NotRunning)
    }
}

impl Drop for TriggerBox {
    fn drop(&mut self) {
        let _ = self.tx.send(Cmd::StopPulses);
        let _ = self.tx.send(Cmd::Shutdown);
        self.control.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::LoopbackConn;

    #[test]
    fn wire_format_is_bit_exact() {
        assert_eq!(
            Cmd::StartPulses {
                count: 0,
                delay_us: 5000
            }
            .wire_format()
            .unwrap(),
            "<TX0X5000>"
        );
        assert_eq!(
            Cmd::StartPulses {
                count: 120,
                delay_us: 1250
            }
            .wire_format()
            .unwrap(),
            "<TX120X1250>"
        );
        assert_eq!(Cmd::StopPulses.wire_format().unwrap(), "<SX>");
    }

    #[test]
    fn hundred_fps_is_5000us_half_period() {
        let cmd = make_trigger_cmd(100.0, 0).unwrap();
        assert_eq!(
            cmd,
            Cmd::StartPulses {
                count: 0,
                delay_us: 5000
            }
        );
        assert_eq!(frame_period(5000), Duration::from_millis(10));
    }

    #[test]
    fn rejects_bad_frame_rates() {
        assert!(make_trigger_cmd(0.0, 0).is_err());
        assert!(make_trigger_cmd(-5.0, 0).is_err());
        assert!(make_trigger_cmd(f64::NAN, 0).is_err());
        // above 500 kHz the half-period would round below 1 us
        assert!(make_trigger_cmd(1e6, 0).is_err());
    }

    #[test]
    fn thread_writes_commands_to_port() {
        let (conn, written) = LoopbackConn::shared();
        let tb = TriggerBox::with_conn(conn).unwrap();
        tb.start_fps(100.0).unwrap();
        tb.stop_pulses().unwrap();
        // wait for the background thread to drain the queue
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let w = written.lock();
                if String::from_utf8_lossy(&w).contains("<SX>") {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tb.current_frame_period(), Some(Duration::from_millis(10)));
        drop(tb);
        let w = written.lock();
        let s = String::from_utf8_lossy(&w);
        assert!(s.starts_with("<TX0X5000><SX>"), "got {s}");
    }
}
