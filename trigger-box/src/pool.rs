use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::{Error, Result};

/// Byte-stream connection to a serial device.
pub trait SerialConn: Read + Write + Send {}
impl<T: Read + Write + Send> SerialConn for T {}

pub type SharedConn = Arc<Mutex<Box<dyn SerialConn>>>;

/// Pool of open serial ports keyed by device path.
///
/// Serial devices are the only cross-thread mutable shared resource in the
/// pipeline: the trigger controller and the serial streamer may talk to the
/// same adapter. Each port is mutex-guarded; writers hold the lock for one
/// command at a time.
#[derive(Default)]
pub struct SerialPool {
    ports: Mutex<HashMap<String, SharedConn>>,
}

impl SerialPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` at `baud`, or return the already-open connection.
    pub fn open(&self, path: &str, baud: u32) -> Result<SharedConn> {
        let mut ports = self.ports.lock();
        if let Some(conn) = ports.get(path) {
            return Ok(conn.clone());
        }
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|source| Error::SerialOpen {
                port: path.to_string(),
                source,
            })?;
        info!("opened serial port {path} at {baud} baud");
        let boxed: Box<dyn SerialConn> = Box::new(port);
        let conn: SharedConn = Arc::new(Mutex::new(boxed));
        ports.insert(path.to_string(), conn.clone());
        Ok(conn)
    }

    /// Register an externally-created connection under `path`.
    pub fn insert(&self, path: &str, conn: Box<dyn SerialConn>) -> SharedConn {
        let shared: SharedConn = Arc::new(Mutex::new(conn));
        self.ports.lock().insert(path.to_string(), shared.clone());
        shared
    }

    pub fn get(&self, path: &str) -> Option<SharedConn> {
        self.ports.lock().get(path).cloned()
    }

    pub fn close(&self, path: &str) {
        self.ports.lock().remove(path);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Captures writes, replies with nothing.
    pub(crate) struct LoopbackConn {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl LoopbackConn {
        pub(crate) fn shared() -> (SharedConn, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let boxed: Box<dyn SerialConn> = Box::new(LoopbackConn {
                written: written.clone(),
            });
            (Arc::new(Mutex::new(boxed)), written)
        }
    }

    impl Write for LoopbackConn {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Read for LoopbackConn {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply"))
        }
    }

    #[test]
    fn pool_returns_same_connection_for_same_path() {
        let pool = SerialPool::new();
        let (conn, _) = LoopbackConn::shared();
        // route around the hardware open
        {
            let mut ports = pool.ports.lock();
            ports.insert("COM9".to_string(), conn);
        }
        let a = pool.get("COM9").unwrap();
        let b = pool.get("COM9").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        pool.close("COM9");
        assert!(pool.get("COM9").is_none());
    }

    #[test]
    fn insert_makes_connection_visible() {
        let pool = SerialPool::new();
        let shared = pool.insert(
            "/dev/ttyACM0",
            Box::new(LoopbackConn {
                written: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        assert!(Arc::ptr_eq(&shared, &pool.get("/dev/ttyACM0").unwrap()));
    }
}
