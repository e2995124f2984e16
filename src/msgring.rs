//! A bounded in-memory ring of recent log writes.
//!
//! Wraps an inner writer and remembers the last N writes, so diagnostic
//! snapshots can include recent messages without scraping log files.

use parking_lot::Mutex;
use std::io::{self, Write};

struct MsgRingInner {
    writer: Box<dyn Write + Send>,
    next: usize,
    msgs: Vec<Option<Vec<u8>>>,
}

/// Concurrent-safe ring over an inner writer.
pub struct MsgRing {
    inner: Mutex<MsgRingInner>,
}

impl MsgRing {
    /// Build a ring of `ring_size` slots over `writer`.
    pub fn new(writer: Box<dyn Write + Send>, ring_size: usize) -> crate::Result<Self> {
        if ring_size == 0 {
            return Err(crate::Error::Config(
                "msg ring size must be positive".to_string(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(MsgRingInner {
                writer,
                next: 0,
                msgs: vec![None; ring_size],
            }),
        })
    }

    /// Remember one write and forward it to the inner writer.
    pub fn write_msg(&self, p: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let next = inner.next;
        inner.msgs[next] = Some(p.to_vec());
        inner.next = (next + 1) % inner.msgs.len();
        inner.writer.write(p)
    }

    /// Recent writes, oldest first.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        let n = inner.msgs.len();
        let mut rv = Vec::with_capacity(n);
        for i in 0..n {
            if let Some(msg) = &inner.msgs[(inner.next + i) % n] {
                rv.push(msg.clone());
            }
        }
        rv
    }
}

impl Write for &MsgRing {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_msg(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().writer.flush()
    }
}
