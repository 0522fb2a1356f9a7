//! Serial byte FIFO
//!
//! The sink behind the guest's emulated UART. Guest I/O exits push bytes in,
//! the host drains them at its own pace. The FIFO is shared between every
//! vCPU writing to the same UART, so all accesses go through a spin lock.

use spin::Mutex;

use crate::vmx::{HvError, HvResult};

pub const FIFO_CAPACITY: usize = 4096;

pub struct SerialFifo {
    inner: Mutex<Inner>,
}

struct Inner {
    buf: [u8; FIFO_CAPACITY],
    head: usize,
    len: usize,
}

impl SerialFifo {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: [0; FIFO_CAPACITY],
                head: 0,
                len: 0,
            }),
        }
    }

    /// Appends `bytes`, all or nothing.
    ///
    /// A full FIFO rejects the write, the caller decides whether that is
    /// fatal for the producer.
    pub fn write(&self, bytes: &[u8]) -> HvResult {
        let mut inner = self.inner.lock();
        if bytes.len() > FIFO_CAPACITY - inner.len {
            return Err(HvError::NoMemory);
        }
        for &byte in bytes {
            let tail = (inner.head + inner.len) % FIFO_CAPACITY;
            inner.buf[tail] = byte;
            inner.len += 1;
        }
        Ok(())
    }

    /// Drains up to `out.len()` bytes, returns how many were copied.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let count = core::cmp::min(out.len(), inner.len);
        for slot in out.iter_mut().take(count) {
            *slot = inner.buf[inner.head];
            inner.head = (inner.head + 1) % FIFO_CAPACITY;
            inner.len -= 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn write_then_read() {
        let fifo = SerialFifo::new();
        assert_eq!(fifo.write(b"abc"), Ok(()));
        assert_eq!(fifo.len(), 3);

        let mut out = [0u8; 8];
        let count = fifo.read(&mut out);
        assert_eq!(count, 3);
        assert_eq!(&out[..3], b"abc");
        assert!(fifo.is_empty());
    }

    #[test_case]
    fn rejects_when_full() {
        let fifo = SerialFifo::new();
        let chunk = [0x41u8; FIFO_CAPACITY];
        assert_eq!(fifo.write(&chunk), Ok(()));
        assert_eq!(fifo.write(b"x"), Err(HvError::NoMemory));
        // The failed write must not change the content.
        assert_eq!(fifo.len(), FIFO_CAPACITY);
    }

    #[test_case]
    fn wraps_around() {
        let fifo = SerialFifo::new();
        let mut out = [0u8; FIFO_CAPACITY];
        fifo.write(&[0u8; FIFO_CAPACITY - 1]).unwrap();
        assert_eq!(fifo.read(&mut out), FIFO_CAPACITY - 1);
        fifo.write(b"wrap").unwrap();
        assert_eq!(fifo.read(&mut out), 4);
        assert_eq!(&out[..4], b"wrap");
    }
}
