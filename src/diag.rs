//! Allocation-free diagnostic output.  The introspection routines run
//! under the heap lock, in a process whose allocator may be this very
//! library, so they must not allocate while formatting.  `FdWriter`
//! buffers into a fixed array and flushes straight to a file
//! descriptor.
use std::fmt;

pub(crate) const STDOUT_FD: libc::c_int = 1;
pub(crate) const STDERR_FD: libc::c_int = 2;

const BUF_SIZE: usize = 256;

pub(crate) struct FdWriter {
    fd: libc::c_int,
    buf: [u8; BUF_SIZE],
    len: usize,
}

impl FdWriter {
    pub(crate) fn new(fd: libc::c_int) -> Self {
        FdWriter {
            fd,
            buf: [0; BUF_SIZE],
            len: 0,
        }
    }

    /// Hands the buffered bytes to the OS.  Output is best effort: a
    /// short or failed write drops the rest of the buffer.
    pub(crate) fn flush(&mut self) {
        let mut off = 0;

        while off < self.len {
            let ret = unsafe {
                libc::write(
                    self.fd,
                    self.buf[off..].as_ptr() as *const libc::c_void,
                    self.len - off,
                )
            };
            if ret <= 0 {
                break;
            }
            off += ret as usize;
        }
        self.len = 0;
    }
}

impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();

        while !bytes.is_empty() {
            if self.len == BUF_SIZE {
                self.flush();
            }

            let room = BUF_SIZE - self.len;
            let take = room.min(bytes.len());
            self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
            self.len += take;
            bytes = &bytes[take..];
        }
        Ok(())
    }
}

impl Drop for FdWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    fn read_all(fd: libc::c_int) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];

        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    #[test]
    fn test_write_through_pipe() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        {
            let mut writer = FdWriter::new(fds[1]);
            write!(writer, "hello {:#x}", 42).unwrap();
            // Drop flushes.
        }
        unsafe { libc::close(fds[1]) };

        assert_eq!(read_all(fds[0]), b"hello 0x2a");
        unsafe { libc::close(fds[0]) };
    }

    #[test]
    fn test_write_larger_than_buffer() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let line = "0123456789abcdef";
        {
            let mut writer = FdWriter::new(fds[1]);
            for _ in 0..64 {
                writer.write_str(line).unwrap();
            }
        }
        unsafe { libc::close(fds[1]) };

        let out = read_all(fds[0]);
        assert_eq!(out.len(), 64 * line.len());
        assert!(out.chunks(16).all(|c| c == line.as_bytes()));
        unsafe { libc::close(fds[0]) };
    }
}
