use std::fs::{File, OpenOptions};
use std::io::{self, Error, ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use termios::os::target::{B115200, B57600};
use termios::*;
use tokio::io::unix::AsyncFd;

pub struct AsyncFile {
    inner: AsyncFd<File>,
}

fn speed(baudrate: u32) -> io::Result<speed_t> {
    Ok(match baudrate {
        1200 => B1200,
        2400 => B2400,
        4800 => B4800,
        9600 => B9600,
        19200 => B19200,
        38400 => B38400,
        57600 => B57600,
        115200 => B115200,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("unsupported baud rate {}", baudrate),
            ))
        }
    })
}

impl AsyncFile {
    pub fn open_serial(path: &str, baudrate: u32) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;

        let fd = file.as_raw_fd();
        let mut termios = Termios::from_fd(fd)?;
        cfmakeraw(&mut termios);
        cfsetspeed(&mut termios, speed(baudrate)?)?;
        tcsetattr(fd, TCSANOW, &termios)?;
        tcflush(fd, TCIFLUSH)?;

        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }

    pub async fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| match inner.get_ref().read(out) {
                Ok(0) => Err(Error::new(ErrorKind::UnexpectedEof, "device disconnected")),
                res => res,
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}
