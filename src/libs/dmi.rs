//! The Debug Module Interface (DMI): the only contract the back end has
//! with the physical transport reaching the Debug Module. §1 scopes the
//! physical transport itself out of the core — this module owns only the
//! trait boundary plus two pluggable implementations that round out a
//! shippable binary (a loopback register file for tests/smoke-runs, and a
//! line-oriented proxy for a real probe).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DmiError {
    #[error("DMI transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DMI proxy returned a malformed reply: {0}")]
    Protocol(String),
}

/// Exactly the two primitives §6 grants the core over the Debug Module.
pub trait DmiTransport {
    fn dmi_read(&mut self, addr: u16) -> Result<u32, DmiError>;
    fn dmi_write(&mut self, addr: u16, value: u32) -> Result<(), DmiError>;
}

/// An in-memory register file standing in for a Debug Module.
///
/// Used by the back-end unit tests and by `--dmi mock`, so the front end
/// can be smoke-tested without hardware (§4.3 "Initialization").
#[derive(Debug, Default)]
pub struct MockDmi {
    regs: HashMap<u16, u32>,
}

impl MockDmi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poke(&mut self, addr: u16, value: u32) {
        self.regs.insert(addr, value);
    }

    pub fn peek(&self, addr: u16) -> u32 {
        *self.regs.get(&addr).unwrap_or(&0)
    }
}

impl DmiTransport for MockDmi {
    fn dmi_read(&mut self, addr: u16) -> Result<u32, DmiError> {
        Ok(self.peek(addr))
    }

    fn dmi_write(&mut self, addr: u16, value: u32) -> Result<(), DmiError> {
        self.regs.insert(addr, value);
        Ok(())
    }
}

/// Forwards `dmi_read`/`dmi_write` to a line-oriented TCP proxy process that
/// owns the actual probe wiring (JTAG, a vendor debug-transport chip, …).
///
/// Wire format, one request/reply pair per line: `R <addr-hex>\n` ->
/// `<value-hex>\n`; `W <addr-hex> <value-hex>\n` -> `OK\n`. Keeping this
/// dumb-and-textual is deliberate: the stub never needs to know what is on
/// the other end of the proxy.
pub struct TcpDmi {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpDmi {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, DmiError> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    fn read_line(&mut self) -> Result<String, DmiError> {
        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        if line.is_empty() {
            return Err(DmiError::Protocol("DMI proxy closed the connection".into()));
        }
        Ok(line.trim_end().to_string())
    }
}

impl DmiTransport for TcpDmi {
    fn dmi_read(&mut self, addr: u16) -> Result<u32, DmiError> {
        writeln!(self.stream, "R {:04x}", addr)?;
        let reply = self.read_line()?;
        u32::from_str_radix(reply.trim(), 16)
            .map_err(|_| DmiError::Protocol(format!("expected hex value, got {reply:?}")))
    }

    fn dmi_write(&mut self, addr: u16, value: u32) -> Result<(), DmiError> {
        writeln!(self.stream, "W {:04x} {:08x}", addr, value)?;
        let reply = self.read_line()?;
        if reply != "OK" {
            return Err(DmiError::Protocol(format!("expected OK, got {reply:?}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_dmi_reads_back_writes() {
        let mut dmi = MockDmi::new();
        dmi.dmi_write(0x11, 0xdead_beef).unwrap();
        assert_eq!(dmi.dmi_read(0x11).unwrap(), 0xdead_beef);
    }

    #[test]
    fn mock_dmi_unwritten_register_reads_zero() {
        let mut dmi = MockDmi::new();
        assert_eq!(dmi.dmi_read(0x42).unwrap(), 0);
    }
}
