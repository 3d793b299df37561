//! RSP front end: packet reassembly, handler dispatch, and the
//! accept/connection loop, §4.2/§4.4/§5.
//!
//! A non-blocking `TcpListener` is polled against an `Arc<AtomicBool>`
//! "running" flag, handing each accepted connection to one per-connection
//! `run` loop; inbound bytes feed a buffer-driven reassembly window, and
//! dispatch is a plain `match` over the first payload byte.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::libs::backend::{Backend, BackendError, RegClass, RunMode, StopReason};
use crate::libs::dmi::DmiTransport;
use crate::libs::elf_loader;
use crate::libs::rsp_codec::{
    bin2hex, decode_frame, encode_frame, hex2bin, hex_to_val, val_to_hex, Decoded, PKT_MAX,
};
use crate::libs::session::Session;

/// Number of registers in the `g`/`G` dump: 32 GPRs plus PC. FPRs are a
/// capability gate left for later per §9 open question (e) — xlen-wide
/// zero bytes are emitted in their place so the payload length stays
/// consistent with what a `g`-aware client expects from this regnum layout.
const G_REGISTER_COUNT: usize = 33;

/// Which logical register a `p`/`P` regnum (§4.2 "Regnum map") addresses.
enum Regnum {
    Gpr(u16),
    Pc,
    Fpr(u16),
    Csr(u16),
    Priv,
}

fn decode_regnum(n: u64) -> Option<Regnum> {
    match n {
        0x00..=0x1f => Some(Regnum::Gpr(n as u16)),
        0x20 => Some(Regnum::Pc),
        0x21..=0x40 => Some(Regnum::Fpr((n - 0x21) as u16)),
        0x41..=0x1040 => Some(Regnum::Csr((n - 0x41) as u16)),
        0x1041 => Some(Regnum::Priv),
        _ => None,
    }
}

/// Connection-scoped front end: owns the reassembly window, the run-state
/// [`Session`], and the back end it dispatches into.
pub struct RspServer<'a, T: DmiTransport> {
    backend: &'a mut Backend<T>,
    session: Session,
    window: Vec<u8>,
}

/// What the outer read/dispatch loop should do after one iteration.
enum LoopAction {
    Continue,
    Terminate,
}

impl<'a, T: DmiTransport> RspServer<'a, T> {
    pub fn new(backend: &'a mut Backend<T>, xlen: u32, cpu_timeout_budget: u32) -> Self {
        RspServer {
            backend,
            session: Session::new(xlen, cpu_timeout_budget),
            window: Vec::new(),
        }
    }

    /// Drives one connection to completion: read, reassemble, dispatch,
    /// respond, and poll for a deferred stop-reason, until the stream
    /// closes, `D`/`k` is received, or `running` is cleared, §5/§9.
    pub fn run(&mut self, stream: &mut TcpStream, running: &Arc<AtomicBool>) -> std::io::Result<()> {
        stream.set_read_timeout(Some(Duration::from_millis(1)))?;
        let mut read_buf = [0u8; 4096];

        loop {
            if !running.load(Ordering::SeqCst) {
                info!("stop signal observed, ending session");
                return Ok(());
            }

            match stream.read(&mut read_buf) {
                Ok(0) => {
                    info!("command stream closed by peer");
                    return Ok(());
                }
                Ok(n) => {
                    self.window.extend_from_slice(&read_buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }

            loop {
                match self.drain_one_frame(stream)? {
                    LoopAction::Continue => {}
                    LoopAction::Terminate => return Ok(()),
                }
                if self.window.is_empty() {
                    break;
                }
                let decoded = decode_frame(&self.window);
                if matches!(decoded, Decoded::NeedMore) {
                    break;
                }
            }

            if self.session.waiting_for_stop_reason {
                self.poll_deferred_stop_reason(stream)?;
            }
        }
    }

    /// Scans the window for exactly one frame/garbage/control-c outcome and
    /// acts on it; returns without consuming anything if more bytes are
    /// needed, §4.2 steps 1-5.
    fn drain_one_frame(&mut self, stream: &mut TcpStream) -> std::io::Result<LoopAction> {
        match decode_frame(&self.window) {
            Decoded::NeedMore => Ok(LoopAction::Continue),
            Decoded::Garbage(n) => {
                warn!(bytes = n, "discarding garbage ahead of next frame");
                self.window.drain(..n);
                Ok(LoopAction::Continue)
            }
            Decoded::ControlC => {
                self.window.drain(..1);
                self.handle_control_c(stream)?;
                Ok(LoopAction::Continue)
            }
            Decoded::BadChecksum(consumed) => {
                self.window.drain(..consumed);
                stream.write_all(b"-")?;
                Ok(LoopAction::Continue)
            }
            Decoded::Packet(payload, consumed) => {
                self.window.drain(..consumed);
                stream.write_all(b"+")?;
                self.dispatch(stream, &payload)
            }
        }
    }

    /// §8 scenario 5: `^C` halts the target and sends exactly one deferred
    /// `T%02x` stop-reason reply, the same as a `c`/`s` halt.
    fn handle_control_c(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        debug!("^C received, requesting halt");
        self.session.on_interrupt_requested();
        if let Err(e) = self.backend.stop() {
            warn!(error = %e, "^C: back-end stop failed");
            return Ok(());
        }
        match self.backend.get_stop_reason() {
            Ok(StopReason::Halted(cause)) => {
                self.session.on_halted();
                stream.write_all(&encode_frame(format!("T{:02x}", cause.code()).as_bytes()).unwrap())
            }
            Ok(StopReason::Timeout) => {
                self.session.on_halted();
                stream.write_all(&encode_frame(b"T00").unwrap())
            }
            Ok(StopReason::Running) => {
                // stop() already polled allhalted; arm the deferred poll as
                // a fallback so the debugger still gets exactly one T%02x.
                self.session.waiting_for_stop_reason = true;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "^C: get_stop_reason failed");
                Ok(())
            }
        }
    }

    /// After `c`/`s`, polls [`Backend::get_stop_reason`] until halted or
    /// timed out and sends the deferred `T%02x`, §4.2 "Run-state
    /// coordination". Called once per outer loop iteration so it never
    /// blocks the accept-loop's `running` check for long.
    fn poll_deferred_stop_reason(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        if self.session.tick_cpu_timeout() {
            let _ = self.backend.stop();
        }
        match self.backend.get_stop_reason() {
            Ok(StopReason::Halted(cause)) => {
                self.session.on_halted();
                stream.write_all(&encode_frame(format!("T{:02x}", cause.code()).as_bytes()).unwrap())?;
            }
            Ok(StopReason::Timeout) => {
                self.session.on_halted();
                stream.write_all(&encode_frame(b"T00").unwrap())?;
            }
            Ok(StopReason::Running) => {}
            Err(e) => {
                warn!(error = %e, "get_stop_reason failed");
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<LoopAction> {
        if payload.is_empty() {
            return self.reply_empty(stream);
        }
        trace!(first = payload[0] as char, "dispatching packet");
        match payload[0] {
            b'?' => self.cmd_stop_reason(stream),
            b'c' => self.cmd_continue(stream, &payload[1..]),
            b's' => self.cmd_step(stream, &payload[1..]),
            b'D' => {
                self.cmd_detach(stream)?;
                return Ok(LoopAction::Terminate);
            }
            b'k' => return Ok(LoopAction::Terminate),
            b'g' => self.cmd_read_all_regs(stream),
            b'G' => self.cmd_write_all_regs(stream, &payload[1..]),
            b'm' => self.cmd_read_mem(stream, &payload[1..]),
            b'M' => self.cmd_write_mem(stream, &payload[1..]),
            b'X' => self.cmd_write_mem_binary(stream, &payload[1..]),
            b'p' => self.cmd_read_reg(stream, &payload[1..]),
            b'P' => self.cmd_write_reg(stream, &payload[1..]),
            b'q' => self.cmd_query(stream, &payload[1..]),
            _ => self.reply_empty(stream),
        }?;
        Ok(LoopAction::Continue)
    }

    fn reply_empty(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        stream.write_all(&encode_frame(b"").unwrap())
    }

    fn reply_ok(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        stream.write_all(&encode_frame(b"OK").unwrap())
    }

    fn reply_err(&self, stream: &mut TcpStream, code: u8) -> std::io::Result<()> {
        stream.write_all(&encode_frame(format!("E{:02x}", code).as_bytes()).unwrap())
    }

    fn reply_backend_result<R>(
        &mut self,
        stream: &mut TcpStream,
        result: Result<R, BackendError>,
        on_ok: impl FnOnce(&mut Self, &mut TcpStream, R) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        match result {
            Ok(value) => on_ok(self, stream, value),
            Err(e) => {
                warn!(error = %e, "back-end primitive failed");
                self.reply_err(stream, 0x01)
            }
        }
    }

    fn cmd_stop_reason(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        let result = self.backend.get_stop_reason();
        self.reply_backend_result(stream, result, |this, stream, reason| match reason {
            StopReason::Halted(cause) => {
                this.session.on_halted();
                stream.write_all(&encode_frame(format!("T{:02x}", cause.code()).as_bytes()).unwrap())
            }
            StopReason::Running => {
                this.session.waiting_for_stop_reason = true;
                Ok(())
            }
            StopReason::Timeout => this.reply_err(stream, 0x01),
        })
    }

    fn maybe_write_pc(&mut self, hex_addr: &[u8]) -> Result<(), BackendError> {
        if hex_addr.is_empty() {
            return Ok(());
        }
        if let Some(value) = std::str::from_utf8(hex_addr).ok().and_then(hex_to_val) {
            self.backend.reg_write(RegClass::Pc, value)?;
        }
        Ok(())
    }

    fn cmd_continue(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        if let Err(e) = self.maybe_write_pc(arg) {
            warn!(error = %e, "continue: optional PC write failed");
        }
        let result = self.backend.resume();
        self.reply_backend_result(stream, result, |this, _stream, mode| {
            this.session.on_resume(mode);
            Ok(())
        })
    }

    fn cmd_step(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        if let Err(e) = self.maybe_write_pc(arg) {
            warn!(error = %e, "step: optional PC write failed");
        }
        let result = self.backend.step();
        self.reply_backend_result(stream, result, |this, _stream, _mode| {
            this.session.on_resume(RunMode::Step);
            Ok(())
        })
    }

    fn cmd_detach(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        if self.session.run_mode == RunMode::Continue {
            let _ = self.backend.stop();
        }
        self.reply_ok(stream)
    }

    fn cmd_read_all_regs(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        let width = if self.session.xlen == 64 { 8 } else { 4 };
        let mut hex = String::with_capacity(G_REGISTER_COUNT * width * 2);
        for i in 0..32u16 {
            let class = if i == 0 {
                None
            } else {
                Some(RegClass::Gpr(i))
            };
            let value = match class {
                None => 0,
                Some(c) => match self.backend.reg_read(c) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, reg = i, "g: GPR read failed");
                        return self.reply_err(stream, 0x01);
                    }
                },
            };
            hex.push_str(&val_to_hex(value, width));
        }
        match self.backend.reg_read(RegClass::Pc) {
            Ok(pc) => hex.push_str(&val_to_hex(pc, width)),
            Err(e) => {
                warn!(error = %e, "g: PC read failed");
                return self.reply_err(stream, 0x01);
            }
        }
        stream.write_all(&encode_frame(hex.as_bytes()).unwrap())
    }

    fn cmd_write_all_regs(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        let text = match std::str::from_utf8(arg) {
            Ok(s) => s,
            Err(_) => return self.reply_err(stream, 0x01),
        };
        let width_chars = if self.session.xlen == 64 { 16 } else { 8 };
        if text.len() != width_chars * G_REGISTER_COUNT {
            return self.reply_err(stream, 0x01);
        }
        let mut values = Vec::with_capacity(G_REGISTER_COUNT);
        for chunk in text.as_bytes().chunks_exact(width_chars) {
            match std::str::from_utf8(chunk).ok().and_then(hex_to_val) {
                Some(v) => values.push(v),
                None => return self.reply_err(stream, 0x01),
            }
        }
        for (i, &value) in values[..32].iter().enumerate() {
            if i == 0 {
                continue;
            }
            if let Err(e) = self.backend.reg_write(RegClass::Gpr(i as u16), value) {
                warn!(error = %e, reg = i, "G: GPR write failed");
                return self.reply_err(stream, 0x01);
            }
        }
        if let Err(e) = self.backend.reg_write(RegClass::Pc, values[32]) {
            warn!(error = %e, "G: PC write failed");
            return self.reply_err(stream, 0x01);
        }
        self.reply_ok(stream)
    }

    fn parse_addr_len(arg: &[u8]) -> Option<(u64, usize)> {
        let text = std::str::from_utf8(arg).ok()?;
        let (addr_hex, len_hex) = text.split_once(',')?;
        let addr = u64::from_str_radix(addr_hex, 16).ok()?;
        let len = usize::from_str_radix(len_hex, 16).ok()?;
        Some((addr, len))
    }

    fn cmd_read_mem(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        let Some((addr, len)) = Self::parse_addr_len(arg) else {
            return self.reply_err(stream, 0x01);
        };
        // §4.2 "Sizing and truncation".
        let len = len.min((PKT_MAX - 1) / 2);
        let result = self.backend.mem_read(addr, len);
        self.reply_backend_result(stream, result, |_this, stream, bytes| {
            stream.write_all(&encode_frame(bin2hex(&bytes).as_bytes()).unwrap())
        })
    }

    fn cmd_write_mem(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        let text = match std::str::from_utf8(arg) {
            Ok(s) => s,
            Err(_) => return self.reply_err(stream, 0x01),
        };
        let Some((head, hex_data)) = text.split_once(':') else {
            return self.reply_err(stream, 0x01);
        };
        let Some((addr, len)) = Self::parse_addr_len(head.as_bytes()) else {
            return self.reply_err(stream, 0x01);
        };
        let Some(data) = hex2bin(hex_data) else {
            return self.reply_err(stream, 0x01);
        };
        if data.len() != len || len > PKT_MAX {
            return self.reply_err(stream, 0x01);
        }
        let result = self.backend.mem_write(addr, &data);
        self.reply_backend_result(stream, result, |this, stream, ()| this.reply_ok(stream))
    }

    fn cmd_write_mem_binary(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        let Some(colon) = arg.iter().position(|&b| b == b':') else {
            return self.reply_err(stream, 0x01);
        };
        let Some((addr, len)) = Self::parse_addr_len(&arg[..colon]) else {
            return self.reply_err(stream, 0x01);
        };
        let data = &arg[colon + 1..];
        if data.len() != len || len > PKT_MAX {
            return self.reply_err(stream, 0x01);
        }
        let result = self.backend.mem_write(addr, data);
        self.reply_backend_result(stream, result, |this, stream, ()| this.reply_ok(stream))
    }

    fn cmd_read_reg(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        let Some(n) = std::str::from_utf8(arg)
            .ok()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
        else {
            return self.reply_err(stream, 0x01);
        };
        let width = if self.session.xlen == 64 { 8 } else { 4 };
        let result: Result<u64, BackendError> = match decode_regnum(n) {
            Some(Regnum::Gpr(0)) => Ok(0),
            Some(Regnum::Gpr(g)) => self.backend.reg_read(RegClass::Gpr(g)),
            Some(Regnum::Pc) => self.backend.reg_read(RegClass::Pc),
            Some(Regnum::Csr(c)) => self.backend.reg_read(RegClass::Csr(c)),
            Some(Regnum::Fpr(_)) => Ok(0),
            Some(Regnum::Priv) => Ok(0),
            None => return self.reply_err(stream, 0x01),
        };
        self.reply_backend_result(stream, result, move |_this, stream, value| {
            stream.write_all(&encode_frame(val_to_hex(value, width).as_bytes()).unwrap())
        })
    }

    fn cmd_write_reg(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        let text = match std::str::from_utf8(arg) {
            Ok(s) => s,
            Err(_) => return self.reply_err(stream, 0x01),
        };
        let Some((n_hex, v_hex)) = text.split_once('=') else {
            return self.reply_err(stream, 0x01);
        };
        let Some(n) = u64::from_str_radix(n_hex, 16).ok() else {
            return self.reply_err(stream, 0x01);
        };
        let Some(value) = hex_to_val(v_hex) else {
            return self.reply_err(stream, 0x01);
        };
        let result: Result<(), BackendError> = match decode_regnum(n) {
            Some(Regnum::Gpr(0)) => Ok(()),
            Some(Regnum::Gpr(g)) => self.backend.reg_write(RegClass::Gpr(g), value),
            Some(Regnum::Pc) => self.backend.reg_write(RegClass::Pc, value),
            Some(Regnum::Csr(c)) => self.backend.reg_write(RegClass::Csr(c), value),
            Some(Regnum::Fpr(_)) | Some(Regnum::Priv) => Ok(()),
            None => return self.reply_err(stream, 0x01),
        };
        self.reply_backend_result(stream, result, |this, stream, ()| this.reply_ok(stream))
    }

    fn cmd_query(&mut self, stream: &mut TcpStream, arg: &[u8]) -> std::io::Result<()> {
        if arg.starts_with(b"Supported") {
            let reply = format!("PacketSize={:x};swbreak-;hwbreak-", PKT_MAX);
            return stream.write_all(&encode_frame(reply.as_bytes()).unwrap());
        }
        if arg == b"Attached" {
            return stream.write_all(&encode_frame(b"1").unwrap());
        }
        if let Some(hex_cmd) = arg.strip_prefix(b"Rcmd,") {
            return self.cmd_monitor(stream, hex_cmd);
        }
        self.reply_empty(stream)
    }

    fn cmd_monitor(&mut self, stream: &mut TcpStream, hex_cmd: &[u8]) -> std::io::Result<()> {
        let Some(bytes) = std::str::from_utf8(hex_cmd).ok().and_then(hex2bin) else {
            return self.reply_err(stream, 0x01);
        };
        let Ok(cmd) = String::from_utf8(bytes) else {
            return self.reply_err(stream, 0x01);
        };
        let mut words = cmd.split_whitespace();
        match words.next() {
            Some("help") => {
                let text = "commands: help, verbosity <n>, xlen <32|64>, \
                     reset_dm, reset_ndm, reset_hart, elf_load <path>\n";
                stream.write_all(&encode_frame(format!("O{}", bin2hex(text.as_bytes())).as_bytes()).unwrap())
            }
            Some("verbosity") => match words.next().and_then(|n| n.parse::<u32>().ok()) {
                Some(level) => {
                    let result = self.backend.set_verbosity(level);
                    self.reply_backend_result(stream, result, |this, stream, ()| this.reply_ok(stream))
                }
                None => self.reply_err(stream, 0x01),
            },
            Some("xlen") => match words.next() {
                Some("32") => {
                    self.backend.set_xlen(32);
                    self.session.xlen = 32;
                    self.reply_ok(stream)
                }
                Some("64") => {
                    self.backend.set_xlen(64);
                    self.session.xlen = 64;
                    self.reply_ok(stream)
                }
                _ => self.reply_err(stream, 0x01),
            },
            Some("reset_dm") => {
                let result = self.backend.dm_reset();
                self.reply_backend_result(stream, result, |this, stream, ()| this.reply_ok(stream))
            }
            Some("reset_ndm") => {
                let result = self.backend.ndm_reset(false);
                self.reply_backend_result(stream, result, |this, stream, ()| this.reply_ok(stream))
            }
            Some("reset_hart") => {
                let result = self.backend.hart_reset(false);
                self.reply_backend_result(stream, result, |this, stream, ()| this.reply_ok(stream))
            }
            Some("elf_load") => match words.next() {
                Some(path) => {
                    let result = elf_loader::load_file(self.backend, std::path::Path::new(path));
                    match result {
                        Ok(_) => self.reply_ok(stream),
                        Err(e) => {
                            warn!(error = %e, "elf_load monitor command failed");
                            self.reply_err(stream, 0x01)
                        }
                    }
                }
                None => self.reply_err(stream, 0x01),
            },
            _ => self.reply_empty(stream),
        }
    }
}

/// Serialized single-connection-at-a-time TCP accept loop, §5.1/§9 "Accept
/// loop": run one session to completion before accepting the next.
pub fn accept_loop<T: DmiTransport>(
    listener: &TcpListener,
    backend: &mut Backend<T>,
    xlen: u32,
    cpu_timeout_budget: u32,
    running: &Arc<AtomicBool>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                info!(%peer, "accepted connection");
                let mut server = RspServer::new(backend, xlen, cpu_timeout_budget);
                if let Err(e) = server.run(&mut stream, running) {
                    warn!(error = %e, "session ended with an I/O error");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::backend::PollingBudget;
    use crate::libs::dm_regs::addr;
    use crate::libs::dmi::MockDmi;

    fn initialized_backend() -> Backend<MockDmi> {
        let mut dmi = MockDmi::new();
        dmi.poke(addr::DMSTATUS, 1 << 9); // allhalted
        let mut backend = Backend::new(dmi, 32, PollingBudget::default());
        backend.init().unwrap();
        backend
    }

    #[test]
    fn decode_regnum_maps_the_regnum_table() {
        assert!(matches!(decode_regnum(0x00), Some(Regnum::Gpr(0))));
        assert!(matches!(decode_regnum(0x1f), Some(Regnum::Gpr(31))));
        assert!(matches!(decode_regnum(0x20), Some(Regnum::Pc)));
        assert!(matches!(decode_regnum(0x21), Some(Regnum::Fpr(0))));
        assert!(matches!(decode_regnum(0x41), Some(Regnum::Csr(0))));
        assert!(matches!(decode_regnum(0x1041), Some(Regnum::Priv)));
        assert!(decode_regnum(0x2000).is_none());
    }

    #[test]
    fn parse_addr_len_accepts_hex_pair() {
        assert_eq!(RspServer::<MockDmi>::parse_addr_len(b"80000000,5"), Some((0x8000_0000, 5)));
        assert_eq!(RspServer::<MockDmi>::parse_addr_len(b"garbage"), None);
    }

    #[test]
    fn control_c_halts_and_sends_the_raw_dcsr_cause_as_stop_reason() {
        // §8 scenario 5: haltreq (dcsr.cause = 3) halting via ^C sends
        // exactly one `$T03#...`, the raw cause value, not a mapped signal.
        let mut dmi = MockDmi::new();
        dmi.poke(addr::DMSTATUS, 1 << 9); // allhalted
        dmi.poke(addr::DATA0, 3 << 6); // dcsr.cause = HALTREQ
        let mut backend = Backend::new(dmi, 32, PollingBudget::default());
        backend.init().unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (mut server_stream, _) = listener.accept().unwrap();

        let mut server = RspServer::new(&mut backend, 32, 1_000_000);
        server.session.on_resume(RunMode::Continue);
        server.handle_control_c(&mut server_stream).unwrap();

        assert_eq!(server.session.run_mode, RunMode::Paused);
        assert!(!server.session.waiting_for_stop_reason);

        client.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"$T03#b7");
    }

    #[test]
    fn dispatch_of_unknown_command_byte_is_an_empty_packet() {
        let mut backend = initialized_backend();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (mut server_stream, _) = listener.accept().unwrap();
        drop(client);
        let mut server = RspServer::new(&mut backend, 32, 1_000_000);
        // `dispatch` itself never blocks on reads, so a throwaway connected
        // socket is enough to exercise the write side.
        let action = server.dispatch(&mut server_stream, b"zzz");
        assert!(action.is_ok());
    }
}
