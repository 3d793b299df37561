//! The Debug-Module back end: maps logical debugger operations onto
//! sequences of DMI register reads/writes against a v0.13 RISC-V External
//! Debug Support Debug Module.
//!
//! Halt/resume/single-step drive `dmcontrol`/`dmstatus` polling; register
//! access goes through the Abstract Command protocol (`data0`/`data1` +
//! `command`) against any [`DmiTransport`]; memory access goes through the
//! System-Bus protocol (`sbcs`/`sbaddress*`/`sbdata*`).

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::libs::dm_regs::{
    addr, AccessSize, Abstractcs, CmdErr, Command, Dcsr, Dmcontrol, Dmstatus, HaltCause, SbAccess,
    SbError, Sbcs,
};
use crate::libs::dmi::{DmiError, DmiTransport};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("DMI transport failure: {0}")]
    DmiFailure(#[from] DmiError),
    #[error("busy-poll deadline exceeded polling {0}")]
    Busy(&'static str),
    #[error("abstract command failed: {0:?}")]
    CmdErr(CmdErr),
    #[error("system bus access failed: {0:?}")]
    SbError(SbError),
    #[error("back end used before init()")]
    NotInitialized,
    #[error("Debug Module reports unsupported spec version (dmstatus.version={0})")]
    UnsupportedDmVersion(u32),
}

/// Busy-poll and resume-settle contracts, §4.3/§5.
/// [`Config`](crate::libs::config::Config) may override the defaults below
/// for tests against slower simulated Debug Modules.
#[derive(Debug, Clone, Copy)]
pub struct PollingBudget {
    pub busy_poll_sleep: Duration,
    pub busy_poll_deadline_iters: u32,
    pub resume_settle_delay: Duration,
}

impl Default for PollingBudget {
    fn default() -> Self {
        PollingBudget {
            busy_poll_sleep: Duration::from_micros(1),
            busy_poll_deadline_iters: 1_000_000,
            resume_settle_delay: Duration::from_micros(10),
        }
    }
}

/// Outcome of a stop-reason poll, §4.3 "Get-stop-reason".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Halted(HaltCause),
    Running,
    Timeout,
}

/// Run-mode state machine, §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Paused,
    PauseRequested,
    Step,
    Continue,
}

/// Which register space a `regno` addresses, §3's regnum offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Gpr(u16),
    Fpr(u16),
    Csr(u16),
    Pc,
}

impl RegClass {
    fn dm_regnum(self) -> u16 {
        match self {
            RegClass::Gpr(n) => addr::REGNO_GPR_BASE + n,
            RegClass::Fpr(n) => addr::REGNO_FPR_BASE + n,
            RegClass::Csr(n) => n,
            RegClass::Pc => addr::DPC,
        }
    }
}

/// The Debug-Module command layer, generic over any [`DmiTransport`].
///
/// All entry points besides [`Backend::init`] are no-ops returning `Ok`
/// when the back end has not been initialized, so the front end can be
/// smoke-tested without hardware attached (§4.3 "Initialization").
pub struct Backend<T: DmiTransport> {
    dmi: T,
    xlen: u32,
    budget: PollingBudget,
    initialized: bool,
    halt_poll_iters: u32,
    cpu_timeout_iters: u32,
}

impl<T: DmiTransport> Backend<T> {
    pub fn new(dmi: T, xlen: u32, budget: PollingBudget) -> Self {
        Backend {
            dmi,
            xlen,
            budget,
            initialized: false,
            halt_poll_iters: 0,
            cpu_timeout_iters: budget.busy_poll_deadline_iters,
        }
    }

    pub fn xlen(&self) -> u32 {
        self.xlen
    }

    /// Switches the register access width for subsequent commands, §8
    /// boundary case "xlen switch from 64 to 32 between commands".
    pub fn set_xlen(&mut self, xlen: u32) {
        debug_assert!(xlen == 32 || xlen == 64, "xlen must be 32 or 64");
        self.xlen = xlen;
    }

    pub fn init(&mut self) -> Result<(), BackendError> {
        self.initialized = true;
        debug!(xlen = self.xlen, "back end initialized");
        Ok(())
    }

    /// Writes the non-standard verbosity scalar at `addr::VERBOSITY`, §6:
    /// implementers must tolerate DMs that ignore it.
    pub fn set_verbosity(&mut self, level: u32) -> Result<(), BackendError> {
        self.guard()?;
        self.write_reg(addr::VERBOSITY, level)
    }

    fn guard(&self) -> Result<(), BackendError> {
        if self.initialized {
            Ok(())
        } else {
            Err(BackendError::NotInitialized)
        }
    }

    fn read_reg(&mut self, a: u16) -> Result<u32, BackendError> {
        Ok(self.dmi.dmi_read(a)?)
    }

    fn write_reg(&mut self, a: u16, v: u32) -> Result<(), BackendError> {
        Ok(self.dmi.dmi_write(a, v)?)
    }

    /// Polls `abstractcs.busy==0`, §4.3 step 4. Clears `cmderr` (W1C) and
    /// surfaces an error if it came back nonzero.
    fn poll_abstractcs_idle(&mut self) -> Result<(), BackendError> {
        let mut iters = 0u32;
        loop {
            let cs = Abstractcs::from_bits(self.read_reg(addr::ABSTRACTCS)?);
            if !cs.busy() {
                if cs.cmderr().is_error() {
                    warn!(cmderr = ?cs.cmderr(), "abstractcs.cmderr set, clearing");
                    self.write_reg(addr::ABSTRACTCS, Abstractcs::clear_cmderr())?;
                    return Err(BackendError::CmdErr(cs.cmderr()));
                }
                return Ok(());
            }
            iters += 1;
            if iters >= self.budget.busy_poll_deadline_iters {
                return Err(BackendError::Busy("abstractcs.busy"));
            }
            thread::sleep(self.budget.busy_poll_sleep);
        }
    }

    fn poll_sbcs_idle(&mut self) -> Result<Sbcs, BackendError> {
        let mut iters = 0u32;
        loop {
            let cs = Sbcs::from_bits(self.read_reg(addr::SBCS)?);
            if !cs.sbbusy() {
                return Ok(cs);
            }
            iters += 1;
            if iters >= self.budget.busy_poll_deadline_iters {
                return Err(BackendError::Busy("sbcs.sbbusy"));
            }
            thread::sleep(self.budget.busy_poll_sleep);
        }
    }

    fn poll_dmstatus<F: Fn(Dmstatus) -> bool>(
        &mut self,
        what: &'static str,
        done: F,
    ) -> Result<(), BackendError> {
        let mut iters = 0u32;
        loop {
            let status = Dmstatus::from_bits(self.read_reg(addr::DMSTATUS)?);
            if done(status) {
                return Ok(());
            }
            iters += 1;
            if iters >= self.budget.busy_poll_deadline_iters {
                return Err(BackendError::Busy(what));
            }
            thread::sleep(self.budget.busy_poll_sleep);
        }
    }

    // ---- Reset operations, §4.3 "Reset operations" ----

    pub fn dm_reset(&mut self) -> Result<(), BackendError> {
        self.guard()?;
        self.write_reg(addr::DMCONTROL, 0)?;
        self.poll_abstractcs_idle()?;
        let status = Dmstatus::from_bits(self.read_reg(addr::DMSTATUS)?);
        if !status.is_v0_13() {
            return Err(BackendError::UnsupportedDmVersion(status.version()));
        }
        Ok(())
    }

    pub fn ndm_reset(&mut self, haltreq: bool) -> Result<(), BackendError> {
        self.guard()?;
        let mut dmcontrol = Dmcontrol::from_bits(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_ndmreset(true);
        dmcontrol.set_haltreq(haltreq);
        self.write_reg(addr::DMCONTROL, dmcontrol.bits())?;
        dmcontrol.set_ndmreset(false);
        self.write_reg(addr::DMCONTROL, dmcontrol.bits())?;
        self.poll_dmstatus("dmstatus.anyunavail", |s| !s.anyunavail())
    }

    pub fn hart_reset(&mut self, haltreq: bool) -> Result<(), BackendError> {
        self.guard()?;
        let mut dmcontrol = Dmcontrol::from_bits(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartreset(true);
        dmcontrol.set_haltreq(haltreq);
        self.write_reg(addr::DMCONTROL, dmcontrol.bits())?;
        self.poll_dmstatus("dmstatus.anyhavereset", |s| !s.anyhavereset())
    }

    // ---- Register read/write, §4.3 "Register read/write" ----

    fn reg_rw(&mut self, dm_regnum: u16, write: Option<u64>) -> Result<u64, BackendError> {
        self.guard()?;
        if let Some(value) = write {
            self.write_reg(addr::DATA0, value as u32)?;
            if self.xlen == 64 {
                self.write_reg(addr::DATA1, (value >> 32) as u32)?;
            }
        }
        let size = if self.xlen == 32 {
            AccessSize::Lower32
        } else {
            AccessSize::Lower64
        };
        let cmd = Command::access_register(size, write.is_some(), dm_regnum);
        self.write_reg(addr::COMMAND, cmd.bits())?;
        self.poll_abstractcs_idle()?;
        if write.is_some() {
            return Ok(0);
        }
        let low = self.read_reg(addr::DATA0)? as u64;
        let high = if self.xlen == 64 {
            self.read_reg(addr::DATA1)? as u64
        } else {
            0
        };
        Ok((high << 32) | low)
    }

    pub fn reg_read(&mut self, class: RegClass) -> Result<u64, BackendError> {
        let value = self.reg_rw(class.dm_regnum(), None)?;
        trace!(?class, value, "reg_read");
        Ok(value)
    }

    pub fn reg_write(&mut self, class: RegClass, value: u64) -> Result<(), BackendError> {
        trace!(?class, value, "reg_write");
        self.reg_rw(class.dm_regnum(), Some(value)).map(|_| ())
    }

    // ---- Memory access, §4.3 "Memory read"/"Memory write" ----

    pub fn mem_read(&mut self, address: u64, len: usize) -> Result<Vec<u8>, BackendError> {
        self.guard()?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let addr4 = address & !3;
        let addr_lim4 = (address + len as u64 + 3) & !3;

        self.poll_sbcs_idle()?;
        self.write_reg(addr::SBCS, Sbcs::for_read(SbAccess::Bits32).bits())?;
        if self.xlen == 64 {
            self.write_reg(addr::SBADDRESS1, (addr4 >> 32) as u32)?;
        }
        self.write_reg(addr::SBADDRESS0, addr4 as u32)?;

        let mut out = Vec::with_capacity(len);
        let mut cursor = addr4;
        while cursor < addr_lim4 {
            self.poll_sbcs_idle()?;
            let word = self.read_reg(addr::SBDATA0)?.to_le_bytes();
            let lo = if cursor == addr4 {
                (address - addr4) as usize
            } else {
                0
            };
            let hi = if cursor + 4 == addr_lim4 {
                (address + len as u64 - cursor) as usize
            } else {
                4
            };
            out.extend_from_slice(&word[lo..hi]);
            cursor += 4;
        }

        let final_cs = self.poll_sbcs_idle()?;
        if final_cs.sbbusyerror() || final_cs.sberror().is_error() {
            self.write_reg(addr::SBCS, Sbcs::clear_errors())?;
            return Err(BackendError::SbError(final_cs.sberror()));
        }
        Ok(out)
    }

    fn sb_write_word(&mut self, word_addr: u64, value: u32) -> Result<(), BackendError> {
        self.poll_sbcs_idle()?;
        self.write_reg(addr::SBCS, Sbcs::for_write(SbAccess::Bits32).bits())?;
        if self.xlen == 64 {
            self.write_reg(addr::SBADDRESS1, (word_addr >> 32) as u32)?;
        }
        self.write_reg(addr::SBADDRESS0, word_addr as u32)?;
        self.write_reg(addr::SBDATA0, value)?;
        Ok(())
    }

    fn read_modify_write_word(&mut self, word_addr: u64, patch: &[(usize, u8)]) -> Result<(), BackendError> {
        let existing = self.mem_read(word_addr, 4)?;
        let mut word = [existing[0], existing[1], existing[2], existing[3]];
        for &(offset, byte) in patch {
            word[offset] = byte;
        }
        self.sb_write_word(word_addr, u32::from_le_bytes(word))
    }

    pub fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<(), BackendError> {
        self.guard()?;
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let addr4 = address & !3;
        let addr_lim4 = (address + len + 3) & !3;
        let aligned_start = if address % 4 == 0 { addr4 } else { addr4 + 4 };
        let aligned_end = (address + len) & !3;

        if address % 4 != 0 {
            let unaligned_count = (aligned_start - address).min(len) as usize;
            let patch: Vec<(usize, u8)> = (0..unaligned_count)
                .map(|i| ((address - addr4) as usize + i, data[i]))
                .collect();
            self.read_modify_write_word(addr4, &patch)?;
        }

        if aligned_start < aligned_end {
            self.poll_sbcs_idle()?;
            self.write_reg(addr::SBCS, Sbcs::for_write(SbAccess::Bits32).bits())?;
            if self.xlen == 64 {
                self.write_reg(addr::SBADDRESS1, (aligned_start >> 32) as u32)?;
            }
            self.write_reg(addr::SBADDRESS0, aligned_start as u32)?;
            let mut cursor = aligned_start;
            while cursor < aligned_end {
                let offset = (cursor - address) as usize;
                let word = [
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ];
                self.poll_sbcs_idle()?;
                self.write_reg(addr::SBDATA0, u32::from_le_bytes(word))?;
                cursor += 4;
            }
        }

        if aligned_end < addr_lim4 && address + len > aligned_end {
            let trailing_offset = (aligned_end - address) as usize;
            let patch: Vec<(usize, u8)> = data[trailing_offset..]
                .iter()
                .enumerate()
                .map(|(i, &b)| (i, b))
                .collect();
            self.read_modify_write_word(aligned_end, &patch)?;
        }

        let final_cs = self.poll_sbcs_idle()?;
        if final_cs.sbbusyerror() || final_cs.sberror().is_error() {
            self.write_reg(addr::SBCS, Sbcs::clear_errors())?;
            return Err(BackendError::SbError(final_cs.sberror()));
        }
        Ok(())
    }

    // ---- Run control, §4.3 "Continue / Step / Stop" ----

    pub fn resume(&mut self) -> Result<RunMode, BackendError> {
        self.guard()?;
        let mut dcsr = Dcsr::from_bits(self.reg_rw(addr::DCSR, None)? as u32);
        if dcsr.step() {
            dcsr.set_step(false);
            self.reg_rw(addr::DCSR, Some(dcsr.bits() as u64))?;
        }
        let mut dmcontrol = Dmcontrol::from_bits(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_resumereq(true);
        self.write_reg(addr::DMCONTROL, dmcontrol.bits())?;
        self.halt_poll_iters = 0;
        thread::sleep(self.budget.resume_settle_delay);
        Ok(RunMode::Continue)
    }

    pub fn step(&mut self) -> Result<RunMode, BackendError> {
        self.guard()?;
        let mut dcsr = Dcsr::from_bits(self.reg_rw(addr::DCSR, None)? as u32);
        if !dcsr.step() {
            dcsr.set_step(true);
            self.reg_rw(addr::DCSR, Some(dcsr.bits() as u64))?;
        }
        let mut dmcontrol = Dmcontrol::from_bits(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_resumereq(true);
        self.write_reg(addr::DMCONTROL, dmcontrol.bits())?;
        self.poll_dmstatus("dmstatus.allhalted (step)", |s| s.allhalted())?;
        Ok(RunMode::Paused)
    }

    pub fn stop(&mut self) -> Result<RunMode, BackendError> {
        self.guard()?;
        let mut dmcontrol = Dmcontrol::from_bits(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_haltreq(true);
        self.write_reg(addr::DMCONTROL, dmcontrol.bits())?;
        self.poll_dmstatus("dmstatus.allhalted (stop)", |s| s.allhalted())?;
        Ok(RunMode::Paused)
    }

    /// Non-blocking stop-reason poll, §4.3 "Get-stop-reason". Advances the
    /// internal `CPU_TIMEOUT` counter across calls made while `CONTINUE`.
    pub fn get_stop_reason(&mut self) -> Result<StopReason, BackendError> {
        self.guard()?;
        let status = Dmstatus::from_bits(self.read_reg(addr::DMSTATUS)?);
        if status.allhalted() {
            self.halt_poll_iters = 0;
            let dcsr = Dcsr::from_bits(self.reg_rw(addr::DCSR, None)? as u32);
            return Ok(StopReason::Halted(dcsr.cause()));
        }
        self.halt_poll_iters += 1;
        if self.halt_poll_iters >= self.cpu_timeout_iters {
            return Ok(StopReason::Timeout);
        }
        Ok(StopReason::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::dm_regs::addr;
    use crate::libs::dmi::MockDmi;

    fn initialized_backend() -> Backend<MockDmi> {
        let mut dmi = MockDmi::new();
        dmi.poke(addr::DMSTATUS, 0b0010);
        let mut backend = Backend::new(dmi, 32, PollingBudget::default());
        backend.init().unwrap();
        backend
    }

    #[test]
    fn rejects_calls_before_init() {
        let mut backend = Backend::new(MockDmi::new(), 32, PollingBudget::default());
        assert!(matches!(backend.dm_reset(), Err(BackendError::NotInitialized)));
    }

    #[test]
    fn reg_write_then_read_round_trips_through_mock_dmi() {
        let mut backend = initialized_backend();
        backend
            .reg_write(RegClass::Gpr(2), 0x00000000_dead_beef)
            .unwrap();
        let value = backend.reg_read(RegClass::Gpr(2)).unwrap();
        assert_eq!(value, 0x00000000_dead_beef);
    }

    #[test]
    fn mem_write_then_read_round_trips_an_aligned_word() {
        // MockDmi is a flat DMI register echo, not a simulated target
        // memory array indexed by sbaddress — it can only faithfully
        // stand in for a single aligned System-Bus word per transaction.
        let mut backend = initialized_backend();
        let data = [0xAAu8, 0xBB, 0xCC, 0xDD];
        backend.mem_write(0x2000, &data).unwrap();
        let read_back = backend.mem_read(0x2000, data.len()).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn dm_reset_rejects_pre_v0_13_debug_module() {
        let mut dmi = MockDmi::new();
        dmi.poke(addr::DMSTATUS, 0);
        let mut backend = Backend::new(dmi, 32, PollingBudget::default());
        backend.init().unwrap();
        assert!(matches!(
            backend.dm_reset(),
            Err(BackendError::UnsupportedDmVersion(0))
        ));
    }

    #[test]
    fn get_stop_reason_reports_running_then_halted() {
        let mut backend = initialized_backend();
        assert_eq!(backend.get_stop_reason().unwrap(), StopReason::Running);

        // allhalted (bit 9) set, dcsr.cause = STEP (4), surfaced via data0
        // on the abstract-command read that get_stop_reason issues.
        backend.dmi.poke(addr::DMSTATUS, 1 << 9);
        backend.dmi.poke(addr::DATA0, 4 << 6);
        match backend.get_stop_reason().unwrap() {
            StopReason::Halted(HaltCause::Step) => {}
            other => panic!("expected Halted(Step), got {other:?}"),
        }
    }
}
