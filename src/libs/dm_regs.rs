//! Bitfield codecs for the RISC-V External Debug Support (v0.13) Debug
//! Module registers this stub programs over DMI: `dmcontrol`, `dmstatus`,
//! `abstractcs`, `command`, `sbcs` and `dcsr`.
//!
//! Field layouts follow the RISC-V External Debug Support v0.13 register
//! map; the address map lives in [`addr`].

use bitfield::bitfield;

/// DMI address map (word addresses, not byte addresses).
pub mod addr {
    pub const DATA0: u16 = 0x04;
    pub const DATA1: u16 = 0x05;
    pub const DATA11: u16 = 0x0f;
    pub const DMCONTROL: u16 = 0x10;
    pub const DMSTATUS: u16 = 0x11;
    pub const HARTINFO: u16 = 0x12;
    pub const HALTSUM: u16 = 0x13;
    pub const ABSTRACTCS: u16 = 0x16;
    pub const COMMAND: u16 = 0x17;
    pub const ABSTRACTAUTO: u16 = 0x18;
    pub const PROGBUF0: u16 = 0x20;
    pub const SBCS: u16 = 0x38;
    pub const SBADDRESS0: u16 = 0x39;
    pub const SBADDRESS1: u16 = 0x3a;
    pub const SBADDRESS2: u16 = 0x3b;
    pub const SBDATA0: u16 = 0x3c;
    pub const SBDATA1: u16 = 0x3d;
    pub const SBDATA2: u16 = 0x3e;
    pub const SBDATA3: u16 = 0x3f;
    /// Non-standard: implementers must tolerate DMs that ignore a write here.
    pub const VERBOSITY: u16 = 0x60;

    /// Debug CSRs, addressed through the Abstract Command `regno` space.
    pub const DCSR: u16 = 0x7b0;
    pub const DPC: u16 = 0x7b1;
    pub const DSCRATCH0: u16 = 0x7b2;
    pub const DSCRATCH1: u16 = 0x7b3;

    /// `regno` base offsets for the Abstract Command register space.
    pub const REGNO_GPR_BASE: u16 = 0x1000;
    pub const REGNO_FPR_BASE: u16 = 0x1020;
}

bitfield! {
    /// `dmcontrol` — §3: halt/resume/reset request register.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Dmcontrol(u32);
    impl Debug;
    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub ackhavereset, set_ackhavereset: 28;
    pub hasel, set_hasel: 26;
    pub hartsello, set_hartsello: 25, 16;
    pub hartselhi, set_hartselhi: 15, 6;
    pub setresethaltreq, set_setresethaltreq: 3;
    pub clrresethaltreq, set_clrresethaltreq: 2;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl Dmcontrol {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Dmcontrol(bits)
    }
}

bitfield! {
    /// `dmstatus` — §3: read-only hart/DM status flags.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Dmstatus(u32);
    impl Debug;
    pub anyhavereset, _: 18;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub allhalted, _: 9;
    pub version, _: 3, 0;
}

impl Dmstatus {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Dmstatus(bits)
    }

    /// `true` when this Debug Module speaks v0.13 of the External Debug
    /// Support register map.
    pub fn is_v0_13(self) -> bool {
        self.version() == 2
    }
}

/// `abstractcs.cmderr` — §3, write-1-to-clear with value 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdErr {
    None,
    Busy,
    NotSupported,
    Exception,
    HaltResume,
    Bus,
    Reserved,
    Other,
}

impl CmdErr {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => CmdErr::None,
            1 => CmdErr::Busy,
            2 => CmdErr::NotSupported,
            3 => CmdErr::Exception,
            4 => CmdErr::HaltResume,
            5 => CmdErr::Bus,
            6 => CmdErr::Reserved,
            _ => CmdErr::Other,
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(self, CmdErr::None)
    }
}

bitfield! {
    /// `abstractcs` — §3: Abstract Command status/control.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Abstractcs(u32);
    impl Debug;
    pub progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub cmderr_bits, set_cmderr_bits: 10, 8;
    pub datacount, _: 4, 0;
}

impl Abstractcs {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Abstractcs(bits)
    }

    pub fn cmderr(self) -> CmdErr {
        CmdErr::from_bits(self.cmderr_bits())
    }

    /// A write carrying `cmderr = 7` into the live register clears it (W1C).
    pub fn clear_cmderr() -> u32 {
        let mut cs = Abstractcs(0);
        cs.set_cmderr_bits(0x7);
        cs.bits()
    }
}

/// `command.size` field for an Access-Register command, §3/§4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Lower32 = 2,
    Lower64 = 3,
}

bitfield! {
    /// `command` in its Access-Register form — §3.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Command(u32);
    impl Debug;
    pub cmdtype, set_cmdtype: 31, 24;
    pub size, set_size: 22, 20;
    pub aarpostincrement, set_aarpostincrement: 19;
    pub postexec, set_postexec: 18;
    pub transfer, set_transfer: 17;
    pub write, set_write: 16;
    pub regno, set_regno: 15, 0;
}

impl Command {
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Builds an Access-Register command to transfer `regno`.
    pub fn access_register(size: AccessSize, write: bool, regno: u16) -> Self {
        let mut cmd = Command(0);
        cmd.set_cmdtype(0);
        cmd.set_size(size as u32);
        cmd.set_transfer(true);
        cmd.set_write(write);
        cmd.set_regno(regno as u32);
        cmd
    }
}

/// `sbcs.sberror` — §3, write 7 to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbError {
    None,
    Timeout,
    BadAddr,
    Alignment,
    UnsupportedSize,
    Other,
}

impl SbError {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => SbError::None,
            1 => SbError::Timeout,
            2 => SbError::BadAddr,
            3 => SbError::Alignment,
            4 => SbError::UnsupportedSize,
            _ => SbError::Other,
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(self, SbError::None)
    }
}

/// `sbcs.sbaccess` field encoding, §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbAccess {
    Bits8 = 0,
    Bits16 = 1,
    Bits32 = 2,
    Bits64 = 3,
    Bits128 = 4,
}

bitfield! {
    /// `sbcs` — §3: System Bus access control/status.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Sbcs(u32);
    impl Debug;
    pub sbversion, _: 31, 29;
    pub sbbusyerror, set_sbbusyerror: 22;
    pub sbbusy, _: 21;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub sbaccess, set_sbaccess: 19, 17;
    pub sbautoincrement, set_sbautoincrement: 16;
    pub sbreadondata, set_sbreadondata: 15;
    pub sberror_bits, set_sberror_bits: 14, 12;
    pub sbasize, _: 11, 5;
}

impl Sbcs {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Sbcs(bits)
    }

    pub fn sberror(self) -> SbError {
        SbError::from_bits(self.sberror_bits())
    }

    /// A 32-bit-wide autoincrementing read configuration, §4.3 `mem_read` step 2.
    pub fn for_read(access: SbAccess) -> Self {
        let mut cs = Sbcs(0);
        cs.set_sbreadonaddr(true);
        cs.set_sbaccess(access as u32);
        cs.set_sbautoincrement(true);
        cs.set_sbreadondata(true);
        cs.set_sberror_bits(0x7);
        cs.set_sbbusyerror(true);
        cs
    }

    /// A 32-bit-wide autoincrementing write configuration, §4.3 `mem_write` step 2.
    pub fn for_write(access: SbAccess) -> Self {
        let mut cs = Sbcs(0);
        cs.set_sbreadonaddr(false);
        cs.set_sbaccess(access as u32);
        cs.set_sbautoincrement(true);
        cs
    }

    /// Write-1-to-clear value for `sberror`/`sbbusyerror` only.
    pub fn clear_errors() -> u32 {
        let mut cs = Sbcs(0);
        cs.set_sberror_bits(0x7);
        cs.set_sbbusyerror(true);
        cs.bits()
    }
}

/// `dcsr.cause` — §4.3 `get_stop_reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltCause {
    Ebreak,
    Trigger,
    Haltreq,
    Step,
    Reserved(u32),
}

impl HaltCause {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            1 => HaltCause::Ebreak,
            2 => HaltCause::Trigger,
            3 => HaltCause::Haltreq,
            4 => HaltCause::Step,
            other => HaltCause::Reserved(other),
        }
    }

    /// The raw `dcsr.cause` value, as sent verbatim in the `T%02x`
    /// stop-reply, §6.
    pub fn code(self) -> u8 {
        match self {
            HaltCause::Ebreak => 1,
            HaltCause::Trigger => 2,
            HaltCause::Haltreq => 3,
            HaltCause::Step => 4,
            HaltCause::Reserved(other) => other as u8,
        }
    }
}

bitfield! {
    /// `dcsr` — §3: Debug Control and Status CSR.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Dcsr(u32);
    impl Debug;
    pub xdebugver, _: 31, 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub stepie, set_stepie: 11;
    pub stopcount, set_stopcount: 10;
    pub stoptime, set_stoptime: 9;
    pub cause_bits, _: 8, 6;
    pub mprven, set_mprven: 4;
    pub nmip, _: 3;
    pub step, set_step: 2;
    pub prv, set_prv: 1, 0;
}

impl Dcsr {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Dcsr(bits)
    }

    pub fn cause(self) -> HaltCause {
        HaltCause::from_bits(self.cause_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmcontrol_hart_select_round_trips() {
        let mut dmcontrol = Dmcontrol::from_bits(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_haltreq(true);
        dmcontrol.set_hartsello(0x3ff);
        assert!(dmcontrol.dmactive());
        assert!(dmcontrol.haltreq());
        assert_eq!(dmcontrol.hartsello(), 0x3ff);
        assert!(!dmcontrol.resumereq());
    }

    #[test]
    fn dmstatus_reports_v0_13() {
        let status = Dmstatus::from_bits(0b0010);
        assert!(status.is_v0_13());
        assert_eq!(Dmstatus::from_bits(0).version(), 0);
        assert!(!Dmstatus::from_bits(0).is_v0_13());
    }

    #[test]
    fn abstractcs_decodes_cmderr_and_clears() {
        let cs = Abstractcs::from_bits(0x3 << 8);
        assert_eq!(cs.cmderr(), CmdErr::Exception);
        assert!(cs.cmderr().is_error());
        assert_eq!(Abstractcs::clear_cmderr(), 0x7 << 8);
    }

    #[test]
    fn command_access_register_encodes_rv64_gpr_read() {
        let cmd = Command::access_register(AccessSize::Lower64, false, addr::REGNO_GPR_BASE + 2);
        assert_eq!(cmd.bits(), 0x0032_1002);
    }

    #[test]
    fn command_access_register_encodes_rv32_pc_write() {
        let cmd = Command::access_register(AccessSize::Lower32, true, addr::DPC);
        assert_eq!(cmd.bits(), 0x0023_07b1);
    }

    #[test]
    fn sbcs_read_config_sets_expected_bits() {
        let cs = Sbcs::for_read(SbAccess::Bits32);
        assert!(cs.sbreadonaddr());
        assert!(cs.sbautoincrement());
        assert!(cs.sbreadondata());
        assert_eq!(cs.sberror(), SbError::Other);
        assert!(cs.sbbusyerror());
    }

    #[test]
    fn dcsr_cause_decodes_known_values() {
        let mut dcsr = Dcsr::from_bits(0);
        dcsr.set_step(true);
        assert!(dcsr.step());
        assert_eq!(Dcsr::from_bits(3 << 6).cause(), HaltCause::Haltreq);
        assert_eq!(Dcsr::from_bits(1 << 6).cause(), HaltCause::Ebreak);
    }
}
