//! Synchronous exceptions raised by decode, the bus, or the page walker.

use thiserror::Error;

/// A RISC-V exception together with its trap value (the faulting address,
/// or the offending instruction word for `IllegalInstruction`).
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    #[error("instruction address misaligned {0:#x}")]
    InstructionAddrMisaligned(u64),
    #[error("instruction access fault {0:#x}")]
    InstructionAccessFault(u64),
    #[error("illegal instruction {0:#x}")]
    IllegalInstruction(u64),
    #[error("breakpoint {0:#x}")]
    Breakpoint(u64),
    #[error("load address misaligned {0:#x}")]
    LoadAddrMisaligned(u64),
    #[error("load access fault {0:#x}")]
    LoadAccessFault(u64),
    #[error("store or AMO address misaligned {0:#x}")]
    StoreAMOAddrMisaligned(u64),
    #[error("store or AMO access fault {0:#x}")]
    StoreAMOAccessFault(u64),
    #[error("environment call from U-mode at {0:#x}")]
    EnvironmentCallFromUMode(u64),
    #[error("environment call from S-mode at {0:#x}")]
    EnvironmentCallFromSMode(u64),
    #[error("environment call from M-mode at {0:#x}")]
    EnvironmentCallFromMMode(u64),
    #[error("instruction page fault {0:#x}")]
    InstructionPageFault(u64),
    #[error("load page fault {0:#x}")]
    LoadPageFault(u64),
    #[error("store or AMO page fault {0:#x}")]
    StoreAMOPageFault(u64),
}

use Exception::*;

impl Exception {
    /// The trap value written to mtval/stval.
    pub fn value(self) -> u64 {
        match self {
            InstructionAddrMisaligned(addr) => addr,
            InstructionAccessFault(addr) => addr,
            IllegalInstruction(inst) => inst,
            Breakpoint(pc) => pc,
            LoadAddrMisaligned(addr) => addr,
            LoadAccessFault(addr) => addr,
            StoreAMOAddrMisaligned(addr) => addr,
            StoreAMOAccessFault(addr) => addr,
            EnvironmentCallFromUMode(pc) => pc,
            EnvironmentCallFromSMode(pc) => pc,
            EnvironmentCallFromMMode(pc) => pc,
            InstructionPageFault(addr) => addr,
            LoadPageFault(addr) => addr,
            StoreAMOPageFault(addr) => addr,
        }
    }

    /// The exception code written to mcause/scause.
    pub fn code(self) -> u64 {
        match self {
            InstructionAddrMisaligned(_) => 0,
            InstructionAccessFault(_) => 1,
            IllegalInstruction(_) => 2,
            Breakpoint(_) => 3,
            LoadAddrMisaligned(_) => 4,
            LoadAccessFault(_) => 5,
            StoreAMOAddrMisaligned(_) => 6,
            StoreAMOAccessFault(_) => 7,
            EnvironmentCallFromUMode(_) => 8,
            EnvironmentCallFromSMode(_) => 9,
            EnvironmentCallFromMMode(_) => 11,
            InstructionPageFault(_) => 12,
            LoadPageFault(_) => 13,
            StoreAMOPageFault(_) => 15,
        }
    }

    /// Fatal exceptions terminate the run loop after trap delivery.
    /// Page faults, environment calls and breakpoints resume at the
    /// trap vector instead.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            InstructionAddrMisaligned(_)
                | InstructionAccessFault(_)
                | IllegalInstruction(_)
                | LoadAccessFault(_)
                | StoreAMOAddrMisaligned(_)
                | StoreAMOAccessFault(_)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_and_value() {
        let e = Exception::IllegalInstruction(0xdead);
        assert_eq!(e.code(), 2);
        assert_eq!(e.value(), 0xdead);
        assert!(e.is_fatal());

        let e = Exception::LoadPageFault(0x8000_0000);
        assert_eq!(e.code(), 13);
        assert!(!e.is_fatal());

        let e = Exception::EnvironmentCallFromSMode(0x8000_0004);
        assert_eq!(e.code(), 9);
        assert!(!e.is_fatal());
    }
}
