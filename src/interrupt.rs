//! Asynchronous interrupts delivered at instruction boundaries.

/// Interrupt codes are reported in mcause/scause with the top bit set.
pub const MASK_INTERRUPT_BIT: u64 = 1 << 63;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoftwareInterrupt,
    MachineSoftwareInterrupt,
    SupervisorTimerInterrupt,
    MachineTimerInterrupt,
    SupervisorExternalInterrupt,
    MachineExternalInterrupt,
}

impl Interrupt {
    /// The cause value as written to mcause/scause, interrupt bit included.
    pub fn code(self) -> u64 {
        use Interrupt::*;
        match self {
            SupervisorSoftwareInterrupt => 1 | MASK_INTERRUPT_BIT,
            MachineSoftwareInterrupt => 3 | MASK_INTERRUPT_BIT,
            SupervisorTimerInterrupt => 5 | MASK_INTERRUPT_BIT,
            MachineTimerInterrupt => 7 | MASK_INTERRUPT_BIT,
            SupervisorExternalInterrupt => 9 | MASK_INTERRUPT_BIT,
            MachineExternalInterrupt => 11 | MASK_INTERRUPT_BIT,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_has_interrupt_bit() {
        let code = Interrupt::SupervisorExternalInterrupt.code();
        assert_eq!(code & MASK_INTERRUPT_BIT, MASK_INTERRUPT_BIT);
        assert_eq!(code & !MASK_INTERRUPT_BIT, 9);
    }
}
