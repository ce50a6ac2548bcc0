//! The hart: architectural registers, decode/execute, the trap engine,
//! the Sv39 page walker, and the virtio disk request pipeline.

use log::error;

use crate::bus::Bus;
use crate::csr::Csr;
use crate::exception::Exception;
use crate::interrupt::{Interrupt, MASK_INTERRUPT_BIT};
use crate::param::*;
use crate::virtqueue::*;

/// Privilege modes, comparable by privilege level.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

/// What a translation is for; selects the page-fault kind on failure.
#[derive(Debug, Copy, Clone)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

fn page_fault(access_type: AccessType, addr: u64) -> Exception {
    match access_type {
        AccessType::Instruction => Exception::InstructionPageFault(addr),
        AccessType::Load => Exception::LoadPageFault(addr),
        AccessType::Store => Exception::StoreAMOPageFault(addr),
    }
}

const RVABI: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2",
    "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7",
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

/// A single RV64 hart wired to the system bus.
pub struct Cpu {
    /// 32 64-bit integer registers. x0 is hardwired to zero.
    pub regs: [u64; 32],
    /// Program counter.
    pub pc: u64,
    /// Current privilege mode.
    pub mode: Mode,
    /// System bus connecting DRAM and the peripherals.
    pub bus: Bus,
    /// Control and status registers.
    pub csr: Csr,
    /// Sv39 paging enable, derived from satp.
    enable_paging: bool,
    /// Physical base of the root page table, derived from satp.
    page_table: u64,
}

impl Cpu {
    /// `code` lands at `DRAM_BASE` where execution starts; `disk_image`
    /// backs the virtio block device.
    pub fn new(code: Vec<u8>, disk_image: Vec<u8>) -> Self {
        let mut regs = [0; 32];
        regs[2] = DRAM_END; // sp
        Self {
            regs,
            pc: DRAM_BASE,
            mode: Mode::Machine,
            bus: Bus::new(code, disk_image),
            csr: Csr::new(),
            enable_paging: false,
            page_table: 0,
        }
    }

    /// Look up a register by ABI name, `xN`, `pc`, or CSR name.
    pub fn reg(&self, r: &str) -> u64 {
        match RVABI.iter().position(|&x| x == r) {
            Some(i) => self.regs[i],
            None => match r {
                "pc" => self.pc,
                "fp" => self.reg("s0"),
                r if r.starts_with('x') => {
                    if let Ok(i) = r[1..].parse::<usize>() {
                        if i <= 31 {
                            return self.regs[i];
                        }
                    }
                    panic!("Invalid register {}", r);
                }
                "mhartid" => self.csr.load(MHARTID),
                "mstatus" => self.csr.load(MSTATUS),
                "mtvec" => self.csr.load(MTVEC),
                "mepc" => self.csr.load(MEPC),
                "mcause" => self.csr.load(MCAUSE),
                "mtval" => self.csr.load(MTVAL),
                "medeleg" => self.csr.load(MEDELEG),
                "mscratch" => self.csr.load(MSCRATCH),
                "mip" => self.csr.load(MIP),
                "mcounteren" => self.csr.load(MCOUNTEREN),
                "sstatus" => self.csr.load(SSTATUS),
                "stvec" => self.csr.load(STVEC),
                "sepc" => self.csr.load(SEPC),
                "scause" => self.csr.load(SCAUSE),
                "stval" => self.csr.load(STVAL),
                "sscratch" => self.csr.load(SSCRATCH),
                "sip" => self.csr.load(SIP),
                "satp" => self.csr.load(SATP),
                _ => panic!("Invalid register {}", r),
            },
        }
    }

    pub fn dump_pc(&self) {
        println!("{:-^100}", "PC register");
        println!("PC = {:#x}\n", self.pc);
    }

    pub fn dump_registers(&mut self) {
        println!("{:-^100}", "registers");
        let mut output = String::new();
        self.regs[0] = 0;
        for i in (0..32).step_by(4) {
            let i0 = format!("x{}", i);
            let i1 = format!("x{}", i + 1);
            let i2 = format!("x{}", i + 2);
            let i3 = format!("x{}", i + 3);
            let line = format!(
                "{:3}({:^4}) = {:<#18x} {:3}({:^4}) = {:<#18x} {:3}({:^4}) = {:<#18x} {:3}({:^4}) = {:<#18x}\n",
                i0, RVABI[i], self.regs[i],
                i1, RVABI[i + 1], self.regs[i + 1],
                i2, RVABI[i + 2], self.regs[i + 2],
                i3, RVABI[i + 3], self.regs[i + 3],
            );
            output = output + &line;
        }
        println!("{}", output);
    }

    pub fn dump_csrs(&self) {
        self.csr.dump_csrs();
    }

    /// Recompute the paging state after a write to satp.
    fn update_paging(&mut self, csr_addr: usize) {
        if csr_addr != SATP {
            return;
        }
        let satp = self.csr.load(SATP);
        self.page_table = (satp & MASK_PPN) * PAGE_SIZE;
        // MODE field 8 selects Sv39; everything else leaves paging off.
        self.enable_paging = satp >> 60 == 8;
    }

    /// Translate a virtual address through the Sv39 three-level walk.
    ///
    /// Permission, U/G and A/D bits are not enforced.
    /// TODO: enforce them before running untrusted guest code.
    pub fn translate(&mut self, addr: u64, access_type: AccessType) -> Result<u64, Exception> {
        if !self.enable_paging {
            return Ok(addr);
        }

        let levels = 3;
        let vpn = [
            (addr >> 12) & 0x1ff,
            (addr >> 21) & 0x1ff,
            (addr >> 30) & 0x1ff,
        ];

        let mut a = self.page_table;
        let mut i: i64 = levels - 1;
        let mut pte;
        loop {
            pte = self.bus.load(a + vpn[i as usize] * 8, 64)?;
            let v = pte & 1;
            let r = (pte >> 1) & 1;
            let w = (pte >> 2) & 1;
            let x = (pte >> 3) & 1;
            if v == 0 || (r == 0 && w == 1) {
                return Err(page_fault(access_type, addr));
            }
            if r == 1 || x == 1 {
                // Leaf PTE.
                break;
            }
            i -= 1;
            let ppn = (pte >> 10) & MASK_PPN;
            a = ppn * PAGE_SIZE;
            if i < 0 {
                return Err(page_fault(access_type, addr));
            }
        }

        // The 9/9/26-bit PPN fields of the leaf PTE.
        let ppn = [
            (pte >> 10) & 0x1ff,
            (pte >> 19) & 0x1ff,
            (pte >> 28) & 0x03ff_ffff,
        ];

        let offset = addr & 0xfff;
        match i {
            0 => {
                let ppn = (pte >> 10) & MASK_PPN;
                Ok((ppn << 12) | offset)
            }
            // Superpage: the low virtual page number bits pass through.
            1 | 2 => Ok((ppn[2] << 30) | (ppn[1] << 21) | (vpn[0] << 12) | offset),
            _ => Err(page_fault(access_type, addr)),
        }
    }

    /// Load a value through address translation and the bus.
    pub fn load(&mut self, addr: u64, size: u64) -> Result<u64, Exception> {
        let p_addr = self.translate(addr, AccessType::Load)?;
        self.bus.load(p_addr, size)
    }

    /// Store a value through address translation and the bus.
    pub fn store(&mut self, addr: u64, size: u64, value: u64) -> Result<(), Exception> {
        let p_addr = self.translate(addr, AccessType::Store)?;
        self.bus.store(p_addr, size, value)
    }

    /// Fetch the instruction word at the current pc.
    pub fn fetch(&mut self) -> Result<u64, Exception> {
        let p_pc = self.translate(self.pc, AccessType::Instruction)?;
        match self.bus.load(p_pc, 32) {
            Ok(inst) => Ok(inst),
            Err(_) => Err(Exception::InstructionAccessFault(self.pc)),
        }
    }

    /// Common trap entry for exceptions and interrupts: pick the target
    /// privilege's CSR quartet, redirect the pc, and shuffle the
    /// PIE/IE/PP status fields.
    fn take_trap(&mut self, cause: u64, tval: u64, trap_in_s_mode: bool, is_interrupt: bool) {
        let pc = self.pc;
        let prev_mode = self.mode;
        let (status, tvec, cause_reg, tval_reg, epc, mask_pie, pie_i, mask_ie, ie_i, mask_pp, pp_i) =
            if trap_in_s_mode {
                self.mode = Mode::Supervisor;
                (SSTATUS, STVEC, SCAUSE, STVAL, SEPC, MASK_SPIE, 5, MASK_SIE, 1, MASK_SPP, 8)
            } else {
                self.mode = Mode::Machine;
                (MSTATUS, MTVEC, MCAUSE, MTVAL, MEPC, MASK_MPIE, 7, MASK_MIE, 3, MASK_MPP, 11)
            };

        // The tvec BASE is 4-byte aligned; mode bits live in tvec[1:0].
        // Synchronous traps always go to BASE. Interrupts go to
        // BASE + 4 * cause when tvec selects vectored mode.
        let tvec_value = self.csr.load(tvec);
        let base = tvec_value & !0b11;
        self.pc = if is_interrupt && tvec_value & 0b11 == 1 {
            base + 4 * (cause & !MASK_INTERRUPT_BIT)
        } else {
            base
        };

        self.csr.store(epc, pc);
        self.csr.store(cause_reg, cause);
        self.csr.store(tval_reg, tval);

        let mut status_value = self.csr.load(status);
        let ie = (status_value & mask_ie) >> ie_i;
        // xPIE <- xIE; xIE <- 0; xPP <- previous mode.
        status_value = (status_value & !mask_pie) | (ie << pie_i);
        status_value &= !mask_ie;
        status_value = (status_value & !mask_pp) | ((prev_mode as u64) << pp_i);
        self.csr.store(status, status_value);
    }

    /// Deliver a synchronous exception, honoring medeleg.
    pub fn handle_exception(&mut self, e: Exception) {
        let cause = e.code();
        let trap_in_s_mode = self.mode <= Mode::Supervisor && self.csr.is_medelegated(cause);
        self.take_trap(cause, e.value(), trap_in_s_mode, false);
    }

    /// Deliver an interrupt, honoring mideleg. The trap value is zero.
    pub fn handle_interrupt(&mut self, interrupt: Interrupt) {
        let cause = interrupt.code();
        let trap_in_s_mode = self.mode <= Mode::Supervisor
            && self.csr.is_midelegated(cause & !MASK_INTERRUPT_BIT);
        self.take_trap(cause, 0, trap_in_s_mode, true);
    }

    /// Poll the devices and the mip/mie pair for one deliverable
    /// interrupt, highest priority first.
    pub fn check_pending_interrupt(&mut self) -> Option<Interrupt> {
        use Interrupt::*;
        // Interrupts are globally masked while xIE = 0 in the current
        // privilege mode; lower-privilege modes are always interruptible
        // from above.
        if self.mode == Mode::Machine && self.csr.load(MSTATUS) & MASK_MIE == 0 {
            return None;
        }
        if self.mode == Mode::Supervisor && self.csr.load(SSTATUS) & MASK_SIE == 0 {
            return None;
        }

        if self.bus.uart.is_interrupting() {
            self.bus.store(PLIC_SCLAIM, 32, UART_IRQ).unwrap();
            self.csr.store(MIP, self.csr.load(MIP) | MASK_SEIP);
        } else if self.bus.virtio.is_interrupting() {
            if let Err(e) = self.disk_access() {
                error!("virtio: malformed virtqueue: {}", e);
            }
            self.bus.store(PLIC_SCLAIM, 32, VIRTIO_IRQ).unwrap();
            self.csr.store(MIP, self.csr.load(MIP) | MASK_SEIP);
        }

        // Priority order: MEI, MSI, MTI, SEI, SSI, STI.
        let pending = self.csr.load(MIE) & self.csr.load(MIP);

        if pending & MASK_MEIP != 0 {
            self.csr.store(MIP, self.csr.load(MIP) & !MASK_MEIP);
            return Some(MachineExternalInterrupt);
        }
        if pending & MASK_MSIP != 0 {
            self.csr.store(MIP, self.csr.load(MIP) & !MASK_MSIP);
            return Some(MachineSoftwareInterrupt);
        }
        if pending & MASK_MTIP != 0 {
            self.csr.store(MIP, self.csr.load(MIP) & !MASK_MTIP);
            return Some(MachineTimerInterrupt);
        }
        if pending & MASK_SEIP != 0 {
            self.csr.store(MIP, self.csr.load(MIP) & !MASK_SEIP);
            return Some(SupervisorExternalInterrupt);
        }
        if pending & MASK_SSIP != 0 {
            self.csr.store(MIP, self.csr.load(MIP) & !MASK_SSIP);
            return Some(SupervisorSoftwareInterrupt);
        }
        if pending & MASK_STIP != 0 {
            self.csr.store(MIP, self.csr.load(MIP) & !MASK_STIP);
            return Some(SupervisorTimerInterrupt);
        }
        None
    }

    /// Serve one virtio block request from the queue the driver notified.
    ///
    /// Legacy virtqueue layout in guest memory:
    /// ------------------------------------------------------------------
    /// Descriptor Table | Available Ring | (...padding...) | Used Ring
    /// ------------------------------------------------------------------
    pub fn disk_access(&mut self) -> Result<(), Exception> {
        let desc_addr = self.bus.virtio.desc_addr();
        let avail_addr = desc_addr + DESC_NUM as u64 * VIRTQ_DESC_SIZE;
        let used_addr = desc_addr + PAGE_SIZE;

        // avail.idx points at the ring slot holding the head descriptor
        // index for this request.
        let idx = self.bus.load(avail_addr + VIRTQ_AVAIL_IDX, 16)?;
        let slot = avail_addr + VIRTQ_AVAIL_RING + (idx % DESC_NUM as u64) * 2;
        let head = self.bus.load(slot, 16)?;

        // The head descriptor points at the request header, which holds
        // the sector number and the transfer direction. Its next field
        // links to the data descriptor.
        let head_desc = desc_addr + head * VIRTQ_DESC_SIZE;
        let req_addr = self.bus.load(head_desc + VIRTQ_DESC_ADDR, 64)?;
        let sector = self.bus.load(req_addr + VIRTIO_BLK_REQ_SECTOR, 64)?;
        let iotype = self.bus.load(req_addr + VIRTIO_BLK_REQ_IOTYPE, 32)? as u32;
        let next = self.bus.load(head_desc + VIRTQ_DESC_NEXT, 16)?;

        // The data descriptor names the guest buffer.
        let data_desc = desc_addr + next * VIRTQ_DESC_SIZE;
        let buf_addr = self.bus.load(data_desc + VIRTQ_DESC_ADDR, 64)?;
        let len = self.bus.load(data_desc + VIRTQ_DESC_LEN, 32)?;

        match iotype {
            VIRTIO_BLK_T_OUT => {
                for i in 0..len {
                    let data = self.bus.load(buf_addr + i, 8)?;
                    self.bus.virtio.write_disk(sector * SECTOR_SIZE + i, data);
                }
            }
            VIRTIO_BLK_T_IN => {
                for i in 0..len {
                    let data = self.bus.virtio.read_disk(sector * SECTOR_SIZE + i);
                    self.bus.store(buf_addr + i, 8, data)?;
                }
            }
            t => error!("virtio: unknown request type {}", t),
        }

        let new_id = self.bus.virtio.get_new_id();
        self.bus
            .store(used_addr + VIRTQ_USED_IDX, 16, new_id % DESC_NUM as u64)?;
        Ok(())
    }

    #[inline]
    fn update_pc(&self) -> Result<u64, Exception> {
        Ok(self.pc + 4)
    }

    /// Decode and execute one instruction, returning the next pc.
    pub fn execute(&mut self, inst: u64) -> Result<u64, Exception> {
        let next_pc = self.exec(inst)?;
        // x0 is hardwired to zero.
        self.regs[0] = 0;
        Ok(next_pc)
    }

    fn exec(&mut self, inst: u64) -> Result<u64, Exception> {
        let opcode = inst & 0x0000007f;
        let rd = ((inst & 0x00000f80) >> 7) as usize;
        let rs1 = ((inst & 0x000f8000) >> 15) as usize;
        let rs2 = ((inst & 0x01f00000) >> 20) as usize;
        let funct3 = (inst & 0x00007000) >> 12;
        let funct7 = (inst & 0xfe000000) >> 25;

        self.regs[0] = 0;

        match opcode {
            0x03 => {
                // imm[11:0] = inst[31:20]
                let imm = ((inst as i32 as i64) >> 20) as u64;
                let addr = self.regs[rs1].wrapping_add(imm);
                match funct3 {
                    0x0 => {
                        // lb
                        let val = self.load(addr, 8)?;
                        self.regs[rd] = val as i8 as i64 as u64;
                        self.update_pc()
                    }
                    0x1 => {
                        // lh
                        let val = self.load(addr, 16)?;
                        self.regs[rd] = val as i16 as i64 as u64;
                        self.update_pc()
                    }
                    0x2 => {
                        // lw
                        let val = self.load(addr, 32)?;
                        self.regs[rd] = val as i32 as i64 as u64;
                        self.update_pc()
                    }
                    0x3 => {
                        // ld
                        let val = self.load(addr, 64)?;
                        self.regs[rd] = val;
                        self.update_pc()
                    }
                    0x4 => {
                        // lbu
                        let val = self.load(addr, 8)?;
                        self.regs[rd] = val;
                        self.update_pc()
                    }
                    0x5 => {
                        // lhu
                        let val = self.load(addr, 16)?;
                        self.regs[rd] = val;
                        self.update_pc()
                    }
                    0x6 => {
                        // lwu
                        let val = self.load(addr, 32)?;
                        self.regs[rd] = val;
                        self.update_pc()
                    }
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x0f => {
                // fence is a no-op: a single in-order hart already sees
                // all of its own accesses in program order.
                match funct3 {
                    0x0 => self.update_pc(),
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x13 => {
                // imm[11:0] = inst[31:20]
                let imm = ((inst & 0xfff00000) as i32 as i64 >> 20) as u64;
                // The shift amount is the low 6 bits of the immediate.
                let shamt = (imm & 0x3f) as u32;
                match funct3 {
                    0x0 => {
                        // addi
                        self.regs[rd] = self.regs[rs1].wrapping_add(imm);
                        self.update_pc()
                    }
                    0x1 => {
                        // slli
                        self.regs[rd] = self.regs[rs1] << shamt;
                        self.update_pc()
                    }
                    0x2 => {
                        // slti
                        self.regs[rd] = if (self.regs[rs1] as i64) < (imm as i64) { 1 } else { 0 };
                        self.update_pc()
                    }
                    0x3 => {
                        // sltiu
                        self.regs[rd] = if self.regs[rs1] < imm { 1 } else { 0 };
                        self.update_pc()
                    }
                    0x4 => {
                        // xori
                        self.regs[rd] = self.regs[rs1] ^ imm;
                        self.update_pc()
                    }
                    0x5 => match funct7 >> 1 {
                        0x00 => {
                            // srli
                            self.regs[rd] = self.regs[rs1].wrapping_shr(shamt);
                            self.update_pc()
                        }
                        0x10 => {
                            // srai
                            self.regs[rd] = (self.regs[rs1] as i64).wrapping_shr(shamt) as u64;
                            self.update_pc()
                        }
                        _ => Err(Exception::IllegalInstruction(inst)),
                    },
                    0x6 => {
                        // ori
                        self.regs[rd] = self.regs[rs1] | imm;
                        self.update_pc()
                    }
                    0x7 => {
                        // andi
                        self.regs[rd] = self.regs[rs1] & imm;
                        self.update_pc()
                    }
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x17 => {
                // auipc
                let imm = (inst & 0xfffff000) as i32 as i64 as u64;
                self.regs[rd] = self.pc.wrapping_add(imm);
                self.update_pc()
            }
            0x1b => {
                let imm = ((inst as i32 as i64) >> 20) as u64;
                // Word-width shifts take a 5-bit shift amount.
                let shamt = (imm & 0x1f) as u32;
                match funct3 {
                    0x0 => {
                        // addiw
                        self.regs[rd] = self.regs[rs1].wrapping_add(imm) as i32 as i64 as u64;
                        self.update_pc()
                    }
                    0x1 => {
                        // slliw
                        self.regs[rd] = self.regs[rs1].wrapping_shl(shamt) as i32 as i64 as u64;
                        self.update_pc()
                    }
                    0x5 => match funct7 {
                        0x00 => {
                            // srliw
                            self.regs[rd] =
                                (self.regs[rs1] as u32).wrapping_shr(shamt) as i32 as i64 as u64;
                            self.update_pc()
                        }
                        0x20 => {
                            // sraiw
                            self.regs[rd] =
                                (self.regs[rs1] as i32).wrapping_shr(shamt) as i64 as u64;
                            self.update_pc()
                        }
                        _ => Err(Exception::IllegalInstruction(inst)),
                    },
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x23 => {
                // imm[11:5|4:0] = inst[31:25|11:7]
                let imm = (((inst & 0xfe000000) as i32 as i64 >> 20) as u64) | ((inst >> 7) & 0x1f);
                let addr = self.regs[rs1].wrapping_add(imm);
                match funct3 {
                    0x0 => {
                        // sb
                        self.store(addr, 8, self.regs[rs2])?;
                        self.update_pc()
                    }
                    0x1 => {
                        // sh
                        self.store(addr, 16, self.regs[rs2])?;
                        self.update_pc()
                    }
                    0x2 => {
                        // sw
                        self.store(addr, 32, self.regs[rs2])?;
                        self.update_pc()
                    }
                    0x3 => {
                        // sd
                        self.store(addr, 64, self.regs[rs2])?;
                        self.update_pc()
                    }
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x2f => {
                // RV64A. The load-modify-store below is one architectural
                // step; interrupts are only polled at instruction
                // boundaries, so it is atomic from the guest's view.
                let funct5 = (funct7 & 0b1111100) >> 2;
                let _aq = (funct7 & 0b0000010) >> 1;
                let _rl = funct7 & 0b0000001;
                match (funct3, funct5) {
                    (0x2, 0x00) => {
                        // amoadd.w
                        let t = self.load(self.regs[rs1], 32)?;
                        self.store(self.regs[rs1], 32, t.wrapping_add(self.regs[rs2]))?;
                        self.regs[rd] = t;
                        self.update_pc()
                    }
                    (0x3, 0x00) => {
                        // amoadd.d
                        let t = self.load(self.regs[rs1], 64)?;
                        self.store(self.regs[rs1], 64, t.wrapping_add(self.regs[rs2]))?;
                        self.regs[rd] = t;
                        self.update_pc()
                    }
                    (0x2, 0x01) => {
                        // amoswap.w
                        let t = self.load(self.regs[rs1], 32)?;
                        self.store(self.regs[rs1], 32, self.regs[rs2])?;
                        self.regs[rd] = t;
                        self.update_pc()
                    }
                    (0x3, 0x01) => {
                        // amoswap.d
                        let t = self.load(self.regs[rs1], 64)?;
                        self.store(self.regs[rs1], 64, self.regs[rs2])?;
                        self.regs[rd] = t;
                        self.update_pc()
                    }
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x33 => {
                // For register-register shifts only the low 6 bits of rs2
                // count in RV64I.
                let shamt = (self.regs[rs2] & 0x3f) as u32;
                match (funct3, funct7) {
                    (0x0, 0x00) => {
                        // add
                        self.regs[rd] = self.regs[rs1].wrapping_add(self.regs[rs2]);
                        self.update_pc()
                    }
                    (0x0, 0x01) => {
                        // mul
                        self.regs[rd] = self.regs[rs1].wrapping_mul(self.regs[rs2]);
                        self.update_pc()
                    }
                    (0x0, 0x20) => {
                        // sub
                        self.regs[rd] = self.regs[rs1].wrapping_sub(self.regs[rs2]);
                        self.update_pc()
                    }
                    (0x1, 0x00) => {
                        // sll
                        self.regs[rd] = self.regs[rs1].wrapping_shl(shamt);
                        self.update_pc()
                    }
                    (0x2, 0x00) => {
                        // slt
                        self.regs[rd] = if (self.regs[rs1] as i64) < (self.regs[rs2] as i64) {
                            1
                        } else {
                            0
                        };
                        self.update_pc()
                    }
                    (0x3, 0x00) => {
                        // sltu
                        self.regs[rd] = if self.regs[rs1] < self.regs[rs2] { 1 } else { 0 };
                        self.update_pc()
                    }
                    (0x4, 0x00) => {
                        // xor
                        self.regs[rd] = self.regs[rs1] ^ self.regs[rs2];
                        self.update_pc()
                    }
                    (0x5, 0x00) => {
                        // srl
                        self.regs[rd] = self.regs[rs1].wrapping_shr(shamt);
                        self.update_pc()
                    }
                    (0x5, 0x20) => {
                        // sra
                        self.regs[rd] = (self.regs[rs1] as i64).wrapping_shr(shamt) as u64;
                        self.update_pc()
                    }
                    (0x6, 0x00) => {
                        // or
                        self.regs[rd] = self.regs[rs1] | self.regs[rs2];
                        self.update_pc()
                    }
                    (0x7, 0x00) => {
                        // and
                        self.regs[rd] = self.regs[rs1] & self.regs[rs2];
                        self.update_pc()
                    }
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x37 => {
                // lui
                self.regs[rd] = (inst & 0xfffff000) as i32 as i64 as u64;
                self.update_pc()
            }
            0x3b => {
                // Word-width register shifts take rs2[4:0].
                let shamt = (self.regs[rs2] & 0x1f) as u32;
                match (funct3, funct7) {
                    (0x0, 0x00) => {
                        // addw
                        self.regs[rd] =
                            self.regs[rs1].wrapping_add(self.regs[rs2]) as i32 as i64 as u64;
                        self.update_pc()
                    }
                    (0x0, 0x20) => {
                        // subw
                        self.regs[rd] =
                            self.regs[rs1].wrapping_sub(self.regs[rs2]) as i32 as u64;
                        self.update_pc()
                    }
                    (0x1, 0x00) => {
                        // sllw
                        self.regs[rd] = (self.regs[rs1] as u32).wrapping_shl(shamt) as i32 as u64;
                        self.update_pc()
                    }
                    (0x5, 0x00) => {
                        // srlw
                        self.regs[rd] = (self.regs[rs1] as u32).wrapping_shr(shamt) as i32 as u64;
                        self.update_pc()
                    }
                    (0x5, 0x01) => {
                        // divu
                        self.regs[rd] = match self.regs[rs2] {
                            0 => u64::MAX,
                            divisor => self.regs[rs1].wrapping_div(divisor),
                        };
                        self.update_pc()
                    }
                    (0x5, 0x20) => {
                        // sraw
                        self.regs[rd] = ((self.regs[rs1] as i32) >> (shamt as i32)) as u64;
                        self.update_pc()
                    }
                    (0x7, 0x01) => {
                        // remuw
                        self.regs[rd] = match self.regs[rs2] {
                            0 => self.regs[rs1],
                            divisor => {
                                let dividend = self.regs[rs1] as u32;
                                (dividend.wrapping_rem(divisor as u32)) as i32 as u64
                            }
                        };
                        self.update_pc()
                    }
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            0x63 => {
                // imm[12|10:5|4:1|11] = inst[31|30:25|11:8|7]
                let imm = (((inst & 0x80000000) as i32 as i64 >> 19) as u64)
                    | ((inst & 0x80) << 4) // imm[11]
                    | ((inst >> 20) & 0x7e0) // imm[10:5]
                    | ((inst >> 7) & 0x1e); // imm[4:1]

                let taken = match funct3 {
                    0x0 => self.regs[rs1] == self.regs[rs2], // beq
                    0x1 => self.regs[rs1] != self.regs[rs2], // bne
                    0x4 => (self.regs[rs1] as i64) < (self.regs[rs2] as i64), // blt
                    0x5 => (self.regs[rs1] as i64) >= (self.regs[rs2] as i64), // bge
                    0x6 => self.regs[rs1] < self.regs[rs2],  // bltu
                    0x7 => self.regs[rs1] >= self.regs[rs2], // bgeu
                    _ => return Err(Exception::IllegalInstruction(inst)),
                };
                if taken {
                    return Ok(self.pc.wrapping_add(imm));
                }
                self.update_pc()
            }
            0x67 => {
                // jalr
                let t = self.pc + 4;
                let imm = (((inst & 0xfff00000) as i32 as i64) >> 20) as u64;
                let new_pc = self.regs[rs1].wrapping_add(imm) & !1;
                self.regs[rd] = t;
                Ok(new_pc)
            }
            0x6f => {
                // jal
                self.regs[rd] = self.pc + 4;
                // imm[20|10:1|11|19:12] = inst[31|30:21|20|19:12]
                let imm = (((inst & 0x80000000) as i32 as i64 >> 11) as u64) // imm[20]
                    | (inst & 0xff000) // imm[19:12]
                    | ((inst >> 9) & 0x800) // imm[11]
                    | ((inst >> 20) & 0x7fe); // imm[10:1]
                Ok(self.pc.wrapping_add(imm))
            }
            0x73 => {
                let csr_addr = ((inst & 0xfff00000) >> 20) as usize;
                match funct3 {
                    0x0 => {
                        match (rs2, funct7) {
                            (0x0, 0x0) => {
                                // ecall: epc is set to the address of the
                                // ecall itself, not the next instruction.
                                match self.mode {
                                    Mode::User => {
                                        Err(Exception::EnvironmentCallFromUMode(self.pc))
                                    }
                                    Mode::Supervisor => {
                                        Err(Exception::EnvironmentCallFromSMode(self.pc))
                                    }
                                    Mode::Machine => {
                                        Err(Exception::EnvironmentCallFromMMode(self.pc))
                                    }
                                }
                            }
                            (0x1, 0x0) => {
                                // ebreak
                                Err(Exception::Breakpoint(self.pc))
                            }
                            (0x2, 0x8) => {
                                // sret: return to the mode stashed in
                                // SPP, restoring the interrupt enable.
                                let mut sstatus = self.csr.load(SSTATUS);
                                self.mode = if (sstatus & MASK_SPP) >> 8 == 1 {
                                    Mode::Supervisor
                                } else {
                                    Mode::User
                                };
                                let spie = (sstatus & MASK_SPIE) >> 5;
                                // SIE <- SPIE; SPIE <- 1; SPP <- U.
                                sstatus = (sstatus & !MASK_SIE) | (spie << 1);
                                sstatus |= MASK_SPIE;
                                sstatus &= !MASK_SPP;
                                self.csr.store(SSTATUS, sstatus);
                                // sepc[1:0] is masked on the implicit read.
                                Ok(self.csr.load(SEPC) & !0b11)
                            }
                            (0x2, 0x18) => {
                                // mret
                                let mut mstatus = self.csr.load(MSTATUS);
                                self.mode = match (mstatus & MASK_MPP) >> 11 {
                                    0 => Mode::User,
                                    1 => Mode::Supervisor,
                                    _ => Mode::Machine,
                                };
                                let mpie = (mstatus & MASK_MPIE) >> 7;
                                // MIE <- MPIE; MPIE <- 1; MPP <- U; MPRV <- 0.
                                mstatus = (mstatus & !MASK_MIE) | (mpie << 3);
                                mstatus |= MASK_MPIE;
                                mstatus &= !MASK_MPP;
                                mstatus &= !MASK_MPRV;
                                self.csr.store(MSTATUS, mstatus);
                                Ok(self.csr.load(MEPC) & !0b11)
                            }
                            (0x5, 0x8) => {
                                // wfi: pending interrupts are picked up at
                                // the next instruction boundary anyway.
                                self.update_pc()
                            }
                            (_, 0x9) => {
                                // sfence.vma: no TLB to flush.
                                self.update_pc()
                            }
                            _ => Err(Exception::IllegalInstruction(inst)),
                        }
                    }
                    0x1 => {
                        // csrrw
                        let t = self.csr.load(csr_addr);
                        self.csr.store(csr_addr, self.regs[rs1]);
                        self.regs[rd] = t;
                        self.update_paging(csr_addr);
                        self.update_pc()
                    }
                    0x2 => {
                        // csrrs
                        let t = self.csr.load(csr_addr);
                        self.csr.store(csr_addr, t | self.regs[rs1]);
                        self.regs[rd] = t;
                        self.update_paging(csr_addr);
                        self.update_pc()
                    }
                    0x3 => {
                        // csrrc
                        let t = self.csr.load(csr_addr);
                        self.csr.store(csr_addr, t & !self.regs[rs1]);
                        self.regs[rd] = t;
                        self.update_paging(csr_addr);
                        self.update_pc()
                    }
                    0x5 => {
                        // csrrwi
                        let zimm = rs1 as u64;
                        self.regs[rd] = self.csr.load(csr_addr);
                        self.csr.store(csr_addr, zimm);
                        self.update_paging(csr_addr);
                        self.update_pc()
                    }
                    0x6 => {
                        // csrrsi
                        let zimm = rs1 as u64;
                        let t = self.csr.load(csr_addr);
                        self.csr.store(csr_addr, t | zimm);
                        self.regs[rd] = t;
                        self.update_paging(csr_addr);
                        self.update_pc()
                    }
                    0x7 => {
                        // csrrci
                        let zimm = rs1 as u64;
                        let t = self.csr.load(csr_addr);
                        self.csr.store(csr_addr, t & !zimm);
                        self.regs[rd] = t;
                        self.update_paging(csr_addr);
                        self.update_pc()
                    }
                    _ => Err(Exception::IllegalInstruction(inst)),
                }
            }
            _ => Err(Exception::IllegalInstruction(inst)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Hand-rolled encoders; enough coverage of the ISA formats to write
    // programs without an external assembler.
    fn r_type(funct7: u32, rs2: usize, rs1: usize, funct3: u32, rd: usize, opcode: u32) -> u32 {
        funct7 << 25
            | (rs2 as u32) << 20
            | (rs1 as u32) << 15
            | funct3 << 12
            | (rd as u32) << 7
            | opcode
    }

    fn i_type(imm: i32, rs1: usize, funct3: u32, rd: usize, opcode: u32) -> u32 {
        ((imm as u32) & 0xfff) << 20
            | (rs1 as u32) << 15
            | funct3 << 12
            | (rd as u32) << 7
            | opcode
    }

    fn s_type(imm: i32, rs2: usize, rs1: usize, funct3: u32) -> u32 {
        let imm = imm as u32;
        ((imm >> 5) & 0x7f) << 25
            | (rs2 as u32) << 20
            | (rs1 as u32) << 15
            | funct3 << 12
            | (imm & 0x1f) << 7
            | 0x23
    }

    fn b_type(imm: i32, rs2: usize, rs1: usize, funct3: u32) -> u32 {
        let imm = imm as u32;
        ((imm >> 12) & 1) << 31
            | ((imm >> 5) & 0x3f) << 25
            | (rs2 as u32) << 20
            | (rs1 as u32) << 15
            | funct3 << 12
            | ((imm >> 1) & 0xf) << 8
            | ((imm >> 11) & 1) << 7
            | 0x63
    }

    fn u_type(imm: u32, rd: usize, opcode: u32) -> u32 {
        imm << 12 | (rd as u32) << 7 | opcode
    }

    fn j_type(imm: i32, rd: usize) -> u32 {
        let imm = imm as u32;
        ((imm >> 20) & 1) << 31
            | ((imm >> 1) & 0x3ff) << 21
            | ((imm >> 11) & 1) << 20
            | ((imm >> 12) & 0xff) << 12
            | (rd as u32) << 7
            | 0x6f
    }

    fn addi(rd: usize, rs1: usize, imm: i32) -> u32 {
        i_type(imm, rs1, 0x0, rd, 0x13)
    }
    fn lui(rd: usize, imm20: u32) -> u32 {
        u_type(imm20, rd, 0x37)
    }
    fn auipc(rd: usize, imm20: u32) -> u32 {
        u_type(imm20, rd, 0x17)
    }
    fn jal(rd: usize, offset: i32) -> u32 {
        j_type(offset, rd)
    }
    fn jalr(rd: usize, rs1: usize, imm: i32) -> u32 {
        i_type(imm, rs1, 0x0, rd, 0x67)
    }
    fn blt(rs1: usize, rs2: usize, offset: i32) -> u32 {
        b_type(offset, rs2, rs1, 0x4)
    }
    fn lb(rd: usize, rs1: usize, imm: i32) -> u32 {
        i_type(imm, rs1, 0x0, rd, 0x03)
    }
    fn lh(rd: usize, rs1: usize, imm: i32) -> u32 {
        i_type(imm, rs1, 0x1, rd, 0x03)
    }
    fn ld(rd: usize, rs1: usize, imm: i32) -> u32 {
        i_type(imm, rs1, 0x3, rd, 0x03)
    }
    fn sd(rs2: usize, rs1: usize, imm: i32) -> u32 {
        s_type(imm, rs2, rs1, 0x3)
    }
    fn srli(rd: usize, rs1: usize, shamt: i32) -> u32 {
        i_type(shamt, rs1, 0x5, rd, 0x13)
    }
    fn srai(rd: usize, rs1: usize, shamt: i32) -> u32 {
        i_type(0x400 | shamt, rs1, 0x5, rd, 0x13)
    }
    fn addw(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(0x00, rs2, rs1, 0x0, rd, 0x3b)
    }
    fn mul(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(0x01, rs2, rs1, 0x0, rd, 0x33)
    }
    fn divu(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(0x01, rs2, rs1, 0x5, rd, 0x3b)
    }
    fn remuw(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(0x01, rs2, rs1, 0x7, rd, 0x3b)
    }
    fn amoadd_d(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(0x00, rs2, rs1, 0x3, rd, 0x2f)
    }
    fn amoswap_d(rd: usize, rs1: usize, rs2: usize) -> u32 {
        r_type(0x04, rs2, rs1, 0x3, rd, 0x2f)
    }
    fn csrrw(rd: usize, csr: usize, rs1: usize) -> u32 {
        i_type(csr as i32, rs1, 0x1, rd, 0x73)
    }
    fn csrrs(rd: usize, csr: usize, rs1: usize) -> u32 {
        i_type(csr as i32, rs1, 0x2, rd, 0x73)
    }
    fn csrrc(rd: usize, csr: usize, rs1: usize) -> u32 {
        i_type(csr as i32, rs1, 0x3, rd, 0x73)
    }
    fn csrrwi(rd: usize, csr: usize, zimm: usize) -> u32 {
        i_type(csr as i32, zimm, 0x5, rd, 0x73)
    }
    fn csrrsi(rd: usize, csr: usize, zimm: usize) -> u32 {
        i_type(csr as i32, zimm, 0x6, rd, 0x73)
    }
    fn csrrci(rd: usize, csr: usize, zimm: usize) -> u32 {
        i_type(csr as i32, zimm, 0x7, rd, 0x73)
    }

    const ECALL: u32 = 0x00000073;
    const SRET: u32 = 0x10200073;
    const MRET: u32 = 0x30200073;
    const WFI: u32 = 0x10500073;
    const SFENCE_VMA: u32 = 0x12000073;
    const FENCE: u32 = 0x0000000f;

    /// Load a program at DRAM_BASE and step it `n_steps` times, stopping
    /// early on any exception.
    fn run_cpu(code: &[u32], n_steps: usize) -> Cpu {
        let mut bytes = Vec::new();
        for inst in code {
            bytes.extend_from_slice(&inst.to_le_bytes());
        }
        let mut cpu = Cpu::new(bytes, vec![]);
        for _ in 0..n_steps {
            let inst = match cpu.fetch() {
                Ok(inst) => inst,
                Err(_) => break,
            };
            match cpu.execute(inst) {
                Ok(new_pc) => cpu.pc = new_pc,
                Err(_) => break,
            }
        }
        cpu
    }

    macro_rules! riscv_test {
        ( $code:expr, $clock:expr, $($reg:expr => $expect:expr),* $(,)? ) => {{
            let cpu = run_cpu(&$code, $clock);
            $(assert_eq!(cpu.reg($reg), $expect, "register {}", $reg);)*
        }};
    }

    #[test]
    fn test_addi() {
        riscv_test!([addi(31, 0, 42)], 1, "x31" => 42, "pc" => DRAM_BASE + 4);
    }

    #[test]
    fn test_lui() {
        riscv_test!([lui(10, 42)], 1, "a0" => 42 << 12);
    }

    #[test]
    fn test_auipc() {
        riscv_test!([auipc(10, 42)], 1, "a0" => DRAM_BASE + (42 << 12));
    }

    #[test]
    fn test_jal() {
        riscv_test!([jal(10, 42)], 1, "a0" => DRAM_BASE + 4, "pc" => DRAM_BASE + 42);
    }

    #[test]
    fn test_jalr() {
        riscv_test!(
            [addi(11, 0, 42), jalr(10, 11, -8)],
            2,
            "a0" => DRAM_BASE + 8,
            "pc" => 34,
        );
    }

    #[test]
    fn test_blt() {
        riscv_test!(
            [addi(1, 0, 10), addi(2, 0, 20), blt(1, 2, 42)],
            3,
            "pc" => DRAM_BASE + 8 + 42,
        );
    }

    #[test]
    fn test_store_load() {
        riscv_test!(
            [
                addi(8, 0, 256),
                addi(2, 2, -16),
                sd(8, 2, 8),
                lb(6, 2, 8),
                lh(7, 2, 8),
            ],
            5,
            "t1" => 0,
            "t2" => 256,
        );
    }

    #[test]
    fn test_sra_srl() {
        riscv_test!(
            [addi(10, 0, -8), srai(13, 10, 2), srli(14, 10, 2)],
            3,
            "a3" => -2i64 as u64,
            "a4" => (-8i64 as u64) >> 2,
        );
    }

    #[test]
    fn test_word_op() {
        riscv_test!(
            [addi(10, 0, 42), lui(11, 0x7f000), addw(12, 10, 11)],
            3,
            "a2" => 0x7f00002a,
        );
    }

    #[test]
    fn test_mul() {
        riscv_test!(
            [addi(10, 0, 6), addi(11, 0, 7), mul(12, 10, 11)],
            3,
            "a2" => 42,
        );
    }

    #[test]
    fn test_divu_remuw() {
        riscv_test!(
            [addi(10, 0, 6), addi(11, 0, 3), divu(15, 10, 11), remuw(16, 10, 11)],
            4,
            "a5" => 2,
            "a6" => 0,
        );
        // Division by zero: divu yields all ones, remuw yields the dividend.
        riscv_test!(
            [addi(10, 0, 6), divu(13, 10, 0), remuw(14, 10, 0)],
            3,
            "a3" => u64::MAX,
            "a4" => 6,
        );
    }

    #[test]
    fn test_amo() {
        riscv_test!(
            [
                addi(5, 0, 5),
                addi(2, 2, -16),
                sd(5, 2, 0),
                addi(6, 0, 3),
                amoadd_d(7, 2, 6),
                amoswap_d(28, 2, 5),
                ld(29, 2, 0),
            ],
            7,
            "t2" => 5,
            "t3" => 8,
            "t4" => 5,
        );
    }

    #[test]
    fn test_csrs() {
        riscv_test!(
            [
                addi(5, 0, 1),
                addi(6, 0, 2),
                addi(7, 0, 3),
                csrrw(0, MSTATUS, 5),
                csrrs(0, MTVEC, 6),
                csrrw(0, MEPC, 7),
                csrrc(7, MEPC, 0),
                csrrwi(0, SSTATUS, 4),
                csrrsi(0, STVEC, 5),
                csrrwi(0, SEPC, 6),
                csrrci(0, SEPC, 0),
            ],
            11,
            "mstatus" => 1,
            "mtvec" => 2,
            "mepc" => 3,
            "t2" => 3,
            "sstatus" => 0,
            "stvec" => 5,
            "sepc" => 6,
        );
    }

    #[test]
    fn test_system_nops() {
        riscv_test!([SFENCE_VMA, WFI, FENCE], 3, "pc" => DRAM_BASE + 12);
    }

    #[test]
    fn test_x0_is_hardwired() {
        riscv_test!([addi(0, 0, 42)], 1, "zero" => 0);
        riscv_test!([jal(0, 8)], 1, "zero" => 0, "pc" => DRAM_BASE + 8);
    }

    #[test]
    fn test_illegal_instruction() {
        let mut cpu = Cpu::new(vec![], vec![]);
        let e = cpu.execute(0xffff_ffff).unwrap_err();
        assert_eq!(e, Exception::IllegalInstruction(0xffff_ffff));
        assert!(e.is_fatal());
    }

    #[test]
    fn test_fetch_outside_memory_map() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.pc = 0x100;
        assert_eq!(cpu.fetch(), Err(Exception::InstructionAccessFault(0x100)));
    }

    #[test]
    fn test_mret() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.csr.store(MEPC, DRAM_BASE + 0x100);
        // MPP = Supervisor, MPIE = 1.
        cpu.csr.store(MSTATUS, (1 << 11) | MASK_MPIE | MASK_MPRV);
        let new_pc = cpu.execute(MRET as u64).unwrap();
        assert_eq!(new_pc, DRAM_BASE + 0x100);
        assert_eq!(cpu.mode, Mode::Supervisor);
        let mstatus = cpu.csr.load(MSTATUS);
        assert_eq!(mstatus & MASK_MIE, MASK_MIE);
        assert_eq!(mstatus & MASK_MPIE, MASK_MPIE);
        assert_eq!(mstatus & MASK_MPP, 0);
        assert_eq!(mstatus & MASK_MPRV, 0);
    }

    #[test]
    fn test_sret() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.mode = Mode::Supervisor;
        cpu.csr.store(SEPC, DRAM_BASE + 0x40);
        cpu.csr.store(SSTATUS, MASK_SPP | MASK_SPIE);
        let new_pc = cpu.execute(SRET as u64).unwrap();
        assert_eq!(new_pc, DRAM_BASE + 0x40);
        assert_eq!(cpu.mode, Mode::Supervisor);
        let sstatus = cpu.csr.load(SSTATUS);
        assert_eq!(sstatus & MASK_SIE, MASK_SIE);
        assert_eq!(sstatus & MASK_SPIE, MASK_SPIE);
        assert_eq!(sstatus & MASK_SPP, 0);
    }

    #[test]
    fn test_ecall_delegated_to_s_mode() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.mode = Mode::Supervisor;
        cpu.csr.store(MEDELEG, 1 << 9);
        cpu.csr.store(STVEC, DRAM_BASE + 0x200);
        cpu.csr.store(SSTATUS, MASK_SIE);
        let e = cpu.execute(ECALL as u64).unwrap_err();
        assert_eq!(e, Exception::EnvironmentCallFromSMode(DRAM_BASE));
        assert!(!e.is_fatal());
        cpu.handle_exception(e);
        assert_eq!(cpu.pc, DRAM_BASE + 0x200);
        assert_eq!(cpu.mode, Mode::Supervisor);
        assert_eq!(cpu.csr.load(SCAUSE), 9);
        assert_eq!(cpu.csr.load(SEPC), DRAM_BASE);
        assert_eq!(cpu.csr.load(STVAL), DRAM_BASE);
        let sstatus = cpu.csr.load(SSTATUS);
        // SPIE captured SIE, SIE cleared, SPP recorded Supervisor.
        assert_eq!(sstatus & MASK_SPIE, MASK_SPIE);
        assert_eq!(sstatus & MASK_SIE, 0);
        assert_eq!(sstatus & MASK_SPP, MASK_SPP);
    }

    #[test]
    fn test_ecall_from_m_mode() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.csr.store(MTVEC, DRAM_BASE + 0x300);
        let e = cpu.execute(ECALL as u64).unwrap_err();
        assert_eq!(e, Exception::EnvironmentCallFromMMode(DRAM_BASE));
        cpu.handle_exception(e);
        assert_eq!(cpu.pc, DRAM_BASE + 0x300);
        assert_eq!(cpu.mode, Mode::Machine);
        assert_eq!(cpu.csr.load(MCAUSE), 11);
        // MPP recorded Machine.
        assert_eq!((cpu.csr.load(MSTATUS) & MASK_MPP) >> 11, 3);
    }

    #[test]
    fn test_interrupt_delivery_vectored() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.mode = Mode::Supervisor;
        cpu.csr.store(MIDELEG, 1 << 9);
        cpu.csr.store(STVEC, (DRAM_BASE + 0x400) | 1);
        cpu.handle_interrupt(Interrupt::SupervisorExternalInterrupt);
        assert_eq!(cpu.pc, DRAM_BASE + 0x400 + 4 * 9);
        assert_eq!(cpu.csr.load(SCAUSE), 9 | MASK_INTERRUPT_BIT);
        assert_eq!(cpu.csr.load(STVAL), 0);
        assert_eq!(cpu.mode, Mode::Supervisor);
    }

    #[test]
    fn test_interrupt_delivery_direct() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.csr.store(MTVEC, DRAM_BASE + 0x500);
        cpu.handle_interrupt(Interrupt::MachineTimerInterrupt);
        assert_eq!(cpu.pc, DRAM_BASE + 0x500);
        assert_eq!(cpu.csr.load(MCAUSE), 7 | MASK_INTERRUPT_BIT);
    }

    #[test]
    fn test_check_pending_interrupt_priority() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.csr.store(MSTATUS, MASK_MIE);
        cpu.csr.store(MIE, MASK_MEIP | MASK_SEIP);
        cpu.csr.store(MIP, MASK_MEIP | MASK_SEIP);
        assert_eq!(
            cpu.check_pending_interrupt(),
            Some(Interrupt::MachineExternalInterrupt)
        );
        assert_eq!(
            cpu.check_pending_interrupt(),
            Some(Interrupt::SupervisorExternalInterrupt)
        );
        assert_eq!(cpu.check_pending_interrupt(), None);

        // Globally masked while MIE = 0 in M-mode.
        cpu.csr.store(MIP, MASK_MEIP);
        cpu.csr.store(MSTATUS, 0);
        assert_eq!(cpu.check_pending_interrupt(), None);
    }

    #[test]
    fn test_zero_page_table_faults() {
        let mut cpu = Cpu::new(vec![], vec![]);
        // Root page table over zeroed DRAM: every walk must page-fault
        // with the kind matching the access type.
        cpu.regs[5] = (8 << 60) | (DRAM_BASE >> 12);
        cpu.pc = cpu.execute(csrrw(0, SATP, 5) as u64).unwrap();
        assert_eq!(
            cpu.translate(DRAM_BASE, AccessType::Load),
            Err(Exception::LoadPageFault(DRAM_BASE))
        );
        assert_eq!(
            cpu.translate(DRAM_BASE, AccessType::Store),
            Err(Exception::StoreAMOPageFault(DRAM_BASE))
        );
        assert_eq!(cpu.fetch(), Err(Exception::InstructionPageFault(cpu.pc)));
    }

    #[test]
    fn test_sv39_walk() {
        let mut cpu = Cpu::new(vec![], vec![]);
        let root = DRAM_BASE + 0x10000;
        let l1 = DRAM_BASE + 0x11000;
        let l0 = DRAM_BASE + 0x12000;
        let target = DRAM_BASE + 0x3000;

        // Three-level mapping for va 0x1000 (vpn 0/0/1).
        cpu.bus.store(root, 64, ((l1 >> 12) << 10) | 1).unwrap();
        cpu.bus.store(l1, 64, ((l0 >> 12) << 10) | 1).unwrap();
        cpu.bus
            .store(l0 + 8, 64, ((target >> 12) << 10) | 0b111)
            .unwrap();
        // Level-1 superpage for va 0x20_0000..0x40_0000 (vpn 0/1/-).
        cpu.bus
            .store(l1 + 8, 64, ((DRAM_BASE >> 12) << 10) | 0b111)
            .unwrap();

        cpu.regs[5] = (8 << 60) | (root >> 12);
        cpu.pc = cpu.execute(csrrw(0, SATP, 5) as u64).unwrap();

        assert_eq!(
            cpu.translate(0x1234, AccessType::Load).unwrap(),
            target + 0x234
        );
        // vpn[0] and the page offset pass through a superpage leaf.
        assert_eq!(
            cpu.translate(0x0020_3056, AccessType::Store).unwrap(),
            DRAM_BASE + 0x3056
        );
    }

    #[test]
    fn test_satp_write_disables_paging() {
        let mut cpu = Cpu::new(vec![], vec![]);
        cpu.regs[5] = (8 << 60) | (DRAM_BASE >> 12);
        cpu.pc = cpu.execute(csrrw(0, SATP, 5) as u64).unwrap();
        assert!(cpu.translate(0x1000, AccessType::Load).is_err());
        // MODE = 0 (bare) turns translation back off.
        cpu.regs[5] = 0;
        cpu.pc = cpu.execute(csrrw(0, SATP, 5) as u64).unwrap();
        assert_eq!(cpu.translate(0x1000, AccessType::Load).unwrap(), 0x1000);
    }

    #[test]
    fn test_disk_access() {
        let mut disk = vec![0u8; 1024];
        for (i, byte) in disk.iter_mut().take(16).enumerate() {
            *byte = 0xa0 + i as u8;
        }
        let mut cpu = Cpu::new(vec![], disk);

        // Queue page at the base of DRAM.
        cpu.bus.store(VIRTIO_GUEST_PAGE_SIZE, 32, PAGE_SIZE).unwrap();
        cpu.bus
            .store(VIRTIO_QUEUE_PFN, 32, DRAM_BASE / PAGE_SIZE)
            .unwrap();
        let desc = DRAM_BASE;
        let req = DRAM_BASE + 0x200;
        let buf = DRAM_BASE + 0x300;

        // Head descriptor 0 names the request header and links to the
        // data descriptor; descriptor 1 names the guest buffer. The
        // available ring is left zeroed, pointing at descriptor 0.
        cpu.bus.store(desc + VIRTQ_DESC_ADDR, 64, req).unwrap();
        cpu.bus.store(desc + VIRTQ_DESC_NEXT, 16, 1).unwrap();
        cpu.bus
            .store(desc + VIRTQ_DESC_SIZE + VIRTQ_DESC_ADDR, 64, buf)
            .unwrap();
        cpu.bus
            .store(desc + VIRTQ_DESC_SIZE + VIRTQ_DESC_LEN, 32, 16)
            .unwrap();
        cpu.bus
            .store(req + VIRTIO_BLK_REQ_IOTYPE, 32, VIRTIO_BLK_T_IN as u64)
            .unwrap();
        cpu.bus.store(req + VIRTIO_BLK_REQ_SECTOR, 64, 0).unwrap();

        cpu.csr.store(MSTATUS, MASK_MIE);
        cpu.csr.store(MIE, MASK_SEIP);
        cpu.bus.store(VIRTIO_QUEUE_NOTIFY, 32, 0).unwrap();

        assert_eq!(
            cpu.check_pending_interrupt(),
            Some(Interrupt::SupervisorExternalInterrupt)
        );
        for i in 0..16u64 {
            assert_eq!(cpu.bus.load(buf + i, 8).unwrap(), 0xa0 + i);
        }
        assert_eq!(
            cpu.bus.load(desc + PAGE_SIZE + VIRTQ_USED_IDX, 16).unwrap(),
            1
        );
        assert_eq!(cpu.bus.load(PLIC_SCLAIM, 32).unwrap(), VIRTIO_IRQ);

        // Now write sector 1 from the same buffer.
        cpu.bus
            .store(req + VIRTIO_BLK_REQ_IOTYPE, 32, VIRTIO_BLK_T_OUT as u64)
            .unwrap();
        cpu.bus.store(req + VIRTIO_BLK_REQ_SECTOR, 64, 1).unwrap();
        for i in 0..16u64 {
            cpu.bus.store(buf + i, 8, 0x50 + i).unwrap();
        }
        cpu.bus.store(VIRTIO_QUEUE_NOTIFY, 32, 0).unwrap();
        assert_eq!(
            cpu.check_pending_interrupt(),
            Some(Interrupt::SupervisorExternalInterrupt)
        );
        for i in 0..16u64 {
            assert_eq!(cpu.bus.virtio.read_disk(SECTOR_SIZE + i), 0x50 + i);
        }
        assert_eq!(
            cpu.bus.load(desc + PAGE_SIZE + VIRTQ_USED_IDX, 16).unwrap(),
            2
        );
    }
}
