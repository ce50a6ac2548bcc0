//! A flat little-endian byte store mapped at `DRAM_BASE`.

use crate::exception::Exception;
use crate::param::{DRAM_BASE, DRAM_SIZE};

use Exception::*;

pub struct Dram {
    dram: Vec<u8>,
}

impl Dram {
    /// `code` lands at offset 0, i.e. physical `DRAM_BASE`; the rest is zero.
    pub fn new(code: Vec<u8>) -> Dram {
        let mut dram = vec![0; DRAM_SIZE as usize];
        dram.splice(..code.len(), code.into_iter());
        Self { dram }
    }

    // The bus guarantees addr is in range; the size still has to be checked here.
    pub fn load(&self, addr: u64, size: u64) -> Result<u64, Exception> {
        if ![8, 16, 32, 64].contains(&size) {
            return Err(LoadAccessFault(addr));
        }
        let nbytes = size / 8;
        let index = (addr - DRAM_BASE) as usize;
        let mut value = self.dram[index] as u64;
        for i in 1..nbytes {
            value |= (self.dram[index + i as usize] as u64) << (i * 8);
        }
        Ok(value)
    }

    pub fn store(&mut self, addr: u64, size: u64, value: u64) -> Result<(), Exception> {
        if ![8, 16, 32, 64].contains(&size) {
            return Err(StoreAMOAccessFault(addr));
        }
        let nbytes = size / 8;
        let index = (addr - DRAM_BASE) as usize;
        for i in 0..nbytes {
            self.dram[index + i as usize] = ((value >> (i * 8)) & 0xff) as u8;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn little_endian() {
        let mut dram = Dram::new(vec![]);
        dram.store(DRAM_BASE, 32, 0x1234_5678).unwrap();
        assert_eq!(dram.load(DRAM_BASE, 8).unwrap(), 0x78);
        assert_eq!(dram.load(DRAM_BASE + 1, 8).unwrap(), 0x56);
        assert_eq!(dram.load(DRAM_BASE, 16).unwrap(), 0x5678);
        assert_eq!(dram.load(DRAM_BASE, 32).unwrap(), 0x1234_5678);
    }

    #[test]
    fn rejects_odd_sizes() {
        let mut dram = Dram::new(vec![]);
        assert_eq!(dram.load(DRAM_BASE, 24), Err(LoadAccessFault(DRAM_BASE)));
        assert_eq!(
            dram.store(DRAM_BASE, 48, 0),
            Err(StoreAMOAccessFault(DRAM_BASE))
        );
    }

    proptest! {
        // store(a, size, v); load(a, size) == v masked to size bits.
        #[test]
        fn store_then_load_masks(offset in 0u64..4096, value: u64, width in 0u32..4) {
            let size = 8u64 << width;
            let mut dram = Dram::new(vec![]);
            let addr = DRAM_BASE + offset;
            dram.store(addr, size, value).unwrap();
            let mask = if size == 64 { u64::MAX } else { (1u64 << size) - 1 };
            prop_assert_eq!(dram.load(addr, size).unwrap(), value & mask);
        }
    }
}
