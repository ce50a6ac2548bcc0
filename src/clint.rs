//! The core-local interruptor. Only the timer registers are backed;
//! nothing here ticks mtime on its own.

use crate::exception::Exception;
use crate::param::{CLINT_MTIME, CLINT_MTIMECMP};

use Exception::*;

pub struct Clint {
    mtime: u64,
    mtimecmp: u64,
}

impl Clint {
    pub fn new() -> Self {
        Self { mtime: 0, mtimecmp: 0 }
    }

    pub fn load(&self, addr: u64, size: u64) -> Result<u64, Exception> {
        if size != 64 {
            return Err(LoadAccessFault(addr));
        }
        match addr {
            CLINT_MTIMECMP => Ok(self.mtimecmp),
            CLINT_MTIME => Ok(self.mtime),
            _ => Err(LoadAccessFault(addr)),
        }
    }

    pub fn store(&mut self, addr: u64, size: u64, value: u64) -> Result<(), Exception> {
        if size != 64 {
            return Err(StoreAMOAccessFault(addr));
        }
        match addr {
            CLINT_MTIMECMP => Ok(self.mtimecmp = value),
            CLINT_MTIME => Ok(self.mtime = value),
            _ => Err(StoreAMOAccessFault(addr)),
        }
    }
}
