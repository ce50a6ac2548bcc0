//! A 16550-style UART. See http://byterunner.com/16550.html
//!
//! Input is fed by a background thread doing blocking one-byte reads from
//! stdin. The register window is guarded by a mutex paired with a condvar:
//! the reader thread parks while an unconsumed byte sits in RHR, and a
//! guest load of RHR wakes it. The interrupt latch is a separate atomic so
//! the polling loop never has to take the register lock.

use std::io;
use std::io::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::error;

use crate::exception::Exception;
use crate::param::*;

use Exception::*;

pub struct Uart {
    /// UART register window behind a mutex, paired with the RHR condvar.
    registers: Arc<(Mutex<[u8; UART_SIZE as usize]>, Condvar)>,
    /// Set by the reader thread when a fresh byte lands in RHR.
    interrupt: Arc<AtomicBool>,
}

impl Uart {
    pub fn new() -> Self {
        let mut array = [0; UART_SIZE as usize];
        array[UART_LSR as usize] |= MASK_UART_LSR_TX;

        let registers = Arc::new((Mutex::new(array), Condvar::new()));
        let interrupt = Arc::new(AtomicBool::new(false));

        let read_registers = Arc::clone(&registers);
        let read_interrupt = Arc::clone(&interrupt);
        let mut byte = [0];
        thread::spawn(move || loop {
            match io::stdin().read(&mut byte) {
                Ok(0) => return, // stdin closed
                Ok(_) => {
                    let (registers, cvar) = &*read_registers;
                    let mut array = registers.lock().unwrap();
                    // Hold the byte until the guest has consumed the
                    // previous one.
                    while array[UART_LSR as usize] & MASK_UART_LSR_RX == 1 {
                        array = cvar.wait(array).unwrap();
                    }
                    array[UART_RHR as usize] = byte[0];
                    read_interrupt.store(true, Ordering::Release);
                    array[UART_LSR as usize] |= MASK_UART_LSR_RX;
                }
                Err(e) => {
                    error!("uart: stdin read failed: {}", e);
                    return;
                }
            }
        });

        Self { registers, interrupt }
    }

    /// Read-and-clear the interrupt latch.
    pub fn is_interrupting(&self) -> bool {
        self.interrupt.swap(false, Ordering::Acquire)
    }

    pub fn load(&mut self, addr: u64, size: u64) -> Result<u64, Exception> {
        if size != 8 {
            return Err(LoadAccessFault(addr));
        }
        let (registers, cvar) = &*self.registers;
        let mut array = registers.lock().unwrap();
        let index = addr - UART_BASE;
        match index {
            UART_RHR => {
                cvar.notify_one();
                array[UART_LSR as usize] &= !MASK_UART_LSR_RX;
                Ok(array[UART_RHR as usize] as u64)
            }
            _ => Ok(array[index as usize] as u64),
        }
    }

    pub fn store(&mut self, addr: u64, size: u64, value: u64) -> Result<(), Exception> {
        if size != 8 {
            return Err(StoreAMOAccessFault(addr));
        }
        let (registers, _cvar) = &*self.registers;
        let mut array = registers.lock().unwrap();
        let index = addr - UART_BASE;
        match index {
            UART_THR => {
                let mut stdout = io::stdout();
                stdout.write_all(&[value as u8]).unwrap();
                stdout.flush().unwrap();
                Ok(())
            }
            _ => {
                array[index as usize] = value as u8;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transmitter_ready_after_reset() {
        let mut uart = Uart::new();
        let lsr = uart.load(UART_BASE + UART_LSR, 8).unwrap();
        assert_eq!(lsr as u8 & MASK_UART_LSR_TX, MASK_UART_LSR_TX);
        assert_eq!(lsr as u8 & MASK_UART_LSR_RX, 0);
        assert!(!uart.is_interrupting());
    }

    #[test]
    fn scratch_registers_hold_bytes() {
        let mut uart = Uart::new();
        uart.store(UART_BASE + UART_LCR, 8, 0x03).unwrap();
        assert_eq!(uart.load(UART_BASE + UART_LCR, 8).unwrap(), 0x03);
    }

    #[test]
    fn width_is_one_byte() {
        let mut uart = Uart::new();
        assert_eq!(
            uart.load(UART_BASE, 32),
            Err(LoadAccessFault(UART_BASE))
        );
        assert_eq!(
            uart.store(UART_BASE + UART_LCR, 16, 0),
            Err(StoreAMOAccessFault(UART_BASE + UART_LCR))
        );
    }
}
