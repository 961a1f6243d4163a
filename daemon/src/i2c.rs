//! Register access through the i2c-dev character device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use pocketcam::peripheral::{PeripheralError, RegisterBus};

/// From linux/i2c-dev.h.
const I2C_SLAVE: u16 = 0x0703;

/// One device on an I2C bus, addressed once at open.
pub struct I2cDevice {
    file: File,
}

impl I2cDevice {
    pub fn open(bus: &Path, address: u16) -> Result<Self, PeripheralError> {
        let file = OpenOptions::new().read(true).write(true).open(bus)?;
        // SAFETY: the fd is open for the lifetime of the call and I2C_SLAVE
        // takes the address by value.
        let result = unsafe {
            libc::ioctl(file.as_raw_fd(), I2C_SLAVE as _, address as libc::c_ulong)
        };
        if result < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { file })
    }
}

impl RegisterBus for I2cDevice {
    fn read_register(&mut self, register: u8) -> Result<u8, PeripheralError> {
        self.file.write_all(&[register])?;
        let mut value = [0u8; 1];
        self.file.read_exact(&mut value)?;
        Ok(value[0])
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), PeripheralError> {
        self.file.write_all(&[register, value])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bus_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = I2cDevice::open(&dir.path().join("i2c-9"), 0x36);
        assert!(matches!(result, Err(PeripheralError::Io(_))));
    }
}
