//! Console output for the VM subsystem.
//!
//! On bare metal this is COM1 (QEMU's serial console). Host test builds
//! print to stdout instead; other hosted builds drop the output.

#[cfg(all(target_os = "none", not(test)))]
mod port {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut serial_port = unsafe { SerialPort::new(0x3F8) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }

    pub fn write(args: ::core::fmt::Arguments) {
        use core::fmt::Write;
        // Disable interrupts while holding the serial lock so a fault
        // handler that logs cannot deadlock against an interrupted writer.
        x86_64::instructions::interrupts::without_interrupts(|| {
            let _ = SERIAL1.lock().write_fmt(args);
        });
    }
}

/// Initialize serial output.
pub fn init() {
    #[cfg(all(target_os = "none", not(test)))]
    {
        let _ = port::SERIAL1.lock();
    }
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    #[cfg(all(target_os = "none", not(test)))]
    port::write(args);

    #[cfg(test)]
    std::print!("{}", args);

    #[cfg(not(any(test, target_os = "none")))]
    let _ = args;
}

/// Print to the kernel console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

/// Print to the kernel console with newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
