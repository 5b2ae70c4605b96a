use core::time::Duration;

/// Baud rates accepted by the line discipline.
const STANDARD_BAUD_RATES: &[u32] = &[
    300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 500_000,
    576_000, 921_600, 1_000_000, 1_152_000, 1_500_000, 2_000_000, 2_500_000, 3_000_000,
    3_500_000, 4_000_000,
];

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Reasons a [`Config`] is rejected by [`Config::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),
    #[error("response buffer size must be non-zero")]
    ZeroBufferSize,
}

/// Line settings and engine tunables of a single port.
///
/// All setters are `const` so a configuration can live in a `const` item.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Config {
    pub(crate) baud: u32,
    pub(crate) data_bits: DataBits,
    pub(crate) parity: Parity,
    pub(crate) stop_bits: StopBits,
    pub(crate) send_delay: Duration,
    pub(crate) spew_control: bool,
    pub(crate) rts_cts: bool,
    pub(crate) flash_ok: bool,
    pub(crate) buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            baud: 57600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            send_delay: Duration::ZERO,
            spew_control: true,
            rts_cts: false,
            flash_ok: true,
            buffer_size: 2048,
        }
    }

    #[must_use]
    pub const fn baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    #[must_use]
    pub const fn data_bits(mut self, bits: DataBits) -> Self {
        self.data_bits = bits;
        self
    }

    #[must_use]
    pub const fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    #[must_use]
    pub const fn stop_bits(mut self, bits: StopBits) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Delay between single bytes of a command. Zero writes each command in
    /// one go.
    #[must_use]
    pub const fn send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Truncate the response buffer once it grows past `buffer_size`.
    #[must_use]
    pub const fn spew_control(mut self, enabled: bool) -> Self {
        self.spew_control = enabled;
        self
    }

    #[must_use]
    pub const fn rts_cts(mut self, enabled: bool) -> Self {
        self.rts_cts = enabled;
        self
    }

    /// When false, [`flash`](crate::PortHandle::flash) succeeds without
    /// touching the line.
    #[must_use]
    pub const fn flash_ok(mut self, enabled: bool) -> Self {
        self.flash_ok = enabled;
        self
    }

    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub const fn get_baud(&self) -> u32 {
        self.baud
    }

    pub const fn get_send_delay(&self) -> Duration {
        self.send_delay
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !STANDARD_BAUD_RATES.contains(&self.baud) {
            return Err(ConfigError::UnsupportedBaud(self.baud));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        Ok(())
    }

    /// Number of would-block write attempts tolerated for one transaction
    /// before the write is given up.
    pub(crate) fn write_retry_budget(&self) -> u32 {
        let delay_us = self.send_delay.as_micros();
        if delay_us == 0 {
            1000
        } else {
            u32::try_from(3_000_000 / delay_us).unwrap_or(u32::MAX).max(1)
        }
    }
}
