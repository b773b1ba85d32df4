use buspirate::spi::Spi;
use buspirate::Error;
use embedded_hal::{blocking, spi};

/// `BusPirateSPI` exposes a Bus Pirate in SPI mode as an `embedded-hal` SPI
/// bus.
pub struct BusPirateSPI {
    bp: Spi,
    received: Option<u8>,
}

impl BusPirateSPI {
    /// `bp` must already be initialized.
    pub fn new(bp: Spi) -> Self {
        Self { bp, received: None }
    }

    /// Gives back the wrapped `Spi`, e.g. to `deinit` it.
    pub fn release(self) -> Spi {
        self.bp
    }
}

impl blocking::spi::Transfer<u8> for BusPirateSPI {
    type Error = Error;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        if !words.is_empty() {
            self.bp.transfer_in_place(words)?;
        }
        Ok(words)
    }
}

impl blocking::spi::Write<u8> for BusPirateSPI {
    type Error = Error;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        if words.is_empty() {
            return Ok(());
        }
        self.bp.write_bytes(words)
    }
}

/// Each `send` runs a complete one-byte transfer; the byte clocked in is
/// held until the following `read`.
impl spi::FullDuplex<u8> for BusPirateSPI {
    type Error = Error;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.received.take().ok_or(nb::Error::WouldBlock)
    }

    fn send(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        let mut buf = [word];
        self.bp.transfer_in_place(&mut buf).map_err(nb::Error::Other)?;
        self.received = Some(buf[0]);
        Ok(())
    }
}
