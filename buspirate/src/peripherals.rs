/// Binary-mode command that writes the peripheral register.
pub const CMD_CONFIG_PERIPHERALS: u8 = 0b0100_0000;

/// `Config` is the Bus Pirate's peripheral register: on-board supplies, pull-up
/// resistors, the AUX pin and the chip-select pin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    pub power_supply: bool,
    pub pull_ups: bool,
    pub aux: bool,
    pub cs: bool,
}

impl Config {
    pub(crate) fn command_byte(&self) -> u8 {
        let mut cmd = CMD_CONFIG_PERIPHERALS;
        cmd |= (self.power_supply as u8) << 3;
        cmd |= (self.pull_ups as u8) << 2;
        cmd |= (self.aux as u8) << 1;
        cmd |= self.cs as u8;
        cmd
    }
}
