use anvil_core::hammerer::{BurstStats, HammerError, Hammering};
use anvil_core::timing::{NativeTiming, TimingSource};
use log::debug;

/// A memory address to flip.
#[derive(Clone, Copy, Debug)]
pub struct FlipAddr(*mut u8);

/// Dummy hammerer that directly flips bits in virtual addresses for testing.
///
/// Used to simulate bit flips without actual Rowhammer attacks. Every burst
/// inverts the lowest bit of each target byte, so a later scan reports one
/// flip per target.
pub struct Dummy {
    /// Addresses where a bit should be flipped
    flip_addrs: Vec<FlipAddr>,
    /// Report the burst as interrupted after flipping
    interrupt: Option<usize>,
    timing: NativeTiming,
}

impl Dummy {
    /// Creates a new dummy hammerer targeting the specified addresses.
    pub fn new(flip_addrs: Vec<FlipAddr>) -> Self {
        Dummy {
            flip_addrs,
            interrupt: None,
            timing: NativeTiming::default(),
        }
    }

    /// Makes every burst fail with [`HammerError::InterruptedBurst`] after
    /// `completed` activations. The flips still happen.
    pub fn interrupted_after(mut self, completed: usize) -> Self {
        self.interrupt = Some(completed);
        self
    }
}

impl Hammering for Dummy {
    type Error = HammerError;
    fn hammer(&self) -> Result<BurstStats, Self::Error> {
        for flip_addr in &self.flip_addrs {
            unsafe {
                let old = std::ptr::read_volatile(flip_addr.0);
                debug!(
                    "Flip address 0x{:02X} from {} to {}",
                    flip_addr.0 as usize,
                    old,
                    old ^ 1
                );
                std::ptr::write_volatile(flip_addr.0, old ^ 1);
                self.timing.evict(flip_addr.0);
            }
        }
        self.timing.fence_full();
        let activations = self.flip_addrs.len();
        match self.interrupt {
            Some(completed) => Err(HammerError::InterruptedBurst {
                completed,
                scheduled: activations.max(completed + 1),
            }),
            None => Ok(BurstStats {
                activations,
                refresh_syncs: 0,
                ticks: 0,
            }),
        }
    }
}

impl From<*mut u8> for FlipAddr {
    fn from(value: *mut u8) -> Self {
        FlipAddr(value)
    }
}

impl From<*const u8> for FlipAddr {
    fn from(value: *const u8) -> Self {
        FlipAddr(value as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flips_lowest_bit() {
        let mut buf = vec![0xAAu8; 16];
        let dummy = Dummy::new(vec![FlipAddr::from(&mut buf[3] as *mut u8)]);
        assert_eq!(
            dummy.hammer(),
            Ok(BurstStats {
                activations: 1,
                refresh_syncs: 0,
                ticks: 0
            })
        );
        assert_eq!(buf[3], 0xAB);
        assert_eq!(buf[2], 0xAA);
    }

    #[test]
    fn test_interrupted() {
        let mut buf = vec![0u8; 4];
        let dummy = Dummy::new(vec![FlipAddr::from(&mut buf[0] as *mut u8)]).interrupted_after(5);
        assert_eq!(
            dummy.hammer(),
            Err(HammerError::InterruptedBurst {
                completed: 5,
                scheduled: 6
            })
        );
        assert_eq!(buf[0], 1);
    }
}
