/// Which accelerator the models should run on. Resolved into a concrete
/// `candle_core::Device` once at startup by [`crate::select_best_device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl DeviceMap {
    pub fn from_flags(cpu: bool, ordinal: usize) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::Ordinal(ordinal)
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_flag_wins() {
        assert_eq!(DeviceMap::from_flags(true, 3), DeviceMap::ForceCpu);
        assert_eq!(DeviceMap::from_flags(false, 1), DeviceMap::Ordinal(1));
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }
}
