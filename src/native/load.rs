use sysinfo::System;

use crate::core::traits::load::LoadSource;

/// One-minute load average of this machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLoad;

impl LoadSource for SystemLoad {
    fn load_average(&self) -> f64 {
        System::load_average().one
    }
}
