// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, Result};

/// Default guest physical base address of DRAM.
pub const DEFAULT_MEM_BASE: u64 = 0x8000_0000;
/// Default machine timer frequency, 10 MHz.
pub const DEFAULT_TIME_FREQ: u64 = 10_000_000;
/// Default hart reset address, the start of DRAM.
pub const DEFAULT_RESET_PC: u64 = 0x8000_0000;
/// Offset of a staged kernel payload from the DRAM base.
pub const KERNEL_OFFSET: u64 = 0x20_0000;

const PAGE_SIZE: u64 = 0x1000;
const MIN_MEM_SIZE: u64 = 1 << 20;
const MAX_MEM_SIZE: u64 = 1 << 40;
const MAX_HARTS: u8 = 64;

/// Every config struct can validate itself before the machine consumes it.
pub trait ConfigCheck: Send + Sync {
    fn check(&self) -> Result<()>;
}

/// Basic geometry of a machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineConfig {
    /// DRAM size in bytes, page-aligned.
    pub mem_size: u64,
    /// Amount of harts, at least one.
    pub nr_harts: u8,
    /// ISA string, `rv64` or `rv32` optionally followed by extensions.
    pub isa: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            mem_size: 256 << 20,
            nr_harts: 1,
            isa: "rv64".to_string(),
        }
    }
}

impl ConfigCheck for MachineConfig {
    fn check(&self) -> Result<()> {
        if self.mem_size % PAGE_SIZE != 0 {
            return Err(
                ErrorKind::ConfigCheck(format!("mem size 0x{:X} not page-aligned", self.mem_size))
                    .into(),
            );
        }
        if !(MIN_MEM_SIZE..=MAX_MEM_SIZE).contains(&self.mem_size) {
            return Err(ErrorKind::ConfigCheck(format!(
                "mem size 0x{:X} outside the supported range",
                self.mem_size
            ))
            .into());
        }
        if self.nr_harts == 0 || self.nr_harts > MAX_HARTS {
            return Err(ErrorKind::ConfigCheck(format!(
                "hart count {} outside 1..={}",
                self.nr_harts, MAX_HARTS
            ))
            .into());
        }
        if !self.isa.starts_with("rv64") && !self.isa.starts_with("rv32") {
            return Err(ErrorKind::ConfigCheck(format!("unknown isa \"{}\"", self.isa)).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(MachineConfig::default().check().is_ok());
    }

    #[test]
    fn test_config_bounds() {
        let mut config = MachineConfig::default();
        config.mem_size = (256 << 20) + 1;
        assert!(config.check().is_err());

        config = MachineConfig::default();
        config.mem_size = 0x1000;
        assert!(config.check().is_err());

        config = MachineConfig::default();
        config.nr_harts = 0;
        assert!(config.check().is_err());

        config = MachineConfig::default();
        config.isa = "armv8".to_string();
        assert!(config.check().is_err());

        config = MachineConfig::default();
        config.isa = "rv32imac".to_string();
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = MachineConfig {
            mem_size: 64 << 20,
            nr_harts: 2,
            isa: "rv64".to_string(),
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: MachineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.mem_size, config.mem_size);
        assert_eq!(back.nr_harts, config.nr_harts);
        assert_eq!(back.isa, config.isa);
    }
}
