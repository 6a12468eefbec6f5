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

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use address_space::{DeviceClass, GuestAddress, MmioDesc, RegionOps};
use sysbus::{PowerRequest, SysBus};

use super::errors::Result;

/// Default MMIO base of the syscon region.
pub const SYSCON_BASE_DEFAULT: u64 = 0x10_0000;

const SYSCON_MMIO_SIZE: u64 = 0x1000;
const SYSCON_POWEROFF: u16 = 0x5555;
const SYSCON_RESET: u16 = 0x7777;

/// Poweroff/reset controller: two magic 16-bit writes at offset zero.
///
/// The request is posted to the machine power line and applied from the
/// event thread, the MMIO callback returns before the reset runs.
pub struct Syscon;

impl Syscon {
    /// Attach the syscon at `base` and describe it in the Device Tree.
    pub fn realize(sysbus: &Arc<SysBus>, base: u64) -> Result<()> {
        let power = sysbus.power_signal().clone();
        let write_ops = move |data: &[u8], _base: GuestAddress, offset: u64| -> bool {
            if offset == 0 {
                match LittleEndian::read_u16(data) {
                    SYSCON_POWEROFF => power.post_request(PowerRequest::Poweroff),
                    SYSCON_RESET => power.post_request(PowerRequest::Reset),
                    _ => {}
                }
            }
            true
        };

        sysbus.sys_mem().attach_region(MmioDesc {
            addr: base,
            size: SYSCON_MMIO_SIZE,
            min_op_size: 2,
            max_op_size: 2,
            ops: RegionOps {
                read: None,
                write: Some(Arc::new(write_ops)),
            },
            class: DeviceClass::named("syscon"),
            ..Default::default()
        })?;

        let mut fdt = sysbus.fdt().lock().unwrap();
        let root = fdt.root();
        let soc = match fdt.find_node(root, "soc") {
            Some(soc) => soc,
            None => bail!("Missing /soc node in FDT"),
        };
        let test = fdt.add_node(soc, &format!("test@{:x}", base))?;
        fdt.set_prop_reg(test, "reg", base, SYSCON_MMIO_SIZE)?;
        fdt.set_prop_string_list(
            test,
            "compatible",
            &["sifive,test1", "sifive,test0", "syscon"],
        )?;
        let regmap = fdt.get_phandle(test);

        let poweroff = fdt.add_node(root, "poweroff")?;
        fdt.set_prop_str(poweroff, "compatible", "syscon-poweroff")?;
        fdt.set_prop_u32(poweroff, "value", u32::from(SYSCON_POWEROFF))?;
        fdt.set_prop_u32(poweroff, "offset", 0)?;
        fdt.set_prop_u32(poweroff, "regmap", regmap)?;

        let reboot = fdt.add_node(root, "reboot")?;
        fdt.set_prop_str(reboot, "compatible", "syscon-reboot")?;
        fdt.set_prop_u32(reboot, "value", u32::from(SYSCON_RESET))?;
        fdt.set_prop_u32(reboot, "offset", 0)?;
        fdt.set_prop_u32(reboot, "regmap", regmap)?;

        Ok(())
    }

    /// Attach the syscon at the default base or the nearest free zone.
    pub fn realize_auto(sysbus: &Arc<SysBus>) -> Result<()> {
        let base = sysbus
            .sys_mem()
            .zone_auto(SYSCON_BASE_DEFAULT, SYSCON_MMIO_SIZE);
        Self::realize(sysbus, base)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::sysbus_with_harts;

    #[test]
    fn test_syscon_requests() {
        let sysbus = sysbus_with_harts(1);
        Syscon::realize_auto(&sysbus).unwrap();

        // Unknown value: accepted, no request posted.
        sysbus
            .sys_mem()
            .access_write(SYSCON_BASE_DEFAULT, &0x1234_u16.to_le_bytes())
            .unwrap();
        assert_eq!(sysbus.power_signal().take_request(), None);

        sysbus
            .sys_mem()
            .access_write(SYSCON_BASE_DEFAULT, &SYSCON_RESET.to_le_bytes())
            .unwrap();
        assert_eq!(
            sysbus.power_signal().take_request(),
            Some(PowerRequest::Reset)
        );

        sysbus
            .sys_mem()
            .access_write(SYSCON_BASE_DEFAULT, &SYSCON_POWEROFF.to_le_bytes())
            .unwrap();
        assert_eq!(
            sysbus.power_signal().take_request(),
            Some(PowerRequest::Poweroff)
        );

        // A magic write anywhere else in the region is ignored.
        syscon_offset_write(&sysbus, 0x10, SYSCON_RESET);
        assert_eq!(sysbus.power_signal().take_request(), None);

        // Only 16-bit accesses are accepted.
        assert!(sysbus
            .sys_mem()
            .access_write(SYSCON_BASE_DEFAULT, &0x5555_u32.to_le_bytes())
            .is_err());
    }

    fn syscon_offset_write(sysbus: &std::sync::Arc<sysbus::SysBus>, offset: u64, val: u16) {
        sysbus
            .sys_mem()
            .access_write(SYSCON_BASE_DEFAULT + offset, &val.to_le_bytes())
            .unwrap();
    }

    #[test]
    fn test_syscon_fdt_nodes() {
        let sysbus = sysbus_with_harts(1);
        Syscon::realize_auto(&sysbus).unwrap();

        let fdt = sysbus.fdt().lock().unwrap();
        let root = fdt.root();
        let soc = fdt.find_node(root, "soc").unwrap();
        assert!(fdt.find_reg(soc, "test", SYSCON_BASE_DEFAULT).is_some());
        assert!(fdt.find_node(root, "poweroff").is_some());
        assert!(fdt.find_node(root, "reboot").is_some());
    }

    #[test]
    fn test_syscon_reads_zero() {
        let sysbus = sysbus_with_harts(1);
        Syscon::realize_auto(&sysbus).unwrap();

        let mut val = [0xff_u8; 2];
        sysbus
            .sys_mem()
            .access_read(SYSCON_BASE_DEFAULT, &mut val)
            .unwrap();
        assert_eq!(val, [0, 0]);
    }
}
