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

use cpu::Xlen;
use machine_manager::config::MachineConfig;
use util::device_tree::FdtTree;

use crate::errors::Result;

// Base ISA expanded when the configuration only names the register width.
const DEFAULT_ISA_EXTENSIONS: &str = "imafdc_zicsr_zifencei";

/// The riscv,isa string advertised for every hart.
pub fn isa_string(config: &MachineConfig) -> String {
    if config.isa == "rv64" || config.isa == "rv32" {
        format!("{}{}", config.isa, DEFAULT_ISA_EXTENSIONS)
    } else {
        config.isa.clone()
    }
}

/// Build the base Device Tree of a machine: root properties, the /cpus
/// hierarchy with one interrupt-controller subnode per hart, the /memory
/// node, an empty /chosen and the /soc container devices attach under.
pub fn create_base_tree(
    config: &MachineConfig,
    xlen: Xlen,
    mem_base: u64,
    time_freq: u64,
) -> Result<FdtTree> {
    let mut fdt = FdtTree::new();
    let root = fdt.root();
    fdt.set_prop_u32(root, "#address-cells", 2)?;
    fdt.set_prop_u32(root, "#size-cells", 2)?;
    fdt.set_prop_str(root, "model", "riscv-virtio")?;
    fdt.set_prop_str(root, "compatible", "riscv-virtio")?;

    fdt.add_node(root, "chosen")?;

    let cpus = fdt.add_node(root, "cpus")?;
    fdt.set_prop_u32(cpus, "#address-cells", 1)?;
    fdt.set_prop_u32(cpus, "#size-cells", 0)?;
    fdt.set_prop_u32(cpus, "timebase-frequency", time_freq as u32)?;

    let isa = isa_string(config);
    let mmu_type = match xlen {
        Xlen::X64 => "riscv,sv39",
        Xlen::X32 => "riscv,sv32",
    };
    for hart_id in 0..u32::from(config.nr_harts) {
        let cpu = fdt.add_node(cpus, &format!("cpu@{:x}", hart_id))?;
        fdt.set_prop_str(cpu, "device_type", "cpu")?;
        fdt.set_prop_u32(cpu, "reg", hart_id)?;
        fdt.set_prop_str(cpu, "status", "okay")?;
        fdt.set_prop_str(cpu, "compatible", "riscv")?;
        fdt.set_prop_str(cpu, "riscv,isa", &isa)?;
        fdt.set_prop_str(cpu, "mmu-type", mmu_type)?;

        let intc = fdt.add_node(cpu, "interrupt-controller")?;
        fdt.set_prop_u32(intc, "#interrupt-cells", 1)?;
        fdt.set_prop_empty(intc, "interrupt-controller")?;
        fdt.set_prop_str(intc, "compatible", "riscv,cpu-intc")?;
    }

    let memory = fdt.add_node(root, &format!("memory@{:x}", mem_base))?;
    fdt.set_prop_str(memory, "device_type", "memory")?;
    fdt.set_prop_reg(memory, "reg", mem_base, config.mem_size)?;

    let soc = fdt.add_node(root, "soc")?;
    fdt.set_prop_str(soc, "compatible", "simple-bus")?;
    fdt.set_prop_u32(soc, "#address-cells", 2)?;
    fdt.set_prop_u32(soc, "#size-cells", 2)?;
    fdt.set_prop_empty(soc, "ranges")?;

    Ok(fdt)
}

/// Refresh the boot-dependent properties right before serialization: the
/// command line, the staged-kernel window and the current timer frequency.
pub fn sync_boot_props(
    fdt: &mut FdtTree,
    cmdline: &str,
    kernel_window: Option<(u64, u64)>,
    time_freq: u64,
) -> Result<()> {
    let root = fdt.root();
    if let Some(cpus) = fdt.find_node(root, "cpus") {
        fdt.set_prop_u32(cpus, "timebase-frequency", time_freq as u32)?;
    }
    let chosen = match fdt.find_node(root, "chosen") {
        Some(chosen) => chosen,
        None => fdt.add_node(root, "chosen")?,
    };
    fdt.set_prop_str(chosen, "bootargs", cmdline)?;
    if let Some((start, end)) = kernel_window {
        fdt.set_prop_u64(chosen, "linux,initrd-start", start)?;
        fdt.set_prop_u64(chosen, "linux,initrd-end", end)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> MachineConfig {
        MachineConfig {
            mem_size: 64 << 20,
            nr_harts: 2,
            isa: "rv64".to_string(),
        }
    }

    #[test]
    fn test_isa_expansion() {
        let mut config = test_config();
        assert_eq!(isa_string(&config), "rv64imafdc_zicsr_zifencei");
        config.isa = "rv32".to_string();
        assert_eq!(isa_string(&config), "rv32imafdc_zicsr_zifencei");
        config.isa = "rv64imac".to_string();
        assert_eq!(isa_string(&config), "rv64imac");
    }

    #[test]
    fn test_base_tree_shape() {
        let fdt =
            create_base_tree(&test_config(), Xlen::X64, 0x8000_0000, 10_000_000).unwrap();
        let root = fdt.root();
        let cpus = fdt.find_node(root, "cpus").unwrap();
        for hart_id in 0..2 {
            let cpu = fdt.find_reg(cpus, "cpu", hart_id).unwrap();
            assert!(fdt.find_node(cpu, "interrupt-controller").is_some());
            assert!(fdt.prop(cpu, "riscv,isa").unwrap().starts_with(b"rv64"));
        }
        assert!(fdt.find_reg(root, "memory", 0x8000_0000).is_some());
        assert!(fdt.find_node(root, "soc").is_some());
        assert!(fdt.find_node(root, "chosen").is_some());
    }

    #[test]
    fn test_sync_boot_props() {
        let mut fdt =
            create_base_tree(&test_config(), Xlen::X64, 0x8000_0000, 10_000_000).unwrap();
        sync_boot_props(
            &mut fdt,
            "console=ttyS0",
            Some((0x8020_0000, 0x8040_0000)),
            1_000_000,
        )
        .unwrap();

        let chosen = fdt.find_node(fdt.root(), "chosen").unwrap();
        assert_eq!(fdt.prop(chosen, "bootargs").unwrap(), b"console=ttyS0\0");
        assert!(fdt.prop(chosen, "linux,initrd-start").is_some());

        let cpus = fdt.find_node(fdt.root(), "cpus").unwrap();
        assert_eq!(
            fdt.prop(cpus, "timebase-frequency").unwrap(),
            1_000_000_u32.to_be_bytes()
        );
    }
}
