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

use std::fs;
use std::path::Path;

use crate::errors::{ErrorKind, Result, ResultExt};

/// Staged boot material, copied into guest DRAM on every reset.
///
/// The files are read eagerly when loaded, so a machine keeps booting the
/// same images even if the files change on disk afterwards.
#[derive(Default)]
pub struct BootSource {
    /// M-mode firmware, executed from the DRAM base on reset.
    pub bootrom: Option<Vec<u8>>,
    /// S-mode payload, staged at the platform kernel offset.
    pub kernel: Option<Vec<u8>>,
    /// Custom Device Tree blob displacing the generated one.
    pub dtb: Option<Vec<u8>>,
    /// Kernel command line surfaced through /chosen.
    pub cmdline: String,
}

/// Read a boot image and check it fits its destination window.
pub fn load_image<P: AsRef<Path>>(path: P, limit: u64) -> Result<Vec<u8>> {
    let path_str = path.as_ref().display().to_string();
    let image = fs::read(path.as_ref())
        .chain_err(|| ErrorKind::LoadImage(path_str.clone()))?;
    if image.is_empty() {
        return Err(ErrorKind::LoadImage(path_str).into());
    }
    if image.len() as u64 > limit {
        return Err(ErrorKind::ImageTooLarge(path_str, image.len() as u64, limit).into());
    }
    Ok(image)
}
