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

use crate::errors::{ErrorKind, Result};

/// Anonymous host memory backing guest DRAM or a directly-mapped device
/// buffer. The pages are reserved lazily by the kernel, so a large guest
/// RAM does not commit host memory up front.
pub struct HostMemMapping {
    size: u64,
    host_addr: u64,
}

// The mapping stays valid and at a fixed address for the whole lifetime of
// the object, accesses are raw loads/stores from any thread.
unsafe impl Send for HostMemMapping {}
unsafe impl Sync for HostMemMapping {}

impl HostMemMapping {
    /// Map `size` bytes of zeroed anonymous memory.
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the mapping in bytes, must be non-zero.
    pub fn new(size: u64) -> Result<HostMemMapping> {
        if size == 0 {
            return Err(ErrorKind::Mmap.into());
        }
        // SAFETY: anonymous mapping, no fd or address hint involved.
        let host_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if host_addr == libc::MAP_FAILED {
            return Err(ErrorKind::Mmap.into());
        }
        Ok(HostMemMapping {
            size,
            host_addr: host_addr as u64,
        })
    }

    /// Size of the mapping in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host virtual address of the mapping.
    pub fn host_address(&self) -> u64 {
        self.host_addr
    }

    /// Read `data.len()` bytes starting at `offset` into `data`.
    /// The caller guarantees the range lies inside the mapping.
    pub(crate) fn read_slice(&self, data: &mut [u8], offset: u64) {
        debug_assert!(offset + data.len() as u64 <= self.size);
        // SAFETY: range checked against the mapping above.
        let src = unsafe {
            std::slice::from_raw_parts((self.host_addr + offset) as *const u8, data.len())
        };
        data.copy_from_slice(src);
    }

    /// Write `data` starting at `offset`.
    /// The caller guarantees the range lies inside the mapping.
    pub(crate) fn write_slice(&self, data: &[u8], offset: u64) {
        debug_assert!(offset + data.len() as u64 <= self.size);
        // SAFETY: range checked against the mapping above.
        let dst = unsafe {
            std::slice::from_raw_parts_mut((self.host_addr + offset) as *mut u8, data.len())
        };
        dst.copy_from_slice(data);
    }
}

impl Drop for HostMemMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact range returned by mmap.
        unsafe {
            libc::munmap(self.host_addr as *mut libc::c_void, self.size as libc::size_t);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mapping_round_trip() {
        let mapping = HostMemMapping::new(0x1000).unwrap();
        assert_eq!(mapping.size(), 0x1000);

        let data = [0x5a_u8; 16];
        let mut res = [0_u8; 16];
        mapping.write_slice(&data, 0xff0);
        mapping.read_slice(&mut res, 0xff0);
        assert_eq!(data, res);
    }

    #[test]
    fn test_zero_sized_mapping() {
        assert!(HostMemMapping::new(0).is_err());
    }

    #[test]
    fn test_fresh_mapping_reads_zero() {
        let mapping = HostMemMapping::new(0x1000).unwrap();
        let mut res = [0xff_u8; 8];
        mapping.read_slice(&mut res, 0);
        assert_eq!(res, [0_u8; 8]);
    }
}
