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

//! # Device Tree
//!
//! A mutable Flattened-Device-Tree builder. The machine creates the tree at
//! construction time, devices append their nodes while they attach, and the
//! tree is serialized into the guest-visible blob on boot (or on demand for
//! dumping).
//!
//! Nodes live in an arena and are addressed by `FdtNodeHandle`, so holding a
//! handle never keeps a node alive on its own and reference cycles cannot
//! form. Properties keep their insertion order for stable serialized diffs.
//! Phandles are assigned lazily on the first `get_phandle` call and are
//! stable afterwards, so unreferenced nodes consume no ids.

use byteorder::{BigEndian, ByteOrder};

use crate::errors::{ErrorKind, Result};

/// Magic number of a serialized Device Tree blob.
pub const FDT_MAGIC: u32 = 0xd00d_feed;

const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
const FDT_HEADER_SIZE: usize = 40;
// One terminating reservation entry (two zero u64s).
const FDT_RSVMAP_SIZE: usize = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_END: u32 = 0x9;

// Sanity bound for a single property payload.
const FDT_MAX_PROP_SIZE: usize = 1 << 16;

/// Handle addressing one node of a `FdtTree`.
/// Handles stay valid for the whole lifetime of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtNodeHandle(usize);

struct FdtNode {
    name: String,
    // Property name/payload pairs in insertion order.
    props: Vec<(String, Vec<u8>)>,
    children: Vec<usize>,
    phandle: Option<u32>,
}

/// In-memory Device Tree.
pub struct FdtTree {
    nodes: Vec<FdtNode>,
    next_phandle: u32,
}

impl Default for FdtTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FdtTree {
    /// Create a tree holding only the nameless root node.
    pub fn new() -> FdtTree {
        FdtTree {
            nodes: vec![FdtNode {
                name: String::new(),
                props: Vec::new(),
                children: Vec::new(),
                phandle: None,
            }],
            next_phandle: 1,
        }
    }

    /// Get the handle of the root node.
    pub fn root(&self) -> FdtNodeHandle {
        FdtNodeHandle(0)
    }

    /// Append a child node under `parent` and return its handle.
    ///
    /// # Arguments
    ///
    /// * `parent` - Parent node handle.
    /// * `name` - Node name, usually `name` or `name@unit`.
    pub fn add_node(&mut self, parent: FdtNodeHandle, name: &str) -> Result<FdtNodeHandle> {
        if name.is_empty() || name.contains('\0') {
            return Err(ErrorKind::NodeNameInvalid(name.to_string()).into());
        }
        let idx = self.nodes.len();
        self.nodes.push(FdtNode {
            name: name.to_string(),
            props: Vec::new(),
            children: Vec::new(),
            phandle: None,
        });
        self.nodes[parent.0].children.push(idx);
        Ok(FdtNodeHandle(idx))
    }

    /// Find a direct child of `parent` by its full name.
    pub fn find_node(&self, parent: FdtNodeHandle, name: &str) -> Option<FdtNodeHandle> {
        self.nodes[parent.0]
            .children
            .iter()
            .find(|&&c| self.nodes[c].name == name)
            .map(|&c| FdtNodeHandle(c))
    }

    /// Find a direct child named `name@unit` (unit in lower-case hex).
    pub fn find_reg(&self, parent: FdtNodeHandle, name: &str, unit: u64) -> Option<FdtNodeHandle> {
        self.find_node(parent, &format!("{}@{:x}", name, unit))
    }

    /// Find a direct child by base name, ignoring the unit address.
    pub fn find_node_any(&self, parent: FdtNodeHandle, name: &str) -> Option<FdtNodeHandle> {
        self.nodes[parent.0]
            .children
            .iter()
            .find(|&&c| {
                let node_name = self.nodes[c].name.as_str();
                node_name == name
                    || (node_name.starts_with(name)
                        && node_name.as_bytes().get(name.len()) == Some(&b'@'))
            })
            .map(|&c| FdtNodeHandle(c))
    }

    /// Get the name of a node.
    pub fn node_name(&self, node: FdtNodeHandle) -> &str {
        &self.nodes[node.0].name
    }

    /// Get the payload of property `name` of `node`, if present.
    pub fn prop(&self, node: FdtNodeHandle, name: &str) -> Option<&[u8]> {
        self.nodes[node.0]
            .props
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Set a raw property. An existing property with the same name is
    /// replaced in place, keeping its position; a fresh one is appended.
    pub fn set_prop(&mut self, node: FdtNodeHandle, name: &str, val: &[u8]) -> Result<()> {
        if val.len() >= FDT_MAX_PROP_SIZE {
            return Err(ErrorKind::PropDataTooLong(name.to_string(), val.len()).into());
        }
        let props = &mut self.nodes[node.0].props;
        if let Some(slot) = props.iter_mut().find(|(n, _)| n == name) {
            slot.1 = val.to_vec();
        } else {
            props.push((name.to_string(), val.to_vec()));
        }
        Ok(())
    }

    /// Set an empty (boolean) property.
    pub fn set_prop_empty(&mut self, node: FdtNodeHandle, name: &str) -> Result<()> {
        self.set_prop(node, name, &[])
    }

    /// Set a single-cell property.
    pub fn set_prop_u32(&mut self, node: FdtNodeHandle, name: &str, val: u32) -> Result<()> {
        let mut bytes = [0_u8; 4];
        BigEndian::write_u32(&mut bytes, val);
        self.set_prop(node, name, &bytes)
    }

    /// Set a two-cell property.
    pub fn set_prop_u64(&mut self, node: FdtNodeHandle, name: &str, val: u64) -> Result<()> {
        let mut bytes = [0_u8; 8];
        BigEndian::write_u64(&mut bytes, val);
        self.set_prop(node, name, &bytes)
    }

    /// Set a cell-array property.
    pub fn set_prop_cells(&mut self, node: FdtNodeHandle, name: &str, cells: &[u32]) -> Result<()> {
        let mut bytes = vec![0_u8; cells.len() * 4];
        for (i, cell) in cells.iter().enumerate() {
            BigEndian::write_u32(&mut bytes[i * 4..(i + 1) * 4], *cell);
        }
        self.set_prop(node, name, &bytes)
    }

    /// Set a NUL-terminated string property.
    pub fn set_prop_str(&mut self, node: FdtNodeHandle, name: &str, val: &str) -> Result<()> {
        let mut bytes = val.as_bytes().to_vec();
        bytes.push(0);
        self.set_prop(node, name, &bytes)
    }

    /// Set a string-list property, every entry NUL-terminated.
    pub fn set_prop_string_list(
        &mut self,
        node: FdtNodeHandle,
        name: &str,
        val: &[&str],
    ) -> Result<()> {
        let mut bytes = Vec::new();
        for s in val {
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
        }
        self.set_prop(node, name, &bytes)
    }

    /// Set a `reg` style property: `<address size>` as two u64 cells pairs.
    pub fn set_prop_reg(
        &mut self,
        node: FdtNodeHandle,
        name: &str,
        addr: u64,
        size: u64,
    ) -> Result<()> {
        let mut bytes = [0_u8; 16];
        BigEndian::write_u64(&mut bytes[0..8], addr);
        BigEndian::write_u64(&mut bytes[8..16], size);
        self.set_prop(node, name, &bytes)
    }

    /// Get the phandle of a node, assigning the next free id on first use.
    /// The assigned id is written back as the node's `phandle` property and
    /// stays stable for the tree lifetime.
    pub fn get_phandle(&mut self, node: FdtNodeHandle) -> u32 {
        if let Some(phandle) = self.nodes[node.0].phandle {
            return phandle;
        }
        let phandle = self.next_phandle;
        self.next_phandle += 1;
        self.nodes[node.0].phandle = Some(phandle);
        // set_prop only fails on oversized payloads, 4 bytes never do.
        self.set_prop_u32(node, "phandle", phandle).unwrap();
        phandle
    }

    fn serialize_node(
        &self,
        idx: usize,
        structure: &mut Vec<u8>,
        strings: &mut Vec<u8>,
        string_offs: &mut Vec<(String, u32)>,
    ) {
        push_u32(structure, FDT_BEGIN_NODE);
        structure.extend_from_slice(self.nodes[idx].name.as_bytes());
        structure.push(0);
        pad_to_cell(structure);

        for (name, val) in &self.nodes[idx].props {
            let name_off = match string_offs.iter().find(|(n, _)| n == name) {
                Some((_, off)) => *off,
                None => {
                    let off = strings.len() as u32;
                    strings.extend_from_slice(name.as_bytes());
                    strings.push(0);
                    string_offs.push((name.clone(), off));
                    off
                }
            };
            push_u32(structure, FDT_PROP);
            push_u32(structure, val.len() as u32);
            push_u32(structure, name_off);
            structure.extend_from_slice(val);
            pad_to_cell(structure);
        }

        for child in &self.nodes[idx].children {
            self.serialize_node(*child, structure, strings, string_offs);
        }
        push_u32(structure, FDT_END_NODE);
    }

    /// Serialize the tree into a standards-compliant Device Tree blob.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut structure = Vec::new();
        let mut strings = Vec::new();
        let mut string_offs: Vec<(String, u32)> = Vec::new();
        self.serialize_node(0, &mut structure, &mut strings, &mut string_offs);
        push_u32(&mut structure, FDT_END);

        let off_struct = FDT_HEADER_SIZE + FDT_RSVMAP_SIZE;
        let off_strings = off_struct + structure.len();
        let total_size = off_strings + strings.len();

        let mut blob = Vec::with_capacity(total_size);
        push_u32(&mut blob, FDT_MAGIC);
        push_u32(&mut blob, total_size as u32);
        push_u32(&mut blob, off_struct as u32);
        push_u32(&mut blob, off_strings as u32);
        push_u32(&mut blob, FDT_HEADER_SIZE as u32);
        push_u32(&mut blob, FDT_VERSION);
        push_u32(&mut blob, FDT_LAST_COMP_VERSION);
        // boot_cpuid_phys
        push_u32(&mut blob, 0);
        push_u32(&mut blob, strings.len() as u32);
        push_u32(&mut blob, structure.len() as u32);
        // Terminating memory reservation entry.
        blob.extend_from_slice(&[0_u8; FDT_RSVMAP_SIZE]);
        blob.extend_from_slice(&structure);
        blob.extend_from_slice(&strings);
        Ok(blob)
    }
}

fn push_u32(bytes: &mut Vec<u8>, val: u32) {
    let mut buf = [0_u8; 4];
    BigEndian::write_u32(&mut buf, val);
    bytes.extend_from_slice(&buf);
}

fn pad_to_cell(bytes: &mut Vec<u8>) {
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
}
