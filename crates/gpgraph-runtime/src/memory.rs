//! Host-backed simulated device memory.
//!
//! Memory is a set of disjoint regions keyed by base address. Regions come
//! from two places: [`allocate`](SimulatedMemory::allocate) hands out
//! addresses from a private bump range, and
//! [`bind`](SimulatedMemory::bind) backs an address an alloc node reserved
//! in the virtual window. Every access must fall entirely inside one
//! region.

use std::collections::BTreeMap;

use gpgraph_core::address::{aligned_size, ALLOCATION_GRANULARITY};
use gpgraph_core::{CopyShape, DevicePtr, MemcpyParams, MemsetParams, SetShape};
use gpgraph_exec::ResourceError;

const PHYSICAL_BASE: u64 = 0x1000_0000;

#[derive(Debug)]
struct Region {
    data: Vec<u8>,
    /// Charged against capacity (aligned size).
    charged: u64,
}

#[derive(Debug)]
pub struct SimulatedMemory {
    regions: BTreeMap<u64, Region>,
    capacity: u64,
    used: u64,
    next: u64,
}

impl SimulatedMemory {
    pub fn new(capacity: u64) -> Self {
        SimulatedMemory {
            regions: BTreeMap::new(),
            capacity,
            used: 0,
            next: PHYSICAL_BASE,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn available(&self) -> u64 {
        self.capacity - self.used
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Allocates `size` zeroed bytes at a fresh address.
    pub fn allocate(&mut self, size: u64) -> Result<DevicePtr, ResourceError> {
        let base = self.next;
        let next = base
            .checked_add(aligned_size(size))
            .ok_or(ResourceError::OutOfMemory {
                requested: size,
                available: self.available(),
            })?;
        let charged = self.charge(size)?;
        self.next = next;
        self.insert(base, size, charged);
        Ok(DevicePtr(base))
    }

    /// Backs `size` zeroed bytes at a caller-chosen address.
    pub fn bind(&mut self, address: DevicePtr, size: u64) -> Result<(), ResourceError> {
        let free = address.0 % ALLOCATION_GRANULARITY == 0
            && address
                .0
                .checked_add(aligned_size(size))
                .is_some_and(|end| !self.overlaps(address.0, end));
        if !free {
            return Err(ResourceError::AddressInUse { address });
        }
        let charged = self.charge(size)?;
        self.insert(address.0, size, charged);
        Ok(())
    }

    /// Releases the region starting at `address`.
    pub fn free(&mut self, address: DevicePtr) -> Result<(), ResourceError> {
        let region = self
            .regions
            .remove(&address.0)
            .ok_or(ResourceError::UnknownAddress { address })?;
        self.used -= region.charged;
        Ok(())
    }

    pub fn is_allocated(&self, address: DevicePtr) -> bool {
        self.regions.contains_key(&address.0)
    }

    pub fn read(&self, address: DevicePtr, len: u64) -> Result<Vec<u8>, ResourceError> {
        Ok(self.slice(address, len)?.to_vec())
    }

    pub fn write(&mut self, address: DevicePtr, bytes: &[u8]) -> Result<(), ResourceError> {
        self.slice_mut(address, bytes.len() as u64)?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Executes a copy. Source and destination may live in the same region.
    pub fn copy(&mut self, params: &MemcpyParams) -> Result<(), ResourceError> {
        match params.shape {
            CopyShape::Linear { bytes } => {
                let data = self.read(params.src.ptr, bytes)?;
                self.write(params.dst.ptr, &data)
            }
            CopyShape::Pitched {
                width_bytes,
                height,
                src_pitch,
                dst_pitch,
            } => {
                // Validate both spans before touching memory.
                self.slice(params.src.ptr, params.shape.src_span())?;
                self.slice(params.dst.ptr, params.shape.dst_span())?;
                for row in 0..height {
                    let data = self.read(params.src.ptr.offset(row * src_pitch), width_bytes)?;
                    self.write(params.dst.ptr.offset(row * dst_pitch), &data)?;
                }
                Ok(())
            }
        }
    }

    /// Executes a memset, writing the low `element_size` bytes of the value
    /// (little endian) into every element.
    pub fn set(&mut self, params: &MemsetParams) -> Result<(), ResourceError> {
        let elem = params.element_size as usize;
        let pattern = &params.value.to_le_bytes()[..elem];
        let dst = self.slice_mut(params.dst, params.span())?;
        match params.shape {
            SetShape::Linear { .. } => fill(dst, pattern),
            SetShape::Pitched {
                width,
                height,
                pitch_bytes,
            } => {
                let row_len = width as usize * elem;
                for row in 0..height as usize {
                    let start = row * pitch_bytes as usize;
                    fill(&mut dst[start..start + row_len], pattern);
                }
            }
        }
        Ok(())
    }

    fn charge(&mut self, size: u64) -> Result<u64, ResourceError> {
        let charged = aligned_size(size);
        if charged > self.available() {
            return Err(ResourceError::OutOfMemory {
                requested: size,
                available: self.available(),
            });
        }
        self.used += charged;
        Ok(charged)
    }

    fn insert(&mut self, base: u64, size: u64, charged: u64) {
        self.regions.insert(
            base,
            Region {
                data: vec![0; size as usize],
                charged,
            },
        );
    }

    /// Whether `[base, end)` touches a live region.
    fn overlaps(&self, base: u64, end: u64) -> bool {
        let before = self
            .regions
            .range(..=base)
            .next_back()
            .is_some_and(|(start, r)| start.saturating_add(r.charged) > base);
        let after = self.regions.range(base..end).next().is_some();
        before || after
    }

    fn locate(&self, address: DevicePtr, len: u64) -> Result<(u64, usize), ResourceError> {
        let (base, region) = self
            .regions
            .range(..=address.0)
            .next_back()
            .ok_or(ResourceError::UnknownAddress { address })?;
        let offset = address.0 - base;
        if offset
            .checked_add(len)
            .map_or(true, |end| end > region.data.len() as u64)
        {
            return Err(ResourceError::UnknownAddress { address });
        }
        Ok((*base, offset as usize))
    }

    fn slice(&self, address: DevicePtr, len: u64) -> Result<&[u8], ResourceError> {
        let (base, offset) = self.locate(address, len)?;
        let region = &self.regions[&base];
        Ok(&region.data[offset..offset + len as usize])
    }

    fn slice_mut(&mut self, address: DevicePtr, len: u64) -> Result<&mut [u8], ResourceError> {
        let (base, offset) = self.locate(address, len)?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(ResourceError::UnknownAddress { address })?;
        Ok(&mut region.data[offset..offset + len as usize])
    }
}

fn fill(dst: &mut [u8], pattern: &[u8]) {
    for chunk in dst.chunks_mut(pattern.len()) {
        chunk.copy_from_slice(&pattern[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpgraph_core::{DeviceOrdinal, MemLocation};

    #[test]
    fn allocate_read_write() {
        let mut mem = SimulatedMemory::new(1 << 20);
        let a = mem.allocate(16).unwrap();
        assert_eq!(mem.read(a, 16).unwrap(), vec![0; 16]);
        mem.write(a.offset(4), &[1, 2, 3]).unwrap();
        assert_eq!(mem.read(a.offset(3), 5).unwrap(), vec![0, 1, 2, 3, 0]);
        assert_eq!(mem.used(), 256);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut mem = SimulatedMemory::new(1 << 20);
        let a = mem.allocate(16).unwrap();
        assert_eq!(
            mem.read(a.offset(8), 16),
            Err(ResourceError::UnknownAddress { address: a.offset(8) })
        );
        assert!(mem.write(DevicePtr(0x10), &[0]).is_err());
    }

    #[test]
    fn capacity_is_enforced_and_returned_on_free() {
        let mut mem = SimulatedMemory::new(512);
        let a = mem.allocate(300).unwrap();
        assert_eq!(
            mem.allocate(1),
            Err(ResourceError::OutOfMemory {
                requested: 1,
                available: 0
            })
        );
        mem.free(a).unwrap();
        assert_eq!(mem.available(), 512);
        assert_eq!(mem.free(a), Err(ResourceError::UnknownAddress { address: a }));
    }

    #[test]
    fn bind_rejects_overlap() {
        let mut mem = SimulatedMemory::new(1 << 20);
        let at = DevicePtr(0x7f00_0000_0000);
        mem.bind(at, 1000).unwrap();
        assert_eq!(
            mem.bind(at.offset(256), 10),
            Err(ResourceError::AddressInUse { address: at.offset(256) })
        );
        mem.bind(at.offset(1024), 10).unwrap();
    }

    #[test]
    fn extents_near_the_top_of_the_address_space_fail_cleanly() {
        let mut mem = SimulatedMemory::new(1 << 20);
        let a = mem.allocate(16).unwrap();
        assert_eq!(
            mem.read(a.offset(8), u64::MAX),
            Err(ResourceError::UnknownAddress { address: a.offset(8) })
        );
        let top = DevicePtr(u64::MAX - 255);
        assert_eq!(
            mem.bind(top, 1024),
            Err(ResourceError::AddressInUse { address: top })
        );
        assert_eq!(mem.region_count(), 1);
    }

    #[test]
    fn pitched_copy_moves_rows() {
        let mut mem = SimulatedMemory::new(1 << 20);
        let src = mem.allocate(64).unwrap();
        let dst = mem.allocate(64).unwrap();
        mem.write(src, &(0u8..64).collect::<Vec<_>>()).unwrap();
        let params = MemcpyParams {
            src: MemLocation::device(src, DeviceOrdinal(0)),
            dst: MemLocation::device(dst, DeviceOrdinal(0)),
            shape: CopyShape::Pitched {
                width_bytes: 2,
                height: 3,
                src_pitch: 8,
                dst_pitch: 4,
            },
        };
        mem.copy(&params).unwrap();
        assert_eq!(
            mem.read(dst, 12).unwrap(),
            vec![0, 1, 0, 0, 8, 9, 0, 0, 16, 17, 0, 0]
        );
    }

    #[test]
    fn memset_writes_element_pattern() {
        let mut mem = SimulatedMemory::new(1 << 20);
        let a = mem.allocate(8).unwrap();
        let params = MemsetParams {
            dst: a,
            device: DeviceOrdinal(0),
            value: 0xAABB,
            element_size: 2,
            shape: SetShape::Linear { count: 3 },
        };
        mem.set(&params).unwrap();
        assert_eq!(
            mem.read(a, 8).unwrap(),
            vec![0xBB, 0xAA, 0xBB, 0xAA, 0xBB, 0xAA, 0, 0]
        );
    }
}
