//! Typed access to the guest's linear memory.
//!
//! All multi-byte reads and writes are little-endian, matching the wasm32
//! memory model the guest compiles against. A fresh [`wasmer::MemoryView`]
//! is taken for every access, so growth of the guest memory between calls
//! never leaves a stale view behind; `resetMemoryDataView` additionally
//! re-binds the handle from the instance exports.
//!
//! 64-bit integers cross the boundary as two 32-bit halves
//! (`low + high * 2^32`, sign taken from the high word), the layout the
//! guest's runtime reads and writes them in.

use wasmer::{AsStoreRef, Memory};

use crate::error::VmError;

/// Handle to the guest's exported linear memory.
#[derive(Clone, Debug, Default)]
pub struct MemView {
    memory: Option<Memory>,
}

impl MemView {
    /// Bind (or re-bind) the view to a memory export.
    pub fn bind(&mut self, memory: Memory) {
        self.memory = Some(memory);
    }

    pub fn is_bound(&self) -> bool {
        self.memory.is_some()
    }

    fn memory(&self) -> Result<&Memory, VmError> {
        self.memory.as_ref().ok_or(VmError::ModuleNotLoaded)
    }

    /// Current byte size of the guest memory.
    pub fn data_size(&self, store: &impl AsStoreRef) -> Result<u64, VmError> {
        Ok(self.memory()?.view(store).data_size())
    }

    pub fn read_bytes(
        &self,
        store: &impl AsStoreRef,
        addr: u64,
        len: usize,
    ) -> Result<Vec<u8>, VmError> {
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.memory()?.view(store).read(addr, &mut buf)?;
        }
        Ok(buf)
    }

    pub fn write_bytes(
        &self,
        store: &impl AsStoreRef,
        addr: u64,
        bytes: &[u8],
    ) -> Result<(), VmError> {
        if !bytes.is_empty() {
            self.memory()?.view(store).write(addr, bytes)?;
        }
        Ok(())
    }

    pub fn get_u8(&self, store: &impl AsStoreRef, addr: u64) -> Result<u8, VmError> {
        let mut buf = [0u8; 1];
        self.memory()?.view(store).read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn set_u8(&self, store: &impl AsStoreRef, addr: u64, v: u8) -> Result<(), VmError> {
        self.memory()?.view(store).write(addr, &[v])?;
        Ok(())
    }

    pub fn get_u32(&self, store: &impl AsStoreRef, addr: u64) -> Result<u32, VmError> {
        let mut buf = [0u8; 4];
        self.memory()?.view(store).read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn set_u32(&self, store: &impl AsStoreRef, addr: u64, v: u32) -> Result<(), VmError> {
        self.memory()?.view(store).write(addr, &v.to_le_bytes())?;
        Ok(())
    }

    pub fn get_i32(&self, store: &impl AsStoreRef, addr: u64) -> Result<i32, VmError> {
        Ok(self.get_u32(store, addr)? as i32)
    }

    pub fn set_i32(&self, store: &impl AsStoreRef, addr: u64, v: i32) -> Result<(), VmError> {
        self.set_u32(store, addr, v as u32)
    }

    /// Read a 64-bit integer as two 32-bit halves, sign from the high word.
    pub fn get_i64(&self, store: &impl AsStoreRef, addr: u64) -> Result<i64, VmError> {
        let low = self.get_u32(store, addr)? as i64;
        let high = self.get_i32(store, addr + 4)? as i64;
        Ok(low + (high << 32))
    }

    /// Write a 64-bit integer as two 32-bit halves.
    pub fn set_i64(&self, store: &impl AsStoreRef, addr: u64, v: i64) -> Result<(), VmError> {
        self.set_u32(store, addr, (v as u64 & 0xffff_ffff) as u32)?;
        self.set_u32(store, addr + 4, (v >> 32) as u32)
    }

    /// Raw bit pattern of the 8-byte slot at `addr`.
    pub fn get_u64(&self, store: &impl AsStoreRef, addr: u64) -> Result<u64, VmError> {
        let mut buf = [0u8; 8];
        self.memory()?.view(store).read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn set_u64(&self, store: &impl AsStoreRef, addr: u64, v: u64) -> Result<(), VmError> {
        self.memory()?.view(store).write(addr, &v.to_le_bytes())?;
        Ok(())
    }

    pub fn get_f64(&self, store: &impl AsStoreRef, addr: u64) -> Result<f64, VmError> {
        Ok(f64::from_bits(self.get_u64(store, addr)?))
    }

    pub fn set_f64(&self, store: &impl AsStoreRef, addr: u64, v: f64) -> Result<(), VmError> {
        self.memory()?
            .view(store)
            .write(addr, &v.to_bits().to_le_bytes())?;
        Ok(())
    }

    /// Read the (ptr, len) pair of a guest slice header at `addr`.
    pub fn slice_header(
        &self,
        store: &impl AsStoreRef,
        addr: u64,
    ) -> Result<(u64, usize), VmError> {
        let ptr = self.get_i64(store, addr)? as u64;
        let len = self.get_i64(store, addr + 8)? as usize;
        Ok((ptr, len))
    }

    /// Read the bytes of the guest slice whose header sits at `addr`.
    pub fn load_slice(&self, store: &impl AsStoreRef, addr: u64) -> Result<Vec<u8>, VmError> {
        let (ptr, len) = self.slice_header(store, addr)?;
        self.read_bytes(store, ptr, len)
    }

    /// Read the UTF-8 string whose (ptr, len) header sits at `addr`.
    /// Invalid sequences are replaced, never fatal.
    pub fn load_string(&self, store: &impl AsStoreRef, addr: u64) -> Result<String, VmError> {
        let bytes = self.load_slice(store, addr)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmer::{Memory, MemoryType, Store};

    fn scratch() -> (Store, MemView) {
        let mut store = Store::default();
        let memory = Memory::new(&mut store, MemoryType::new(1, None, false)).unwrap();
        let mut mem = MemView::default();
        mem.bind(memory);
        (store, mem)
    }

    #[test]
    fn test_i64_halves_bit_exact() {
        let (store, mem) = scratch();
        mem.set_i64(&store, 64, 4294967297).unwrap();
        let bytes = mem.read_bytes(&store, 64, 8).unwrap();
        assert_eq!(hex::encode(bytes), "0100000001000000");

        mem.write_bytes(&store, 72, &[0xff; 8]).unwrap();
        assert_eq!(mem.get_i64(&store, 72).unwrap(), -1);
    }

    #[test]
    fn test_i64_round_trip_extremes() {
        let (store, mem) = scratch();
        for v in [0i64, 1, -1, i64::MIN, i64::MAX, 1 << 32, -(1 << 32) - 7] {
            mem.set_i64(&store, 128, v).unwrap();
            assert_eq!(mem.get_i64(&store, 128).unwrap(), v, "value {}", v);
        }
    }

    #[test]
    fn test_f64_little_endian() {
        let (store, mem) = scratch();
        mem.set_f64(&store, 16, 1.0).unwrap();
        let bytes = mem.read_bytes(&store, 16, 8).unwrap();
        assert_eq!(hex::encode(bytes), "000000000000f03f");
        assert_eq!(mem.get_f64(&store, 16).unwrap(), 1.0);
    }

    #[test]
    fn test_slice_and_string_loads() {
        let (store, mem) = scratch();
        mem.write_bytes(&store, 256, b"hello").unwrap();
        mem.set_i64(&store, 512, 256).unwrap();
        mem.set_i64(&store, 520, 5).unwrap();
        assert_eq!(mem.load_slice(&store, 512).unwrap(), b"hello");
        assert_eq!(mem.load_string(&store, 512).unwrap(), "hello");
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let (store, mem) = scratch();
        let size = mem.data_size(&store).unwrap();
        assert!(mem.get_u32(&store, size).is_err());
    }

    #[test]
    fn test_unbound_view_reports_module_not_loaded() {
        let store = Store::default();
        let mem = MemView::default();
        assert!(matches!(
            mem.get_u8(&store, 0),
            Err(VmError::ModuleNotLoaded)
        ));
    }
}
