/// Flat zero-initialized memory arena addressed by guest offsets.
///
/// Guest programs see addresses starting at 0 regardless of where the
/// backing allocation lives in the host, so a relocated image keeps
/// working and a stray address can never reach host memory.
pub struct HeapArena {
    bytes: Vec<u8>,
}

impl HeapArena {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Reads `len` bytes starting at guest address `addr`, or `None` if any
    /// part of the range falls outside the arena.
    pub fn read(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(len)?;
        self.bytes.get(start..end)
    }

    /// Writes `data` starting at guest address `addr`, or `None` if any part
    /// of the range falls outside the arena.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Option<()> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(data.len())?;
        self.bytes.get_mut(start..end)?.copy_from_slice(data);
        Some(())
    }
}
