use std::io::{self, Read, Write};

use crate::page_math::PAGE_SIZE;

/// One page-sized chunk of captured memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub address: u32,
    pub data: Vec<u8>,
    pub writable: bool,
}

/// Page-granular capture of everything an engine has mapped, sorted
/// ascending by address. Two engines constructed alike and driven through
/// the same operations must produce equal snapshots; this is what the
/// cross-engine golden tests compare.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemorySnapshot {
    pub regions: Vec<MemoryRegion>,
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

impl MemorySnapshot {
    /// Serialize for golden files: a little-endian region count, then per
    /// region its address, data length, data bytes and writable flag.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&(self.regions.len() as u32).to_le_bytes())?;
        for region in &self.regions {
            writer.write_all(&region.address.to_le_bytes())?;
            writer.write_all(&(region.data.len() as u32).to_le_bytes())?;
            writer.write_all(&region.data)?;
            writer.write_all(&[region.writable as u8])?;
        }
        Ok(())
    }

    /// Parse a snapshot written by `write_to`. Every region must carry
    /// exactly one page of data.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<MemorySnapshot> {
        let count = read_u32(reader)?;
        let mut regions = Vec::new();
        for _ in 0..count {
            let address = read_u32(reader)?;
            let len = read_u32(reader)?;
            if len != PAGE_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("region length {} is not a whole page", len),
                ));
            }
            let mut data = vec![0u8; len as usize];
            reader.read_exact(&mut data)?;
            let mut flag = [0u8; 1];
            reader.read_exact(&mut flag)?;
            let writable = match flag[0] {
                0 => false,
                1 => true,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("bad writable flag {}", other),
                    ))
                }
            };
            regions.push(MemoryRegion {
                address,
                data,
                writable,
            });
        }
        Ok(MemorySnapshot { regions })
    }
}
