//! Integer widths the PVM can load and store.

/// Fixed-width integers understood by `read_int`/`write_int`. Sealed so the
/// little-endian codec stays in one place.
pub trait MemInt: Copy + private::Sealed {
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes, little endian.
    fn from_le(bytes: &[u8]) -> Self;

    /// Encode into the first `SIZE` bytes, little endian.
    fn put_le(self, out: &mut [u8]);

    /// Widen to 64 bits: sign-extending for signed types, zero-extending
    /// for unsigned ones.
    fn widen(self) -> u64;
}

mod private {
    pub trait Sealed {}
}

macro_rules! mem_int {
    ($($int:ty as $wide:ty),* $(,)?) => {
        $(
            impl private::Sealed for $int {}

            impl MemInt for $int {
                const SIZE: usize = std::mem::size_of::<$int>();

                fn from_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$int>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$int>::from_le_bytes(buf)
                }

                fn put_le(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn widen(self) -> u64 {
                    self as $wide as u64
                }
            }
        )*
    };
}

mem_int!(
    u8 as u64,
    u16 as u64,
    u32 as u64,
    u64 as u64,
    i8 as i64,
    i16 as i64,
    i32 as i64,
    i64 as i64,
);
