use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "unexpected end of buffer")]
pub struct UnexpectedEnd;

pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Value with a fixed wire representation.
pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u8> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u16> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_be(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_be(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_be(*self);
    }
}

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Decode a variable-length integer.
    fn get_var(&mut self) -> Result<u64>;
}

impl<B: Buf> BufExt for B {
    fn get<T: Codec>(&mut self) -> Result<T> {
        T::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        if self.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        let first = self.get_u8();
        let len = 1 << (first >> 6);
        let mut value = u64::from(first & 0x3f);
        if self.remaining() < len - 1 {
            return Err(UnexpectedEnd);
        }
        if len > 1 {
            let mut rest = [0; 7];
            self.copy_to_slice(&mut rest[..len - 1]);
            value = value << (8 * (len - 1)) | BigEndian::read_uint(&rest[..len - 1], len - 1);
        }
        Ok(value)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    /// Encode a variable-length integer in the shortest form that fits.
    fn write_var(&mut self, x: u64);
}

impl<B: BufMut> BufMutExt for B {
    fn write<T: Codec>(&mut self, x: T) {
        x.encode(self);
    }

    fn write_var(&mut self, x: u64) {
        debug_assert!(x < 1 << 62, "var int too large");
        if x < 1 << 6 {
            self.put_u8(x as u8);
        } else if x < 1 << 14 {
            self.put_u16_be(0b01 << 14 | x as u16);
        } else if x < 1 << 30 {
            self.put_u32_be(0b10 << 30 | x as u32);
        } else {
            self.put_u64_be(0b11 << 62 | x);
        }
    }
}

/// Number of bytes `write_var` will use for `x`.
pub fn varint_size(x: u64) -> usize {
    if x < 1 << 6 {
        1
    } else if x < 1 << 14 {
        2
    } else if x < 1 << 30 {
        4
    } else {
        8
    }
}
