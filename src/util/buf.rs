use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

//TODO convenience for maps with a generic element codec

pub trait BufExt: Buf + Sized {
    fn try_get_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_usize_varint()?;
        if self.remaining() < len {
            bail!("buffer underflow: string of length {} with {} bytes remaining", len, self.remaining());
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }

    fn try_get_bool(&mut self) -> anyhow::Result<bool> {
        match self.try_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => bail!("invalid value for a boolean: {}", b),
        }
    }

    /// reads exactly `len` bytes, failing instead of panicking if the buffer is too short
    fn try_get_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            bail!("buffer underflow: {} bytes expected, {} remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_get_string_list(&mut self) -> anyhow::Result<Vec<String>> {
        let num = self.try_get_usize_varint()?;
        let mut result = Vec::with_capacity(num.min(1024));
        for _ in 0..num {
            result.push(self.try_get_string()?);
        }
        Ok(result)
    }
}

pub trait BufMutExt: BufMut + Sized {
    fn put_string(&mut self, s: &str) {
        self.put_usize_varint(s.len());
        self.put_slice(s.as_bytes());
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(if value { 1 } else { 0 });
    }

    fn put_string_list(&mut self, list: &[String]) {
        self.put_usize_varint(list.len());
        for s in list {
            self.put_string(s);
        }
    }
}

impl <T: Buf> BufExt for T {}

impl <T: BufMut> BufMutExt for T {}
