use bytemuck::Pod;

use crate::{
    format::{IVec2, IVec3, IVec4, Mat3, Mat4, Sphere, Vec2, Vec3, Vec4},
    io::{Endianness, FileAddr, PointerMode, Stream, StreamError, StreamResult},
};

/// Typed cursor over a [`Stream`].
///
/// Numeric reads follow the current [`Endianness`]; pointer and size fields follow the current
/// [`PointerMode`]. Short reads yield zero-filled values, so callers validate pointers with
/// [`StreamReader::is_valid_pointer`] before following them.
pub struct StreamReader<'a> {
    stream: &'a mut dyn Stream,
    pointer_mode: PointerMode,
    endianness: Endianness,
    base_offsets: Vec<FileAddr>,
    has_sections: bool,
    pointer_mode_scanned: bool,
}

macro_rules! read_numeric {
    ($ty:ty, $read:ident, $read_le:ident, $read_be:ident) => {
        #[inline]
        pub fn $read(&mut self) -> $ty {
            if self.endianness.is_big() { self.$read_be() } else { self.$read_le() }
        }

        #[inline]
        pub fn $read_le(&mut self) -> $ty { <$ty>::from_le_bytes(self.read_array()) }

        #[inline]
        pub fn $read_be(&mut self) -> $ty { <$ty>::from_be_bytes(self.read_array()) }
    };
}

impl<'a> StreamReader<'a> {
    pub fn new(stream: &'a mut dyn Stream) -> Self {
        debug_assert!(stream.can_read());
        Self {
            stream,
            pointer_mode: PointerMode::default(),
            endianness: Endianness::Little,
            base_offsets: Vec::new(),
            has_sections: false,
            pointer_mode_scanned: false,
        }
    }

    #[inline]
    pub fn position(&self) -> FileAddr { self.stream.position() }

    #[inline]
    pub fn seek(&mut self, position: FileAddr) { self.stream.seek(position) }

    #[inline]
    pub fn skip(&mut self, count: i64) {
        let position = self.position() + count;
        self.seek(position);
    }

    #[inline]
    pub fn length(&self) -> FileAddr { self.stream.length() }

    #[inline]
    pub fn remaining(&self) -> FileAddr { self.stream.remaining() }

    #[inline]
    pub fn end_of_file(&self) -> bool { self.stream.end_of_file() }

    #[inline]
    pub fn pointer_mode(&self) -> PointerMode { self.pointer_mode }

    #[inline]
    pub fn set_pointer_mode(&mut self, mode: PointerMode) { self.pointer_mode = mode; }

    #[inline]
    pub fn endianness(&self) -> Endianness { self.endianness }

    #[inline]
    pub fn set_endianness(&mut self, endianness: Endianness) { self.endianness = endianness; }

    #[inline]
    pub fn has_sections(&self) -> bool { self.has_sections }

    #[inline]
    pub(crate) fn set_has_sections(&mut self, value: bool) { self.has_sections = value; }

    #[inline]
    pub fn pointer_mode_scanned(&self) -> bool { self.pointer_mode_scanned }

    #[inline]
    pub(crate) fn set_pointer_mode_scanned(&mut self, value: bool) {
        self.pointer_mode_scanned = value;
    }

    /// Makes the current position the base for offset-aware reads.
    pub fn push_base_offset(&mut self) {
        let position = self.position();
        self.base_offsets.push(position);
    }

    pub fn pop_base_offset(&mut self) -> FileAddr { self.base_offsets.pop().unwrap_or_default() }

    /// Top of the base-offset stack, null when empty.
    #[inline]
    pub fn base_offset(&self) -> FileAddr {
        self.base_offsets.last().copied().unwrap_or_default()
    }

    #[inline]
    pub fn base_offset_depth(&self) -> usize { self.base_offsets.len() }

    /// Runs `func` positioned at `position`, then restores the cursor and any base offsets
    /// `func` left pushed.
    pub fn read_at<T>(&mut self, position: FileAddr, func: impl FnOnce(&mut Self) -> T) -> T {
        let return_position = self.position();
        let base_depth = self.base_offsets.len();
        self.seek(position);
        let value = func(self);
        self.base_offsets.truncate(base_depth);
        self.seek(return_position);
        value
    }

    /// [`read_at`](Self::read_at) relative to the current base offset.
    pub fn read_at_offset_aware<T>(
        &mut self,
        offset: FileAddr,
        func: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let position = offset + self.base_offset();
        self.read_at(position, func)
    }

    /// Non-null and not beyond the end of the stream.
    pub fn is_valid_pointer(&self, address: FileAddr, offset_aware: bool) -> bool {
        if address <= FileAddr::NULL {
            return false;
        }
        let address = if offset_aware { address + self.base_offset() } else { address };
        address <= self.length()
    }

    #[inline]
    pub fn read_buffer(&mut self, buffer: &mut [u8]) -> usize { self.stream.read_buffer(buffer) }

    pub fn read_bytes(&mut self, count: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; count];
        let read = self.read_buffer(&mut buffer);
        buffer.truncate(read);
        buffer
    }

    #[inline]
    pub fn read_array<const N: usize>(&mut self) -> [u8; N] {
        let mut buffer = [0u8; N];
        self.stream.read_buffer(&mut buffer);
        buffer
    }

    /// Raw copies are only meaningful when the stream is in host byte order.
    fn ensure_native(&self) -> StreamResult {
        if self.endianness.is_native() { Ok(()) } else { Err(StreamError::BadFormat) }
    }

    /// Fails with [`StreamError::BadCount`] unless `count` records of `record_size` bytes fit
    /// between the cursor and the end of the stream.
    pub fn ensure_records(&self, count: usize, record_size: usize) -> StreamResult<usize> {
        let available = self.remaining().as_u64();
        match count.checked_mul(record_size) {
            Some(size) if size as u64 <= available => Ok(count),
            _ => Err(StreamError::BadCount),
        }
    }

    /// Bulk copy of `count` elements in host byte order. Stops short at the end of the stream.
    pub fn read_native_vec<T: Pod>(&mut self, count: usize) -> StreamResult<Vec<T>> {
        self.ensure_native()?;
        let available = self.remaining().as_u64() as usize / std::mem::size_of::<T>().max(1);
        let mut values = vec![T::zeroed(); count.min(available)];
        self.read_buffer(bytemuck::cast_slice_mut(&mut values));
        Ok(values)
    }

    #[inline]
    pub fn read_u8(&mut self) -> u8 { self.read_array::<1>()[0] }

    #[inline]
    pub fn read_i8(&mut self) -> i8 { self.read_u8() as i8 }

    #[inline]
    pub fn read_bool(&mut self) -> bool { self.read_u8() != 0 }

    #[inline]
    pub fn read_char(&mut self) -> char { self.read_u8() as char }

    read_numeric!(u16, read_u16, read_u16_le, read_u16_be);
    read_numeric!(i16, read_i16, read_i16_le, read_i16_be);
    read_numeric!(u32, read_u32, read_u32_le, read_u32_be);
    read_numeric!(i32, read_i32, read_i32_le, read_i32_be);
    read_numeric!(u64, read_u64, read_u64_le, read_u64_be);
    read_numeric!(i64, read_i64, read_i64_le, read_i64_be);
    read_numeric!(f32, read_f32, read_f32_le, read_f32_be);
    read_numeric!(f64, read_f64, read_f64_le, read_f64_be);

    /// Pointer field, 4 or 8 bytes depending on the pointer mode.
    pub fn read_ptr(&mut self) -> FileAddr {
        match self.pointer_mode {
            PointerMode::Mode32Bit => self.read_ptr_32(),
            PointerMode::Mode64Bit => self.read_ptr_64(),
        }
    }

    /// 32-bit pointers are sign extended.
    #[inline]
    pub fn read_ptr_32(&mut self) -> FileAddr { FileAddr(self.read_i32() as i64) }

    #[inline]
    pub fn read_ptr_64(&mut self) -> FileAddr { FileAddr(self.read_i64()) }

    pub fn read_size(&mut self) -> u64 {
        match self.pointer_mode {
            PointerMode::Mode32Bit => self.read_size_32(),
            PointerMode::Mode64Bit => self.read_size_64(),
        }
    }

    #[inline]
    pub fn read_size_32(&mut self) -> u64 { self.read_u32() as u64 }

    #[inline]
    pub fn read_size_64(&mut self) -> u64 { self.read_u64() }

    pub fn read_vec2(&mut self) -> Vec2 { Vec2 { x: self.read_f32(), y: self.read_f32() } }

    pub fn read_vec3(&mut self) -> Vec3 {
        Vec3 { x: self.read_f32(), y: self.read_f32(), z: self.read_f32() }
    }

    pub fn read_vec4(&mut self) -> Vec4 {
        Vec4 { x: self.read_f32(), y: self.read_f32(), z: self.read_f32(), w: self.read_f32() }
    }

    pub fn read_ivec2(&mut self) -> IVec2 { IVec2 { x: self.read_i32(), y: self.read_i32() } }

    pub fn read_ivec3(&mut self) -> IVec3 {
        IVec3 { x: self.read_i32(), y: self.read_i32(), z: self.read_i32() }
    }

    pub fn read_ivec4(&mut self) -> IVec4 {
        IVec4 { x: self.read_i32(), y: self.read_i32(), z: self.read_i32(), w: self.read_i32() }
    }

    /// Raw copy; [`StreamError::BadFormat`] unless the stream is in native byte order.
    pub fn read_mat3(&mut self) -> StreamResult<Mat3> {
        self.ensure_native()?;
        let mut matrix = Mat3::default();
        self.read_buffer(bytemuck::bytes_of_mut(&mut matrix));
        Ok(matrix)
    }

    /// Raw copy; [`StreamError::BadFormat`] unless the stream is in native byte order.
    pub fn read_mat4(&mut self) -> StreamResult<Mat4> {
        self.ensure_native()?;
        let mut matrix = Mat4::default();
        self.read_buffer(bytemuck::bytes_of_mut(&mut matrix));
        Ok(matrix)
    }

    pub fn read_sphere(&mut self) -> Sphere {
        Sphere { center: self.read_vec3(), radius: self.read_f32() }
    }

    /// Null-terminated string at the cursor. The terminator is consumed when present; an
    /// unterminated string ends at the end of the stream.
    ///
    /// The length is measured first, then the string is read in one go.
    pub fn read_str(&mut self) -> String {
        let start = self.position();
        let mut length = 0usize;
        let terminated = loop {
            let mut byte = [0u8; 1];
            if self.read_buffer(&mut byte) == 0 {
                break false;
            }
            if byte[0] == 0 {
                break true;
            }
            length += 1;
        };
        if length == 0 {
            return String::new();
        }
        self.seek(start);
        let bytes = self.read_bytes(length);
        if terminated {
            self.skip(1);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Fixed-size string field, truncated at the first null.
    pub fn read_str_sized(&mut self, size: usize) -> String {
        let bytes = self.read_bytes(size);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    pub fn read_str_at(&mut self, position: FileAddr) -> String {
        self.read_at(position, |reader| reader.read_str())
    }

    /// Reads a pointer and the absolute string it points to.
    pub fn read_str_ptr(&mut self) -> String {
        let offset = self.read_ptr();
        if offset.is_null() {
            return String::new();
        }
        self.read_str_at(offset)
    }

    /// Reads a pointer and the string it points to, relative to the current base offset.
    pub fn read_str_ptr_offset_aware(&mut self) -> String {
        let offset = self.read_ptr();
        if offset.is_null() {
            return String::new();
        }
        self.read_at_offset_aware(offset, |reader| reader.read_str())
    }
}
