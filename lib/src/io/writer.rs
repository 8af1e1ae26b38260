use std::collections::{HashMap, VecDeque};

use bytemuck::Pod;

use crate::{
    format::{IVec2, IVec3, IVec4, Mat3, Mat4, Sphere, Vec2, Vec3, Vec4},
    io::{Endianness, FileAddr, PointerMode, Stream, StreamError, StreamResult},
};

pub const PADDING_VALUE: u8 = 0xCC;

/// Deferred payload producer. Runs with the cursor at the end of the stream.
pub type WriteFunc<'s, 'f> = Box<dyn FnOnce(&mut StreamWriter<'s, 'f>) + 'f>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriterSettings {
    /// Identical strings flushed together share one copy.
    pub pool_strings: bool,
}

impl Default for WriterSettings {
    fn default() -> Self { Self { pool_strings: true } }
}

struct StringPointerEntry {
    return_address: FileAddr,
    mode: PointerMode,
    value: String,
    alignment: u32,
}

struct FunctionPointerEntry<'s, 'f> {
    return_address: FileAddr,
    base_address: FileAddr,
    mode: PointerMode,
    func: WriteFunc<'s, 'f>,
}

struct DelayedWriteEntry<'s, 'f> {
    return_address: FileAddr,
    func: WriteFunc<'s, 'f>,
}

/// Typed writer over a [`Stream`] with reserve-now, patch-later pointer pools.
///
/// `'f` bounds the data captured by deferred writes.
pub struct StreamWriter<'s, 'f> {
    stream: &'s mut dyn Stream,
    pointer_mode: PointerMode,
    endianness: Endianness,
    base_offsets: Vec<FileAddr>,
    settings: WriterSettings,
    string_pointer_pool: Vec<StringPointerEntry>,
    written_strings: HashMap<String, FileAddr>,
    pointer_pool: VecDeque<FunctionPointerEntry<'s, 'f>>,
    delayed_write_pool: Vec<DelayedWriteEntry<'s, 'f>>,
}

macro_rules! write_numeric {
    ($ty:ty, $write:ident, $write_le:ident, $write_be:ident) => {
        #[inline]
        pub fn $write(&mut self, value: $ty) {
            if self.endianness.is_big() { self.$write_be(value) } else { self.$write_le(value) }
        }

        #[inline]
        pub fn $write_le(&mut self, value: $ty) { self.write_buffer(&value.to_le_bytes()); }

        #[inline]
        pub fn $write_be(&mut self, value: $ty) { self.write_buffer(&value.to_be_bytes()); }
    };
}

impl<'s, 'f> StreamWriter<'s, 'f> {
    pub fn new(stream: &'s mut dyn Stream) -> Self {
        debug_assert!(stream.can_write());
        Self {
            stream,
            pointer_mode: PointerMode::default(),
            endianness: Endianness::Little,
            base_offsets: Vec::new(),
            settings: WriterSettings::default(),
            string_pointer_pool: Vec::new(),
            written_strings: HashMap::new(),
            pointer_pool: VecDeque::new(),
            delayed_write_pool: Vec::new(),
        }
    }

    pub fn with_settings(stream: &'s mut dyn Stream, settings: WriterSettings) -> Self {
        Self { settings, ..Self::new(stream) }
    }

    #[inline]
    pub fn settings(&self) -> WriterSettings { self.settings }

    #[inline]
    pub fn position(&self) -> FileAddr { self.stream.position() }

    #[inline]
    pub fn seek(&mut self, position: FileAddr) { self.stream.seek(position) }

    #[inline]
    pub fn length(&self) -> FileAddr { self.stream.length() }

    #[inline]
    pub fn pointer_mode(&self) -> PointerMode { self.pointer_mode }

    #[inline]
    pub fn set_pointer_mode(&mut self, mode: PointerMode) { self.pointer_mode = mode; }

    #[inline]
    pub fn endianness(&self) -> Endianness { self.endianness }

    #[inline]
    pub fn set_endianness(&mut self, endianness: Endianness) { self.endianness = endianness; }

    pub fn push_base_offset(&mut self) {
        let position = self.position();
        self.base_offsets.push(position);
    }

    pub fn pop_base_offset(&mut self) -> FileAddr { self.base_offsets.pop().unwrap_or_default() }

    #[inline]
    pub fn base_offset(&self) -> FileAddr {
        self.base_offsets.last().copied().unwrap_or_default()
    }

    #[inline]
    pub fn write_buffer(&mut self, buffer: &[u8]) -> usize { self.stream.write_buffer(buffer) }

    fn ensure_native(&self) -> StreamResult {
        if self.endianness.is_native() { Ok(()) } else { Err(StreamError::BadFormat) }
    }

    /// Bulk copy in host byte order. Nothing is written for a foreign byte order.
    pub fn write_native_slice<T: Pod>(&mut self, values: &[T]) -> StreamResult<usize> {
        self.ensure_native()?;
        Ok(self.write_buffer(bytemuck::cast_slice(values)))
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) { self.write_buffer(&[value]); }

    #[inline]
    pub fn write_i8(&mut self, value: i8) { self.write_u8(value as u8); }

    #[inline]
    pub fn write_bool(&mut self, value: bool) { self.write_u8(value as u8); }

    write_numeric!(u16, write_u16, write_u16_le, write_u16_be);
    write_numeric!(i16, write_i16, write_i16_le, write_i16_be);
    write_numeric!(u32, write_u32, write_u32_le, write_u32_be);
    write_numeric!(i32, write_i32, write_i32_le, write_i32_be);
    write_numeric!(u64, write_u64, write_u64_le, write_u64_be);
    write_numeric!(i64, write_i64, write_i64_le, write_i64_be);
    write_numeric!(f32, write_f32, write_f32_le, write_f32_be);
    write_numeric!(f64, write_f64, write_f64_le, write_f64_be);

    pub fn write_ptr(&mut self, value: FileAddr) { self.write_ptr_with(self.pointer_mode, value) }

    fn write_ptr_with(&mut self, mode: PointerMode, value: FileAddr) {
        match mode {
            PointerMode::Mode32Bit => self.write_i32(value.get() as i32),
            PointerMode::Mode64Bit => self.write_i64(value.get()),
        }
    }

    pub fn write_size(&mut self, value: u64) {
        match self.pointer_mode {
            PointerMode::Mode32Bit => self.write_u32(value as u32),
            PointerMode::Mode64Bit => self.write_u64(value),
        }
    }

    pub fn write_vec2(&mut self, value: Vec2) {
        self.write_f32(value.x);
        self.write_f32(value.y);
    }

    pub fn write_vec3(&mut self, value: Vec3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    pub fn write_vec4(&mut self, value: Vec4) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
        self.write_f32(value.w);
    }

    pub fn write_ivec2(&mut self, value: IVec2) {
        self.write_i32(value.x);
        self.write_i32(value.y);
    }

    pub fn write_ivec3(&mut self, value: IVec3) {
        self.write_i32(value.x);
        self.write_i32(value.y);
        self.write_i32(value.z);
    }

    pub fn write_ivec4(&mut self, value: IVec4) {
        self.write_i32(value.x);
        self.write_i32(value.y);
        self.write_i32(value.z);
        self.write_i32(value.w);
    }

    pub fn write_mat3(&mut self, value: &Mat3) -> StreamResult {
        self.ensure_native()?;
        self.write_buffer(bytemuck::bytes_of(value));
        Ok(())
    }

    pub fn write_mat4(&mut self, value: &Mat4) -> StreamResult {
        self.ensure_native()?;
        self.write_buffer(bytemuck::bytes_of(value));
        Ok(())
    }

    pub fn write_sphere(&mut self, value: Sphere) {
        self.write_vec3(value.center);
        self.write_f32(value.radius);
    }

    /// Writes `value` followed by a null terminator.
    pub fn write_str(&mut self, value: &str) {
        self.write_buffer(value.as_bytes());
        self.write_u8(0);
    }

    pub fn write_padding(&mut self, size: usize, value: u8) {
        const CHUNK: usize = 64;
        let chunk = [value; CHUNK];
        let mut remaining = size;
        while remaining > 0 {
            let count = remaining.min(CHUNK);
            self.write_buffer(&chunk[..count]);
            remaining -= count;
        }
    }

    /// Pads with [`PADDING_VALUE`] up to the next multiple of `alignment`.
    pub fn write_alignment_padding(&mut self, alignment: u32) {
        if alignment == 0 {
            return;
        }
        let position = self.position().as_u64();
        let alignment = alignment as u64;
        let padding = (alignment - position % alignment) % alignment;
        self.write_padding(padding as usize, PADDING_VALUE);
    }

    /// Reserves a pointer to a null-terminated copy of `value`, written by
    /// [`flush_string_pointer_pool`](Self::flush_string_pointer_pool).
    pub fn write_str_ptr(&mut self, value: &str, alignment: u32) {
        self.string_pointer_pool.push(StringPointerEntry {
            return_address: self.position(),
            mode: self.pointer_mode,
            value: value.to_owned(),
            alignment,
        });
        self.write_ptr(FileAddr::NULL);
    }

    /// Reserves a pointer to whatever `func` writes when the pointer pool is flushed.
    /// The patched value is relative to `base_address`.
    pub fn write_func_ptr(
        &mut self,
        func: impl FnOnce(&mut StreamWriter<'s, 'f>) + 'f,
        base_address: FileAddr,
    ) {
        self.pointer_pool.push_back(FunctionPointerEntry {
            return_address: self.position(),
            base_address,
            mode: self.pointer_mode,
            func: Box::new(func),
        });
        self.write_ptr(FileAddr::NULL);
    }

    /// Reserves a pointer slot that `func` fills in itself when the delayed pool is flushed.
    pub fn write_delayed_ptr(&mut self, func: impl FnOnce(&mut StreamWriter<'s, 'f>) + 'f) {
        self.delayed_write_pool
            .push(DelayedWriteEntry { return_address: self.position(), func: Box::new(func) });
        self.write_ptr(FileAddr::NULL);
    }

    /// Appends every pending string at the end of the stream and patches its pointer.
    pub fn flush_string_pointer_pool(&mut self) {
        let pool = std::mem::take(&mut self.string_pointer_pool);
        for entry in pool {
            if self.settings.pool_strings {
                if let Some(&offset) = self.written_strings.get(&entry.value) {
                    let current = self.position();
                    self.seek(entry.return_address);
                    self.write_ptr_with(entry.mode, offset);
                    self.seek(current);
                    continue;
                }
            }

            let offset = self.length();
            self.seek(entry.return_address);
            self.write_ptr_with(entry.mode, offset);
            self.seek(offset);
            self.write_str(&entry.value);
            self.write_alignment_padding(entry.alignment);

            if self.settings.pool_strings {
                self.written_strings.insert(entry.value, offset);
            }
        }
        self.written_strings.clear();
    }

    /// Runs every pending producer at the end of the stream, in insertion order.
    /// Producers may queue further entries; those run in the same flush.
    pub fn flush_pointer_pool(&mut self) {
        while let Some(entry) = self.pointer_pool.pop_front() {
            let offset = self.position();
            self.seek(entry.return_address);
            self.write_ptr_with(entry.mode, offset - entry.base_address);
            self.seek(offset);
            (entry.func)(self);
        }
    }

    pub fn flush_delayed_write_pool(&mut self) {
        let pool = std::mem::take(&mut self.delayed_write_pool);
        for entry in pool {
            let current = self.position();
            self.seek(entry.return_address);
            (entry.func)(self);
            self.seek(current);
        }
    }
}
